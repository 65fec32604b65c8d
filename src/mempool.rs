//! Vector container pool.
//!
//! A mempool is a named allocator of fixed-capacity [`EventVector`]
//! containers. All containers are pre-allocated at creation time; `get`
//! removes one from the free store and `put` returns it. Pools are looked up
//! by name through a process-wide registry, so independent components can
//! attach to the same pool without passing handles around.

use crate::event::EventVector;
use crate::{Error, Result};
use lazy_static::lazy_static;
use log::trace;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, Weak};

lazy_static! {
    /// name -> pool, weakly held so a pool dies with its last handle.
    static ref MEMPOOLS: Mutex<HashMap<String, Weak<MempoolInner>>> = Mutex::default();
}

/// A named pool of pre-allocated vector containers.
#[derive(Debug, Clone)]
pub struct Mempool {
    /// An `Arc` pointer to `MempoolInner`.
    inner: Arc<MempoolInner>,
}

impl Mempool {
    /// Create a new pool named `name` holding `n` containers of `nb_elem`
    /// elements each.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArg` if `n` or `nb_elem` is zero, and
    /// `Error::Exists` if a pool with this name is still alive.
    #[inline]
    pub fn create(name: &str, n: u32, nb_elem: u16, socket_id: i32) -> Result<Self> {
        let inner = MempoolInner::create(name, n, nb_elem, socket_id)?;
        Ok(Self { inner })
    }

    /// Search a pool by its name.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoEntry` if no pool with this name is alive.
    #[inline]
    pub fn lookup(name: &str) -> Result<Self> {
        let inner = MempoolInner::lookup(name)?;
        Ok(Self { inner })
    }

    /// Take one container from the pool.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoEntry` if the pool is exhausted.
    #[inline]
    pub fn get(&self) -> Result<EventVector> {
        self.inner.get()
    }

    /// Return a container to the pool.
    #[inline]
    pub fn put(&self, vector: EventVector) {
        self.inner.put(vector);
    }

    /// Number of containers currently in the pool.
    #[must_use]
    #[inline]
    pub fn available(&self) -> u32 {
        self.inner.avail_count()
    }

    /// Number of containers which have been taken from the pool.
    #[must_use]
    #[inline]
    pub fn in_use(&self) -> u32 {
        self.inner.size - self.inner.avail_count()
    }

    /// Test if the pool is empty.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Test if the pool is full.
    #[must_use]
    #[inline]
    pub fn is_full(&self) -> bool {
        self.available() == self.inner.size
    }

    /// Element capacity of each container in this pool.
    #[must_use]
    #[inline]
    pub fn elem_capacity(&self) -> u16 {
        self.inner.nb_elem
    }

    /// Name of the pool.
    #[must_use]
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Socket the pool was created for.
    #[must_use]
    #[inline]
    pub fn socket_id(&self) -> i32 {
        self.inner.socket_id
    }
}

/// Pool state shared by every handle.
struct MempoolInner {
    /// Registered pool name.
    name: String,
    /// Total number of containers.
    size: u32,
    /// Element capacity of each container.
    nb_elem: u16,
    /// Socket affinity, informational.
    socket_id: i32,
    /// Free containers.
    free: Mutex<Vec<EventVector>>,
}

impl Debug for MempoolInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mempool")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for MempoolInner {
    fn drop(&mut self) {
        if let Ok(mut pools) = MEMPOOLS.lock() {
            let _prev = pools.remove(&self.name);
        }
    }
}

impl MempoolInner {
    fn create(name: &str, n: u32, nb_elem: u16, socket_id: i32) -> Result<Arc<Self>> {
        if n == 0 || nb_elem == 0 {
            return Err(Error::InvalidArg);
        }
        let mut pools = MEMPOOLS.lock().map_err(Error::from)?;
        if pools.get(name).and_then(Weak::upgrade).is_some() {
            return Err(Error::Exists);
        }
        let free = (0..n).map(|_| EventVector::with_capacity(nb_elem)).collect();
        let inner = Arc::new(Self {
            name: name.to_owned(),
            size: n,
            nb_elem,
            socket_id,
            free: Mutex::new(free),
        });
        let _prev = pools.insert(name.to_owned(), Arc::downgrade(&inner));
        trace!("created mempool {name}: {n} containers of {nb_elem} elements");
        Ok(inner)
    }

    fn lookup(name: &str) -> Result<Arc<Self>> {
        let pools = MEMPOOLS.lock().map_err(Error::from)?;
        pools
            .get(name)
            .and_then(Weak::upgrade)
            .ok_or(Error::NoEntry)
    }

    fn get(&self) -> Result<EventVector> {
        let mut free = self.free.lock().map_err(Error::from)?;
        free.pop().ok_or(Error::NoEntry)
    }

    fn put(&self, vector: EventVector) {
        debug_assert_eq!(vector.capacity(), self.nb_elem);
        if let Ok(mut free) = self.free.lock() {
            debug_assert!(free.len() < self.size as usize);
            free.push(vector);
        }
    }

    fn avail_count(&self) -> u32 {
        match self.free.lock() {
            Ok(free) => u32::try_from(free.len()).unwrap_or(u32::MAX),
            Err(poisoned) => u32::try_from(poisoned.into_inner().len()).unwrap_or(u32::MAX),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Mempool;
    use crate::Error;

    #[test]
    fn test() {
        let mp = Mempool::create("mempool_test", 64, 16, 0).unwrap();
        assert!(mp.is_full());
        assert_eq!(mp.in_use(), 0);
        assert_eq!(mp.available(), 64);
        assert_eq!(mp.elem_capacity(), 16);

        let mp1 = Mempool::lookup("mempool_test").unwrap();
        assert!(mp1.is_full());
        assert_eq!(mp1.available(), 64);

        let v = mp.get().unwrap();
        assert_eq!(v.capacity(), 16);
        assert_eq!(mp.available(), 63);
        assert_eq!(mp1.in_use(), 1);
        mp1.put(v);
        assert!(mp.is_full());
    }

    #[test]
    fn exhaustion() {
        let mp = Mempool::create("mempool_exhaustion", 1, 4, 0).unwrap();
        let v = mp.get().unwrap();
        assert!(mp.is_empty());
        assert_eq!(mp.get().unwrap_err(), Error::NoEntry);
        mp.put(v);
        assert!(mp.get().is_ok());
    }

    #[test]
    fn lifecycle() {
        assert!(Mempool::create("mempool_dup", 1, 1, 0).is_ok());
        // previous handle already dropped, the name is free again
        let mp = Mempool::create("mempool_dup", 2, 2, 0).unwrap();
        assert_eq!(
            Mempool::create("mempool_dup", 2, 2, 0).unwrap_err(),
            Error::Exists
        );
        assert_eq!(Mempool::lookup("mempool_missing").unwrap_err(), Error::NoEntry);
        assert_eq!(Mempool::create("mempool_zero", 0, 4, 0).unwrap_err(), Error::InvalidArg);
        drop(mp);
        assert_eq!(Mempool::lookup("mempool_dup").unwrap_err(), Error::NoEntry);
    }
}
