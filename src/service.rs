//! Cooperative service registry and runner.
//!
//! A service is a callback that does a bounded amount of work per
//! invocation. Components register services; the surrounding runtime decides
//! who polls them and at what cadence, either by calling [`run_iter`]
//! directly or by starting a [`ServiceRunner`]. A service callback is never
//! run reentrantly: a second `run_iter` while one is in flight reports
//! `Error::Busy`.

use crate::{Error, Result};
use lazy_static::lazy_static;
use log::trace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError};
use tokio::task::{self, JoinHandle};

/// Maximum number of registered services.
pub const MAX_SERVICES: usize = 64;

/// A registered service.
struct Service {
    /// Human-readable name, for diagnostics.
    name: String,
    /// The work function.
    cb: Box<dyn Fn() + Send + Sync>,
    /// Held while an iteration runs.
    exec: Mutex<()>,
}

lazy_static! {
    /// Registered services, indexed by service id.
    static ref SERVICES: RwLock<Vec<Option<Arc<Service>>>> = RwLock::new(Vec::new());
}

/// Register a service and return its id.
///
/// # Errors
///
/// Returns `Error::NoSpace` once [`MAX_SERVICES`] services are registered.
pub fn register(name: &str, cb: Box<dyn Fn() + Send + Sync>) -> Result<u32> {
    let service = Arc::new(Service {
        name: name.to_owned(),
        cb,
        exec: Mutex::new(()),
    });
    let mut services = SERVICES.write().map_err(Error::from)?;
    let slot = services.iter().position(Option::is_none);
    let id = match slot {
        Some(slot) => {
            services[slot] = Some(service);
            slot
        }
        None => {
            if services.len() >= MAX_SERVICES {
                return Err(Error::NoSpace);
            }
            services.push(Some(service));
            services.len() - 1
        }
    };
    trace!("registered service {name} as {id}");
    Ok(u32::try_from(id).unwrap_or(u32::MAX))
}

/// Remove a service from the registry.
///
/// # Errors
///
/// Returns `Error::NoEntry` if `id` does not name a registered service.
pub fn unregister(id: u32) -> Result<()> {
    let mut services = SERVICES.write().map_err(Error::from)?;
    match services.get_mut(id as usize) {
        Some(slot) if slot.is_some() => {
            *slot = None;
            Ok(())
        }
        _ => Err(Error::NoEntry),
    }
}

/// Name of the service registered under `id`.
///
/// # Errors
///
/// Returns `Error::NoEntry` if `id` does not name a registered service.
pub fn name(id: u32) -> Result<String> {
    Ok(lookup(id)?.name.clone())
}

/// Run one iteration of service `id` on the calling thread.
///
/// # Errors
///
/// Returns `Error::NoEntry` for an unknown id and `Error::Busy` if an
/// iteration of this service is already in flight elsewhere.
pub fn run_iter(id: u32) -> Result<()> {
    let service = lookup(id)?;
    match service.exec.try_lock() {
        Ok(_guard) => {
            (service.cb)();
            Ok(())
        }
        Err(TryLockError::WouldBlock) => Err(Error::Busy),
        Err(TryLockError::Poisoned(_)) => Err(Error::Unknown),
    }
}

/// Ids of all registered services.
#[must_use]
pub fn ids() -> Vec<u32> {
    match SERVICES.read() {
        Ok(services) => services
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| u32::try_from(i).unwrap_or(u32::MAX))
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn lookup(id: u32) -> Result<Arc<Service>> {
    let services = SERVICES.read().map_err(Error::from)?;
    services
        .get(id as usize)
        .and_then(Clone::clone)
        .ok_or(Error::NoEntry)
}

/// Polls every registered service in a loop until stopped.
///
/// Must be started from within a tokio runtime; the loop runs on a blocking
/// task so service callbacks may block briefly without starving the runtime.
#[derive(Debug)]
pub struct ServiceRunner {
    /// Cleared to stop the polling loop.
    running: Arc<AtomicBool>,
    /// The polling task.
    _handle: JoinHandle<()>,
}

impl ServiceRunner {
    /// Start polling all registered services.
    #[must_use]
    pub fn start() -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = task::spawn_blocking(move || {
            while flag.load(Ordering::Acquire) {
                for id in ids() {
                    let _ = run_iter(id);
                }
                std::thread::yield_now();
            }
        });
        Self {
            running,
            _handle: handle,
        }
    }

    /// Stop the polling loop. Safe to call more than once.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl Drop for ServiceRunner {
    fn drop(&mut self) {
        self.stop();
    }
}
