//! Event vector adapter.
//!
//! An adapter instance aggregates 64-bit objects enqueued by the application
//! into vector events bound for one event queue. Vectors are emitted when
//! they reach the configured size, when the caller bounds them with the
//! start-of-vector/end-of-vector/flush flags, or when their timeout elapses.
//!
//! Adapters are addressed by a composite id encoding the event device, the
//! target queue and a per-queue slot, and live in a process-wide registry so
//! any component can [`lookup`](VectorAdapter::lookup) a handle to a running
//! instance.

use crate::event::{EventMeta, FallbackMeta};
use crate::eventdev::{self, EventDevDriver, EventPortConf, CAP_INTERNAL_PORT, CAP_SOV_EOV};
use crate::mempool::Mempool;
use crate::sw_adapter::SwAdapter;
use crate::{Error, Result};
use lazy_static::lazy_static;
use log::{error, trace, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Enqueue flag: the first object starts a new vector. Any vector already in
/// progress is flushed first.
pub const VECTOR_ENQ_SOV: u8 = 0b0001;

/// Enqueue flag: the last object ends the vector; it is emitted even if
/// below the configured size.
pub const VECTOR_ENQ_EOV: u8 = 0b0010;

/// Enqueue flag: flush any vector in progress. With zero objects this is the
/// only action taken.
pub const VECTOR_ENQ_FLUSH: u8 = 0b0100;

/// Smallest vector size the software engine accepts.
pub const MIN_VECTOR_SZ: u16 = 4;

/// Largest vector size the software engine accepts.
pub const MAX_VECTOR_SZ: u16 = 1024;

/// Shortest vector timeout the software engine accepts, in nanoseconds.
pub const MIN_VECTOR_TIMEOUT_NS: u64 = 100_000;

/// Longest vector timeout the software engine accepts, in nanoseconds.
pub const MAX_VECTOR_TIMEOUT_NS: u64 = 1_000_000_000;

/// Adapter instances allowed per event queue.
pub const MAX_INSTANCES_PER_QUEUE: u8 = 32;

/// Configuration of one adapter instance.
#[derive(Debug, Clone)]
pub struct VectorAdapterConf {
    /// Event device to emit into.
    pub event_dev_id: u8,
    /// Socket affinity for adapter state.
    pub socket_id: i32,
    /// Template for vectorized events; `ev.queue_id` is the target queue.
    pub ev: EventMeta,
    /// Template overrides for the single-event fallback path.
    pub ev_fallback: FallbackMeta,
    /// Number of objects per vector.
    pub vector_sz: u16,
    /// Deadline for a partially filled vector, in nanoseconds.
    pub vector_timeout_ns: u64,
    /// Pool supplying vector containers.
    pub vector_mp: Mempool,
}

/// Limits and properties of a device's vector adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorAdapterInfo {
    /// Smallest supported vector size.
    pub min_vector_sz: u16,
    /// Largest supported vector size.
    pub max_vector_sz: u16,
    /// Shortest supported timeout in nanoseconds.
    pub min_vector_timeout_ns: u64,
    /// Longest supported timeout in nanoseconds.
    pub max_vector_timeout_ns: u64,
    /// Adapter instances allowed per event queue.
    pub max_vector_adapters_per_event_queue: u8,
    /// Whether the vector size must be a power of two.
    pub log2_sz: bool,
}

impl Default for VectorAdapterInfo {
    #[inline]
    fn default() -> Self {
        Self {
            min_vector_sz: MIN_VECTOR_SZ,
            max_vector_sz: MAX_VECTOR_SZ,
            min_vector_timeout_ns: MIN_VECTOR_TIMEOUT_NS,
            max_vector_timeout_ns: MAX_VECTOR_TIMEOUT_NS,
            max_vector_adapters_per_event_queue: MAX_INSTANCES_PER_QUEUE,
            log2_sz: false,
        }
    }
}

/// Monotonic counters of one adapter instance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VectorAdapterStats {
    /// Vectors emitted at full size.
    pub vectorized: u64,
    /// Vectors flushed because their timeout elapsed.
    pub vectors_timedout: u64,
    /// Vectors flushed on explicit request (SOV/EOV/FLUSH).
    pub vectors_flushed: u64,
    /// Container allocation failures that fell back to single events.
    pub alloc_failures: u64,
}

/// Per-instance adapter implementation.
///
/// The software aggregation engine is the in-crate implementation; devices
/// that aggregate internally provide their own through
/// [`EventDevDriver::create_vector_adapter`].
pub trait VectorAdapterOps: Send + Sync {
    /// Batch `objs` into the current vector, flushing as dictated by size
    /// and `flags`. Returns the number of objects consumed.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoSpace` when nothing could be consumed because the
    /// device rejected both the vector and the fallback event.
    fn enqueue(&self, objs: &[u64], flags: u8) -> Result<usize>;

    /// Tear the instance down, returning any in-progress container to its
    /// pool.
    ///
    /// # Errors
    ///
    /// Implementation specific.
    fn destroy(&self) -> Result<()>;

    /// Read the instance counters.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotSupported` when the implementation keeps none.
    fn stats_get(&self) -> Result<VectorAdapterStats> {
        Err(Error::NotSupported)
    }

    /// Zero the instance counters.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotSupported` when the implementation keeps none.
    fn stats_reset(&self) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Id of the background service backing this instance, if any.
    fn service_id(&self) -> Option<u32> {
        None
    }
}

/// State of one registry slot.
enum Slot {
    /// Free.
    Unused,
    /// Claimed by an in-flight `create`.
    Reserved,
    /// Holding a live adapter.
    InUse(Arc<AdapterData>),
}

lazy_static! {
    /// (device, queue) -> adapter slots, allocated on first use per queue.
    static ref ADAPTERS: Mutex<HashMap<(u8, u8), Vec<Slot>>> = Mutex::default();
}

/// Shared descriptor of a created adapter.
struct AdapterData {
    /// Composite adapter id.
    id: u32,
    /// Event device id.
    dev_id: u8,
    /// Target event queue.
    queue_id: u8,
    /// Slot index within the queue.
    slot: u8,
    /// Producer port used for emission.
    port_id: u16,
    /// Effective adapter capabilities.
    caps: u8,
    /// Configuration snapshot.
    conf: VectorAdapterConf,
    /// The implementation behind this instance.
    ops: Arc<dyn VectorAdapterOps>,
}

/// Handle to an adapter instance.
///
/// Handles from [`create`](Self::create)/[`create_ext`](Self::create_ext)
/// own the instance; handles from [`lookup`](Self::lookup) reference it
/// without owning it and cannot destroy it.
pub struct VectorAdapter {
    /// Shared descriptor.
    data: Arc<AdapterData>,
    /// Whether this handle may destroy the instance.
    owned: bool,
}

impl std::fmt::Debug for VectorAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorAdapter")
            .field("id", &self.data.id)
            .field("owned", &self.owned)
            .finish()
    }
}

impl VectorAdapter {
    /// Create an adapter with default port provisioning.
    ///
    /// # Errors
    ///
    /// See [`create_ext`](Self::create_ext).
    #[inline]
    pub fn create(conf: &VectorAdapterConf) -> Result<Self> {
        Self::create_ext(conf, |dev_id| default_port_conf(dev_id, None))
    }

    /// Create an adapter, provisioning the producer port with `conf_cb`.
    ///
    /// `conf_cb` is only invoked when the device lacks
    /// [`CAP_INTERNAL_PORT`]; it must return the id of a usable port.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArg` for an invalid device or out-of-envelope
    /// configuration, `Error::NoDev` when every slot of the target queue is
    /// occupied, plus anything `conf_cb` or the engine setup reports. On
    /// error no registry state survives.
    pub fn create_ext<F>(conf: &VectorAdapterConf, conf_cb: F) -> Result<Self>
    where
        F: FnOnce(u8) -> Result<u16>,
    {
        let dev = eventdev::driver(conf.event_dev_id)?;
        let info = dev.vector_limits();
        validate_conf(conf, &info, dev.as_ref())?;

        let queue_id = conf.ev.queue_id;
        let slot = reserve_slot(
            conf.event_dev_id,
            queue_id,
            info.max_vector_adapters_per_event_queue,
        )?;
        match Self::instantiate(conf, &dev, slot, conf_cb) {
            Ok(data) => {
                commit_slot(&data)?;
                trace!(
                    "created vector adapter {:#x} on dev {} queue {queue_id}",
                    data.id,
                    conf.event_dev_id
                );
                Ok(Self { data, owned: true })
            }
            Err(e) => {
                release_slot(conf.event_dev_id, queue_id, slot);
                Err(e)
            }
        }
    }

    /// Port provisioning plus engine construction; registry rollback is the
    /// caller's job.
    fn instantiate<F>(
        conf: &VectorAdapterConf,
        dev: &Arc<dyn EventDevDriver>,
        slot: u8,
        conf_cb: F,
    ) -> Result<Arc<AdapterData>>
    where
        F: FnOnce(u8) -> Result<u16>,
    {
        let dev_caps = dev.vector_adapter_caps();
        let port_id = if dev_caps & CAP_INTERNAL_PORT == 0 {
            conf_cb(conf.event_dev_id)?
        } else {
            0
        };
        let id = encode_id(conf.event_dev_id, conf.ev.queue_id, slot);
        let (ops, caps) = match dev.create_vector_adapter(conf, port_id) {
            Some(ops) => (ops?, dev_caps),
            None => {
                let sw: Arc<dyn VectorAdapterOps> =
                    SwAdapter::create(Arc::clone(dev), conf, port_id)?;
                (sw, dev_caps | CAP_SOV_EOV)
            }
        };
        Ok(Arc::new(AdapterData {
            id,
            dev_id: conf.event_dev_id,
            queue_id: conf.ev.queue_id,
            slot,
            port_id,
            caps,
            conf: conf.clone(),
            ops,
        }))
    }

    /// Attach to an existing adapter by id. The returned handle does not own
    /// the instance.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArg` if the encoded device is not registered,
    /// `Error::NoEntry` if no adapter lives at the encoded slot.
    pub fn lookup(adapter_id: u32) -> Result<Self> {
        let (dev_id, queue_id, slot) = decode_id(adapter_id);
        let _dev = eventdev::driver(dev_id)?;
        let table = ADAPTERS.lock().map_err(Error::from)?;
        let data = table
            .get(&(dev_id, queue_id))
            .and_then(|slots| slots.get(usize::from(slot)))
            .and_then(|s| match s {
                Slot::InUse(data) => Some(Arc::clone(data)),
                _ => None,
            })
            .ok_or(Error::NoEntry)?;
        Ok(Self { data, owned: false })
    }

    /// Tear the adapter down and release its slot.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArg` when called on a non-owning handle from
    /// [`lookup`](Self::lookup).
    pub fn destroy(self) -> Result<()> {
        if !self.owned {
            error!(
                "refusing to destroy vector adapter {:#x} through a lookup handle",
                self.data.id
            );
            return Err(Error::InvalidArg);
        }
        self.data.ops.destroy()?;
        release_slot(self.data.dev_id, self.data.queue_id, self.data.slot);
        trace!("destroyed vector adapter {:#x}", self.data.id);
        Ok(())
    }

    /// Batch `objs` into the current vector. `flags` is a bitmask of
    /// [`VECTOR_ENQ_SOV`], [`VECTOR_ENQ_EOV`] and [`VECTOR_ENQ_FLUSH`].
    /// Returns the number of objects consumed, which is less than
    /// `objs.len()` when the device pushed back mid-batch.
    ///
    /// # Errors
    ///
    /// `Error::NoSpace` when nothing could be consumed at all.
    pub fn enqueue(&self, objs: &[u64], flags: u8) -> Result<usize> {
        let mut flags = flags;
        if flags & (VECTOR_ENQ_SOV | VECTOR_ENQ_EOV) != 0 && self.data.caps & CAP_SOV_EOV == 0 {
            warn!(
                "event device {} ignores SOV/EOV flags",
                self.data.dev_id
            );
            flags &= !(VECTOR_ENQ_SOV | VECTOR_ENQ_EOV);
        }
        self.data.ops.enqueue(objs, flags)
    }

    /// The active configuration of this adapter.
    #[must_use]
    pub fn conf_get(&self) -> VectorAdapterConf {
        self.data.conf.clone()
    }

    /// Read the adapter counters.
    ///
    /// # Errors
    ///
    /// `Error::NotSupported` when the implementation keeps none.
    pub fn stats_get(&self) -> Result<VectorAdapterStats> {
        self.data.ops.stats_get()
    }

    /// Zero the adapter counters.
    ///
    /// # Errors
    ///
    /// `Error::NotSupported` when the implementation keeps none.
    pub fn stats_reset(&self) -> Result<()> {
        self.data.ops.stats_reset()
    }

    /// Id of the background service flushing this adapter's timed-out
    /// vectors.
    ///
    /// # Errors
    ///
    /// `Error::NoProcess` when the implementation needs no service.
    pub fn service_id_get(&self) -> Result<u32> {
        self.data.ops.service_id().ok_or(Error::NoProcess)
    }

    /// Composite adapter id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.data.id
    }

    /// Event device this adapter emits into.
    #[must_use]
    pub fn dev_id(&self) -> u8 {
        self.data.dev_id
    }

    /// Event queue this adapter emits into.
    #[must_use]
    pub fn queue_id(&self) -> u8 {
        self.data.queue_id
    }

    /// Producer port used for emission.
    #[must_use]
    pub fn port_id(&self) -> u16 {
        self.data.port_id
    }

    /// Effective capability flags of this adapter.
    #[must_use]
    pub fn caps(&self) -> u8 {
        self.data.caps
    }
}

/// Vector adapter limits of a device.
///
/// # Errors
///
/// Returns `Error::InvalidArg` if `dev_id` is not registered.
pub fn info_get(dev_id: u8) -> Result<VectorAdapterInfo> {
    let dev = eventdev::driver(dev_id)?;
    Ok(dev.vector_limits())
}

/// Effective vector adapter capabilities of a device. Devices without an
/// internal port fall back to the software engine, which honors SOV/EOV.
///
/// # Errors
///
/// Returns `Error::InvalidArg` if `dev_id` is not registered.
pub fn caps_get(dev_id: u8) -> Result<u8> {
    let dev = eventdev::driver(dev_id)?;
    let caps = dev.vector_adapter_caps();
    if caps & CAP_INTERNAL_PORT == 0 {
        Ok(caps | CAP_SOV_EOV)
    } else {
        Ok(caps)
    }
}

/// Number of free adapter slots on `queue_id` of `dev_id`.
///
/// # Errors
///
/// Returns `Error::InvalidArg` for an unregistered device or a queue the
/// device does not have.
pub fn remaining(dev_id: u8, queue_id: u8) -> Result<u8> {
    let dev = eventdev::driver(dev_id)?;
    if queue_id >= dev.nb_queues() {
        return Err(Error::InvalidArg);
    }
    let max = dev.vector_limits().max_vector_adapters_per_event_queue;
    let table = ADAPTERS.lock().map_err(Error::from)?;
    Ok(table.get(&(dev_id, queue_id)).map_or(max, |slots| {
        let free = slots.iter().filter(|s| matches!(s, Slot::Unused)).count();
        u8::try_from(free).unwrap_or(u8::MAX)
    }))
}

/// Default producer port provisioning: stop the device if it is running,
/// set up one port with `port_conf` (or defaults), restart the device if it
/// had been running, and return the new port id.
///
/// # Errors
///
/// Propagates `setup_port` and `start` failures.
pub fn default_port_conf(dev_id: u8, port_conf: Option<&EventPortConf>) -> Result<u16> {
    let dev = eventdev::driver(dev_id)?;
    let started = dev.is_started();
    if started {
        dev.stop();
    }
    let default_conf = EventPortConf::default();
    let result = dev.setup_port(port_conf.unwrap_or(&default_conf));
    if started {
        dev.start()?;
    }
    result
}

/// Check `conf` against the device's advertised envelope. Pure predicate:
/// nothing is committed before it passes.
fn validate_conf(
    conf: &VectorAdapterConf,
    info: &VectorAdapterInfo,
    dev: &dyn EventDevDriver,
) -> Result<()> {
    if conf.vector_sz < info.min_vector_sz || conf.vector_sz > info.max_vector_sz {
        error!(
            "invalid vector size {}, should be between {} and {}",
            conf.vector_sz, info.min_vector_sz, info.max_vector_sz
        );
        return Err(Error::InvalidArg);
    }
    if info.log2_sz && !conf.vector_sz.is_power_of_two() {
        error!("invalid vector size {}, should be a power of two", conf.vector_sz);
        return Err(Error::InvalidArg);
    }
    if conf.vector_timeout_ns < info.min_vector_timeout_ns
        || conf.vector_timeout_ns > info.max_vector_timeout_ns
    {
        error!(
            "invalid vector timeout {}ns, should be between {}ns and {}ns",
            conf.vector_timeout_ns, info.min_vector_timeout_ns, info.max_vector_timeout_ns
        );
        return Err(Error::InvalidArg);
    }
    if conf.ev.queue_id >= dev.nb_queues() {
        error!(
            "invalid event queue {}, device has {} queues",
            conf.ev.queue_id,
            dev.nb_queues()
        );
        return Err(Error::InvalidArg);
    }
    if conf.vector_mp.elem_capacity() < conf.vector_sz {
        error!(
            "mempool {} holds containers of {} elements, {} required",
            conf.vector_mp.name(),
            conf.vector_mp.elem_capacity(),
            conf.vector_sz
        );
        return Err(Error::InvalidArg);
    }
    Ok(())
}

fn encode_id(dev_id: u8, queue_id: u8, slot: u8) -> u32 {
    u32::from(dev_id) << 16 | u32::from(queue_id) << 8 | u32::from(slot)
}

fn decode_id(adapter_id: u32) -> (u8, u8, u8) {
    let dev_id = u8::try_from(adapter_id >> 16 & 0xff).unwrap_or(u8::MAX);
    let queue_id = u8::try_from(adapter_id >> 8 & 0xff).unwrap_or(u8::MAX);
    let slot = u8::try_from(adapter_id & 0xff).unwrap_or(u8::MAX);
    (dev_id, queue_id, slot)
}

/// Claim the first unused slot of `(dev_id, queue_id)`, allocating the
/// queue's slot table on first use.
fn reserve_slot(dev_id: u8, queue_id: u8, max: u8) -> Result<u8> {
    let mut table = ADAPTERS.lock().map_err(Error::from)?;
    let slots = table
        .entry((dev_id, queue_id))
        .or_insert_with(|| (0..max).map(|_| Slot::Unused).collect());
    for (i, slot) in slots.iter_mut().enumerate() {
        if matches!(slot, Slot::Unused) {
            *slot = Slot::Reserved;
            return Ok(u8::try_from(i).unwrap_or(u8::MAX));
        }
    }
    Err(Error::NoDev)
}

fn commit_slot(data: &Arc<AdapterData>) -> Result<()> {
    let mut table = ADAPTERS.lock().map_err(Error::from)?;
    if let Some(slot) = table
        .get_mut(&(data.dev_id, data.queue_id))
        .and_then(|slots| slots.get_mut(usize::from(data.slot)))
    {
        *slot = Slot::InUse(Arc::clone(data));
    }
    Ok(())
}

fn release_slot(dev_id: u8, queue_id: u8, slot: u8) {
    if let Ok(mut table) = ADAPTERS.lock() {
        if let Some(slot) = table
            .get_mut(&(dev_id, queue_id))
            .and_then(|slots| slots.get_mut(usize::from(slot)))
        {
            *slot = Slot::Unused;
        }
    }
}

#[cfg(test)]
mod test {
    use super::{decode_id, encode_id, validate_conf, VectorAdapterInfo};
    use crate::test_utils;
    use crate::Error;

    #[test]
    fn id_codec() {
        let id = encode_id(3, 7, 21);
        assert_eq!(id, 0x3_07_15);
        assert_eq!(decode_id(id), (3, 7, 21));
        assert_eq!(decode_id(encode_id(0xff, 0xff, 0xff)), (0xff, 0xff, 0xff));
    }

    #[test]
    fn conf_validation() {
        let (dev_id, dev) = test_utils::setup_dev(2, 64);
        let info = VectorAdapterInfo::default();

        let conf = test_utils::test_conf("mp_validation", dev_id, 8);
        assert!(validate_conf(&conf, &info, dev.as_ref()).is_ok());

        let mut bad = conf.clone();
        bad.vector_sz = 2;
        assert_eq!(
            validate_conf(&bad, &info, dev.as_ref()).unwrap_err(),
            Error::InvalidArg
        );

        let mut bad = conf.clone();
        bad.vector_timeout_ns = 1;
        assert_eq!(
            validate_conf(&bad, &info, dev.as_ref()).unwrap_err(),
            Error::InvalidArg
        );

        let mut bad = conf.clone();
        bad.ev.queue_id = 5;
        assert_eq!(
            validate_conf(&bad, &info, dev.as_ref()).unwrap_err(),
            Error::InvalidArg
        );

        // containers smaller than the requested vector size
        let mut bad = conf.clone();
        bad.vector_sz = 16;
        assert_eq!(
            validate_conf(&bad, &info, dev.as_ref()).unwrap_err(),
            Error::InvalidArg
        );

        let mut log2 = info;
        log2.log2_sz = true;
        let mut bad = conf;
        bad.vector_sz = 6;
        assert_eq!(
            validate_conf(&bad, &log2, dev.as_ref()).unwrap_err(),
            Error::InvalidArg
        );
    }
}
