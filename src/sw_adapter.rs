//! Software aggregation engine and timeout reaper.
//!
//! One `SwAdapter` exists per adapter instance created on a device without a
//! built-in aggregator. All mutation of the in-progress vector goes through
//! a single per-instance lock; the enqueue path takes it blocking, the
//! reaper only ever tries it and defers to its next pass when the instance
//! is busy.
//!
//! Timeout tracking is shared process-wide: the first engine instance
//! registers one service and one ring of pending instances, every later
//! instance attaches to them. Instances that leave a partial vector behind
//! push themselves onto the ring; the service flushes them once their
//! timeout elapses, parking the ones it cannot flush yet in a small bounded
//! pending list.

use crate::cycles;
use crate::event::{Event, EventMeta, EventPayload, EventVector};
use crate::eventdev::EventDevDriver;
use crate::mempool::Mempool;
use crate::ring::Ring;
use crate::service;
use crate::vector_adapter::{
    VectorAdapterConf, VectorAdapterOps, VectorAdapterStats, VECTOR_ENQ_EOV, VECTOR_ENQ_FLUSH,
    VECTOR_ENQ_SOV,
};
use crate::{Error, Result};
use lazy_static::lazy_static;
use log::{error, trace};
use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Capacity of the shared instance-tracking ring.
const ADAPTER_RING_SIZE: usize = 1024;

/// Slots in the pending retry list.
const PENDING_LIST_SIZE: usize = 32;

/// Instances drained from the ring per service iteration.
const REAP_BURST: usize = 16;

/// Registered name of the shared reaper service.
const SERVICE_NAME: &str = "evt_vector_adapter";

/// Plumbing shared by every software adapter in the process.
struct SwShared {
    /// Instances with a partial vector outstanding.
    ring: Ring<Arc<SwAdapter>>,
    /// Instances whose flush must be retried; touched only by the reaper.
    pending: Mutex<Vec<Option<Arc<SwAdapter>>>>,
}

lazy_static! {
    /// Service id plus shared plumbing, created by the first engine.
    static ref SW_DATA: Mutex<Option<(u32, Arc<SwShared>)>> = Mutex::default();
}

/// Attach to the shared plumbing, creating it on first use.
fn shared_data() -> Result<(u32, Arc<SwShared>)> {
    let mut guard = SW_DATA.lock().map_err(Error::from)?;
    if let Some((id, data)) = guard.as_ref() {
        return Ok((*id, Arc::clone(data)));
    }
    let data = Arc::new(SwShared {
        ring: Ring::new(ADAPTER_RING_SIZE),
        pending: Mutex::new((0..PENDING_LIST_SIZE).map(|_| None).collect()),
    });
    let reaped = Arc::clone(&data);
    let id = service::register(SERVICE_NAME, Box::new(move || reap(&reaped)))?;
    *guard = Some((id, Arc::clone(&data)));
    trace!("vector adapter reaper registered as service {id}");
    Ok((id, data))
}

/// Mutable engine state, guarded by the per-instance lock.
struct SwState {
    /// The vector being filled, if any.
    vector: Option<EventVector>,
    /// Tick of the last enqueue or flush on this instance.
    tstamp: u64,
    /// Whether the reaper currently tracks this instance.
    tracked: bool,
    /// Instance counters.
    stats: VectorAdapterStats,
}

/// Software aggregation engine for one adapter instance.
pub(crate) struct SwAdapter {
    /// Device events are emitted into.
    dev: Arc<dyn EventDevDriver>,
    /// Device id, for diagnostics.
    dev_id: u8,
    /// Producer port used for emission.
    port_id: u16,
    /// Template applied to vector events.
    ev: EventMeta,
    /// Template applied to fallback single events.
    ev_fallback: EventMeta,
    /// Vector timeout converted to ticks once at creation.
    timeout_ticks: u64,
    /// Pool supplying vector containers.
    mp: Mempool,
    /// Shared reaper plumbing.
    shared: Arc<SwShared>,
    /// Id of the shared reaper service.
    service_id: u32,
    /// Set by destroy; stragglers in the ring are skipped.
    destroyed: AtomicBool,
    /// Self-reference so the engine can push itself onto the ring.
    me: Weak<SwAdapter>,
    /// The per-instance lock.
    state: Mutex<SwState>,
}

impl SwAdapter {
    /// Build the engine for one adapter instance.
    pub(crate) fn create(
        dev: Arc<dyn EventDevDriver>,
        conf: &VectorAdapterConf,
        port_id: u16,
    ) -> Result<Arc<Self>> {
        let (service_id, shared) = shared_data()?;
        let mut ev_fallback = conf.ev;
        ev_fallback.event_type = conf.ev_fallback.event_type;
        ev_fallback.sub_event_type = conf.ev_fallback.sub_event_type;
        ev_fallback.flow_id = conf.ev_fallback.flow_id;
        Ok(Arc::new_cyclic(|me| Self {
            dev,
            dev_id: conf.event_dev_id,
            port_id,
            ev: conf.ev,
            ev_fallback,
            timeout_ticks: cycles::ns_to_cycles(conf.vector_timeout_ns),
            mp: conf.vector_mp.clone(),
            shared,
            service_id,
            destroyed: AtomicBool::new(false),
            me: me.clone(),
            state: Mutex::new(SwState {
                vector: None,
                tstamp: 0,
                tracked: false,
                stats: VectorAdapterStats::default(),
            }),
        }))
    }

    /// Hand the in-progress vector to the device. On rejection the container
    /// is kept for a later retry; on success the engine never references it
    /// again.
    fn try_flush(&self, st: &mut SwState) -> Result<()> {
        let vector = match st.vector.take() {
            Some(vector) => vector,
            None => return Ok(()),
        };
        let mut events = vec![Event {
            meta: self.ev,
            payload: EventPayload::Vector(vector),
        }];
        if self.dev.enqueue_burst(self.port_id, &mut events) == 1 {
            st.tstamp = cycles::cycles();
            st.tracked = false;
            Ok(())
        } else {
            if let Some(Event {
                payload: EventPayload::Vector(vector),
                ..
            }) = events.pop()
            {
                st.vector = Some(vector);
            }
            Err(Error::NoSpace)
        }
    }

    /// Flush and retry until the device accepts; counts one forced flush.
    fn force_flush(&self, st: &mut SwState) {
        while st.vector.is_some() {
            match self.try_flush(st) {
                Ok(()) => {
                    st.stats.vectors_flushed += 1;
                    return;
                }
                Err(_) => hint::spin_loop(),
            }
        }
    }

    /// Emit one object as a plain event through the fallback template.
    fn emit_fallback(&self, obj: u64) -> Result<()> {
        let mut events = vec![Event {
            meta: self.ev_fallback,
            payload: EventPayload::U64(obj),
        }];
        if self.dev.enqueue_burst(self.port_id, &mut events) == 1 {
            Ok(())
        } else {
            Err(Error::NoSpace)
        }
    }

    /// Hand timing responsibility for the current partial vector to the
    /// shared ring, unless the reaper already tracks this instance.
    fn track(&self, st: &mut SwState) {
        if st.tracked {
            return;
        }
        if let Some(me) = self.me.upgrade() {
            match self.shared.ring.enqueue(me) {
                Ok(()) => st.tracked = true,
                Err(_) => error!(
                    "vector adapter tracking ring full, timeout flush of dev {} port {} delayed",
                    self.dev_id, self.port_id
                ),
            }
        }
    }
}

impl VectorAdapterOps for SwAdapter {
    fn enqueue(&self, objs: &[u64], flags: u8) -> Result<usize> {
        if self.destroyed.load(Ordering::Acquire) {
            error!(
                "vector adapter on dev {} port {} used after destroy",
                self.dev_id, self.port_id
            );
            return Ok(0);
        }
        let mut st = self.state.lock().map_err(Error::from)?;

        if objs.is_empty() {
            if flags & VECTOR_ENQ_FLUSH != 0
                && st.vector.is_some()
                && self.try_flush(&mut st).is_ok()
            {
                st.stats.vectors_flushed += 1;
            }
            return Ok(0);
        }

        if flags & VECTOR_ENQ_SOV != 0 && st.vector.is_some() {
            self.force_flush(&mut st);
        }

        let mut consumed = 0;
        while consumed < objs.len() {
            if st.vector.is_none() {
                match self.mp.get() {
                    Ok(mut vector) => {
                        vector.reset();
                        st.vector = Some(vector);
                    }
                    Err(_) => match self.emit_fallback(objs[consumed]) {
                        Ok(()) => {
                            st.stats.alloc_failures += 1;
                            consumed += 1;
                            continue;
                        }
                        Err(e) => {
                            if consumed == 0 {
                                return Err(e);
                            }
                            return Ok(consumed);
                        }
                    },
                }
            }
            let (copied, full) = match st.vector.as_mut() {
                Some(vector) => {
                    let n = vector.push_slice(&objs[consumed..]);
                    (n, vector.is_full())
                }
                None => (0, false),
            };
            consumed += copied;
            if full {
                match self.try_flush(&mut st) {
                    Ok(()) => st.stats.vectorized += 1,
                    // device pushed back, keep the filled vector for retry
                    Err(_) => break,
                }
            }
        }

        if flags & (VECTOR_ENQ_EOV | VECTOR_ENQ_FLUSH) != 0 && st.vector.is_some() {
            self.force_flush(&mut st);
        }

        if st.vector.is_some() {
            st.tstamp = cycles::cycles();
            self.track(&mut st);
        }
        Ok(consumed)
    }

    fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::Release);
        let mut st = self.state.lock().map_err(Error::from)?;
        if let Some(vector) = st.vector.take() {
            self.mp.put(vector);
        }
        st.tracked = false;
        Ok(())
    }

    fn stats_get(&self) -> Result<VectorAdapterStats> {
        Ok(self.state.lock().map_err(Error::from)?.stats)
    }

    fn stats_reset(&self) -> Result<()> {
        self.state.lock().map_err(Error::from)?.stats = VectorAdapterStats::default();
        Ok(())
    }

    fn service_id(&self) -> Option<u32> {
        Some(self.service_id)
    }
}

/// One reaper pass: retry the pending list, then drain a burst from the
/// ring. Runs under the service's non-reentrancy guard.
fn reap(shared: &SwShared) {
    let mut pending = match shared.pending.lock() {
        Ok(pending) => pending,
        Err(poisoned) => poisoned.into_inner(),
    };

    for slot in pending.iter_mut() {
        let done = match slot {
            Some(adapter) => reap_one(adapter),
            None => false,
        };
        if done {
            *slot = None;
        }
    }

    let mut burst = Vec::with_capacity(REAP_BURST);
    let _n = shared.ring.dequeue_burst(&mut burst, REAP_BURST);
    for adapter in burst {
        if !reap_one(&adapter) {
            pending_add(&mut pending, adapter);
        }
    }
}

/// Returns `true` when `adapter` no longer needs tracking: its vector is
/// gone, it was destroyed, or its timed-out vector was flushed here.
fn reap_one(adapter: &Arc<SwAdapter>) -> bool {
    if adapter.destroyed.load(Ordering::Acquire) {
        return true;
    }
    match adapter.state.try_lock() {
        Ok(mut st) => {
            if st.vector.is_none() {
                // flushed through the enqueue path in the meantime
                st.tracked = false;
                return true;
            }
            if cycles::cycles().wrapping_sub(st.tstamp) < adapter.timeout_ticks {
                return false;
            }
            match adapter.try_flush(&mut st) {
                Ok(()) => {
                    st.stats.vectors_timedout += 1;
                    true
                }
                Err(_) => false,
            }
        }
        Err(_) => false,
    }
}

/// Park `adapter` for the next pass. The list is a hard bound: when it is
/// full the instance is dropped from tracking and a later enqueue on it
/// re-arms the timeout.
fn pending_add(pending: &mut [Option<Arc<SwAdapter>>], adapter: Arc<SwAdapter>) {
    // the ring may deliver an instance that is already parked
    if pending
        .iter()
        .flatten()
        .any(|parked| Arc::ptr_eq(parked, &adapter))
    {
        return;
    }
    for slot in pending.iter_mut() {
        if slot.is_none() {
            *slot = Some(adapter);
            return;
        }
    }
    if let Ok(mut st) = adapter.state.try_lock() {
        st.tracked = false;
    }
    error!(
        "vector adapter pending list full, dropping timeout tracking for dev {} port {}",
        adapter.dev_id, adapter.port_id
    );
}
