#![cfg(test)]

use crate::event::{EventMeta, EventType, FallbackMeta, SchedType};
use crate::eventdev;
use crate::mempool::Mempool;
use crate::ring_dev::RingDev;
use crate::vector_adapter::{VectorAdapterConf, MAX_VECTOR_TIMEOUT_NS};
use std::sync::Arc;

/// Register a fresh ring-backed device and return its id and handle.
pub(crate) fn setup_dev(nb_queues: u8, depth: usize) -> (u8, Arc<RingDev>) {
    let dev = Arc::new(RingDev::new(nb_queues, depth));
    let driver: Arc<dyn eventdev::EventDevDriver> = Arc::clone(&dev);
    let dev_id = eventdev::register(driver).expect("device registry full");
    (dev_id, dev)
}

/// A valid adapter configuration backed by a fresh pool named `mp_name`.
///
/// The timeout defaults to the maximum so concurrently running reaper
/// passes never flush a test's partial vector early.
pub(crate) fn test_conf(mp_name: &str, dev_id: u8, vector_sz: u16) -> VectorAdapterConf {
    let mp = Mempool::create(mp_name, 8, vector_sz, 0).expect("pool name collision");
    VectorAdapterConf {
        event_dev_id: dev_id,
        socket_id: 0,
        ev: EventMeta {
            queue_id: 0,
            priority: 64,
            sched_type: SchedType::Atomic,
            event_type: EventType::CpuVector,
            sub_event_type: 1,
            flow_id: 0xbeef,
        },
        ev_fallback: FallbackMeta {
            event_type: EventType::Cpu,
            sub_event_type: 7,
            flow_id: 0xdead,
        },
        vector_sz,
        vector_timeout_ns: MAX_VECTOR_TIMEOUT_NS,
        vector_mp: mp,
    }
}
