#![cfg(test)]

use event_vector::event::{Event, EventMeta, EventPayload, EventType, FallbackMeta, SchedType};
use event_vector::mempool::Mempool;
use event_vector::ring_dev::RingDev;
use event_vector::vector_adapter::{
    self, VectorAdapter, VectorAdapterConf, MAX_VECTOR_TIMEOUT_NS, MIN_VECTOR_TIMEOUT_NS,
    VECTOR_ENQ_EOV, VECTOR_ENQ_FLUSH, VECTOR_ENQ_SOV,
};
use event_vector::{eventdev, service, Error};
use std::sync::Arc;

/// Register a fresh ring-backed device with one queue of `depth` events.
fn setup_dev(depth: usize) -> (u8, Arc<RingDev>) {
    let dev = Arc::new(RingDev::new(1, depth));
    let driver: Arc<dyn eventdev::EventDevDriver> = Arc::clone(&dev);
    let dev_id = eventdev::register(driver).unwrap();
    (dev_id, dev)
}

/// A valid configuration backed by a fresh pool. The timeout defaults to
/// the maximum so concurrent reaper passes never flush early.
fn conf(mp_name: &str, dev_id: u8, vector_sz: u16) -> VectorAdapterConf {
    VectorAdapterConf {
        event_dev_id: dev_id,
        socket_id: 0,
        ev: EventMeta {
            queue_id: 0,
            priority: 64,
            sched_type: SchedType::Atomic,
            event_type: EventType::CpuVector,
            sub_event_type: 3,
            flow_id: 0xbeef,
        },
        ev_fallback: FallbackMeta {
            event_type: EventType::Cpu,
            sub_event_type: 9,
            flow_id: 0xdead,
        },
        vector_sz,
        vector_timeout_ns: MAX_VECTOR_TIMEOUT_NS,
        vector_mp: Mempool::create(mp_name, 8, vector_sz, 0).unwrap(),
    }
}

/// Pull the vector payload out of an emitted event.
fn vector_elems(event: &Event) -> Vec<u64> {
    match &event.payload {
        EventPayload::Vector(v) => v.as_slice().to_vec(),
        other => panic!("expected vector payload, got {other:?}"),
    }
}

/// Return emitted containers to their pool so engines can reuse them.
fn recycle(events: Vec<Event>, mp: &Mempool) {
    for event in events {
        if let EventPayload::Vector(v) = event.payload {
            mp.put(v);
        }
    }
}

/// The reaper service is shared process-wide; iterate until `done` holds.
fn reap_until(service_id: u32, mut done: impl FnMut() -> bool) {
    for _ in 0..64 {
        match service::run_iter(service_id) {
            Ok(()) | Err(Error::Busy) => {}
            Err(e) => panic!("reaper failed: {e}"),
        }
        if done() {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    panic!("reaper did not converge");
}

mod size_triggered_flush {
    use super::*;

    #[test]
    fn test() {
        let (dev_id, dev) = setup_dev(64);
        let conf = conf("mp_size_flush", dev_id, 4);
        let adapter = VectorAdapter::create(&conf).unwrap();

        assert_eq!(adapter.enqueue(&[1, 2, 3, 4], 0).unwrap(), 4);
        let events = dev.dequeue_burst(0, 8);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].meta, conf.ev);
        assert_eq!(vector_elems(&events[0]), vec![1, 2, 3, 4]);

        let stats = adapter.stats_get().unwrap();
        assert_eq!(stats.vectorized, 1);
        assert_eq!(stats.vectors_flushed, 0);
        assert_eq!(stats.vectors_timedout, 0);
        assert_eq!(stats.alloc_failures, 0);

        recycle(events, &conf.vector_mp);
        adapter.destroy().unwrap();
    }
}

mod partial_then_timeout {
    use super::*;

    #[test]
    fn test() {
        let (dev_id, dev) = setup_dev(64);
        let mut conf = conf("mp_timeout", dev_id, 4);
        conf.vector_timeout_ns = MIN_VECTOR_TIMEOUT_NS;
        let adapter = VectorAdapter::create(&conf).unwrap();
        let service_id = adapter.service_id_get().unwrap();

        assert_eq!(adapter.enqueue(&[7, 8], 0).unwrap(), 2);
        assert_eq!(dev.queue_len(0), 0);

        // outlive the 100us deadline, then let the reaper run
        std::thread::sleep(std::time::Duration::from_millis(2));
        reap_until(service_id, || dev.queue_len(0) == 1);

        let events = dev.dequeue_burst(0, 8);
        assert_eq!(vector_elems(&events[0]), vec![7, 8]);
        let stats = adapter.stats_get().unwrap();
        assert_eq!(stats.vectors_timedout, 1);
        assert_eq!(stats.vectorized, 0);

        recycle(events, &conf.vector_mp);
        adapter.destroy().unwrap();
    }
}

mod sov_flushes_prior_vector {
    use super::*;

    #[test]
    fn test() {
        let (dev_id, dev) = setup_dev(64);
        let conf = conf("mp_sov", dev_id, 4);
        let adapter = VectorAdapter::create(&conf).unwrap();

        assert_eq!(adapter.enqueue(&[1, 2], 0).unwrap(), 2);
        assert_eq!(adapter.enqueue(&[10, 11], VECTOR_ENQ_SOV).unwrap(), 2);

        // the old partial vector went out, the new one is still aggregating
        let events = dev.dequeue_burst(0, 8);
        assert_eq!(events.len(), 1);
        assert_eq!(vector_elems(&events[0]), vec![1, 2]);
        let stats = adapter.stats_get().unwrap();
        assert_eq!(stats.vectors_flushed, 1);

        // the fresh vector keeps aggregating to full size
        assert_eq!(adapter.enqueue(&[12, 13], 0).unwrap(), 2);
        let events2 = dev.dequeue_burst(0, 8);
        assert_eq!(vector_elems(&events2[0]), vec![10, 11, 12, 13]);
        assert_eq!(adapter.stats_get().unwrap().vectorized, 1);

        recycle(events, &conf.vector_mp);
        recycle(events2, &conf.vector_mp);
        adapter.destroy().unwrap();
    }
}

mod eov_forces_partial_emission {
    use super::*;

    #[test]
    fn test() {
        let (dev_id, dev) = setup_dev(64);
        let conf = conf("mp_eov", dev_id, 8);
        let adapter = VectorAdapter::create(&conf).unwrap();

        assert_eq!(adapter.enqueue(&[5, 6, 7], VECTOR_ENQ_EOV).unwrap(), 3);
        let events = dev.dequeue_burst(0, 8);
        assert_eq!(events.len(), 1);
        assert_eq!(vector_elems(&events[0]), vec![5, 6, 7]);

        let stats = adapter.stats_get().unwrap();
        assert_eq!(stats.vectors_flushed, 1);
        assert_eq!(stats.vectorized, 0);

        recycle(events, &conf.vector_mp);
        adapter.destroy().unwrap();
    }
}

mod flush_only_is_idempotent_when_empty {
    use super::*;

    #[test]
    fn test() {
        let (dev_id, dev) = setup_dev(64);
        let conf = conf("mp_flush_noop", dev_id, 4);
        let adapter = VectorAdapter::create(&conf).unwrap();

        assert_eq!(adapter.enqueue(&[], VECTOR_ENQ_FLUSH).unwrap(), 0);
        assert_eq!(adapter.enqueue(&[], VECTOR_ENQ_FLUSH).unwrap(), 0);
        assert_eq!(adapter.enqueue(&[], 0).unwrap(), 0);

        assert_eq!(dev.queue_len(0), 0);
        assert_eq!(adapter.stats_get().unwrap(), Default::default());
        adapter.destroy().unwrap();
    }
}

mod alloc_failure_falls_back_to_single_events {
    use super::*;

    #[test]
    fn test() {
        let (dev_id, dev) = setup_dev(64);
        let conf = conf("mp_fallback", dev_id, 4);
        let adapter = VectorAdapter::create(&conf).unwrap();

        // hold every container so the engine cannot allocate
        let held: Vec<_> = (0..conf.vector_mp.available())
            .map(|_| conf.vector_mp.get().unwrap())
            .collect();
        assert!(conf.vector_mp.is_empty());

        assert_eq!(adapter.enqueue(&[42], 0).unwrap(), 1);
        let events = dev.dequeue_burst(0, 8);
        assert_eq!(events.len(), 1);
        // tagged with the fallback template, not the vector template
        assert_eq!(events[0].meta.event_type, EventType::Cpu);
        assert_eq!(events[0].meta.sub_event_type, conf.ev_fallback.sub_event_type);
        assert_eq!(events[0].meta.flow_id, conf.ev_fallback.flow_id);
        assert_eq!(events[0].meta.queue_id, conf.ev.queue_id);
        match events[0].payload {
            EventPayload::U64(v) => assert_eq!(v, 42),
            ref other => panic!("expected single event, got {other:?}"),
        }
        assert_eq!(adapter.stats_get().unwrap().alloc_failures, 1);

        for v in held {
            conf.vector_mp.put(v);
        }
        adapter.destroy().unwrap();
    }
}

mod conf_round_trip {
    use super::*;

    #[test]
    fn test() {
        let (dev_id, _dev) = setup_dev(64);
        let conf = conf("mp_round_trip", dev_id, 16);
        let adapter = VectorAdapter::create(&conf).unwrap();

        let got = adapter.conf_get();
        assert_eq!(got.event_dev_id, conf.event_dev_id);
        assert_eq!(got.socket_id, conf.socket_id);
        assert_eq!(got.ev, conf.ev);
        assert_eq!(got.ev_fallback, conf.ev_fallback);
        assert_eq!(got.vector_sz, conf.vector_sz);
        assert_eq!(got.vector_timeout_ns, conf.vector_timeout_ns);
        assert_eq!(got.vector_mp.name(), conf.vector_mp.name());
        adapter.destroy().unwrap();
    }
}

mod capacity_bound {
    use super::*;

    #[test]
    fn test() {
        let (dev_id, _dev) = setup_dev(64);
        let base = conf("mp_capacity", dev_id, 4);
        let max = vector_adapter::info_get(dev_id)
            .unwrap()
            .max_vector_adapters_per_event_queue;

        assert_eq!(vector_adapter::remaining(dev_id, 0).unwrap(), max);

        let mut adapters = Vec::new();
        for i in 0..max {
            adapters.push(VectorAdapter::create(&base).unwrap());
            assert_eq!(
                vector_adapter::remaining(dev_id, 0).unwrap(),
                max - i - 1
            );
        }

        // every slot taken
        assert_eq!(
            VectorAdapter::create(&base).unwrap_err(),
            Error::NoDev
        );

        for (i, adapter) in adapters.into_iter().enumerate() {
            adapter.destroy().unwrap();
            let i = u8::try_from(i).unwrap();
            assert_eq!(vector_adapter::remaining(dev_id, 0).unwrap(), i + 1);
        }
    }
}

mod concrete_scenario {
    use super::*;

    /// vector_sz=4: [1,2,3] aggregates silently, [4,5] completes one vector
    /// and starts the next, FLUSH emits the remainder.
    #[test]
    fn test() {
        let (dev_id, dev) = setup_dev(64);
        let conf = conf("mp_scenario", dev_id, 4);
        let adapter = VectorAdapter::create(&conf).unwrap();

        assert_eq!(adapter.enqueue(&[1, 2, 3], 0).unwrap(), 3);
        assert_eq!(dev.queue_len(0), 0);

        assert_eq!(adapter.enqueue(&[4, 5], 0).unwrap(), 2);
        let events = dev.dequeue_burst(0, 8);
        assert_eq!(events.len(), 1);
        assert_eq!(vector_elems(&events[0]), vec![1, 2, 3, 4]);

        assert_eq!(adapter.enqueue(&[], VECTOR_ENQ_FLUSH).unwrap(), 0);
        let events2 = dev.dequeue_burst(0, 8);
        assert_eq!(events2.len(), 1);
        assert_eq!(vector_elems(&events2[0]), vec![5]);

        let stats = adapter.stats_get().unwrap();
        assert_eq!(stats.vectorized, 1);
        assert_eq!(stats.vectors_flushed, 1);
        assert_eq!(stats.vectors_timedout, 0);
        assert_eq!(stats.alloc_failures, 0);

        recycle(events, &conf.vector_mp);
        recycle(events2, &conf.vector_mp);
        adapter.destroy().unwrap();
    }
}

mod backpressure_retains_vector {
    use super::*;

    #[test]
    fn test() {
        // room for a single event only
        let (dev_id, dev) = setup_dev(1);
        let mut conf = conf("mp_backpressure", dev_id, 4);
        conf.vector_timeout_ns = MIN_VECTOR_TIMEOUT_NS;
        let adapter = VectorAdapter::create(&conf).unwrap();
        let service_id = adapter.service_id_get().unwrap();

        // first full vector goes through and fills the device
        assert_eq!(adapter.enqueue(&[1, 2, 3, 4], 0).unwrap(), 4);
        assert_eq!(dev.queue_len(0), 1);

        // second full vector is rejected downstream but stays consumed
        assert_eq!(adapter.enqueue(&[5, 6, 7, 8], 0).unwrap(), 4);
        assert_eq!(adapter.stats_get().unwrap().vectorized, 1);

        // drain, wait out the deadline, and let the reaper retry
        let first = dev.dequeue_burst(0, 8);
        assert_eq!(vector_elems(&first[0]), vec![1, 2, 3, 4]);
        std::thread::sleep(std::time::Duration::from_millis(2));
        reap_until(service_id, || dev.queue_len(0) == 1);

        let second = dev.dequeue_burst(0, 8);
        assert_eq!(vector_elems(&second[0]), vec![5, 6, 7, 8]);
        assert_eq!(adapter.stats_get().unwrap().vectors_timedout, 1);

        recycle(first, &conf.vector_mp);
        recycle(second, &conf.vector_mp);
        adapter.destroy().unwrap();
    }
}

mod lookup_and_ownership {
    use super::*;

    #[test]
    fn test() {
        let (dev_id, dev) = setup_dev(64);
        let conf = conf("mp_lookup", dev_id, 4);
        let adapter = VectorAdapter::create(&conf).unwrap();

        let attached = VectorAdapter::lookup(adapter.id()).unwrap();
        assert_eq!(attached.id(), adapter.id());
        assert_eq!(attached.conf_get().vector_sz, 4);

        // the attached handle can enqueue but not destroy
        assert_eq!(attached.enqueue(&[1, 2, 3, 4], 0).unwrap(), 4);
        let events = dev.dequeue_burst(0, 8);
        assert_eq!(events.len(), 1);
        assert_eq!(attached.destroy().unwrap_err(), Error::InvalidArg);

        let attached = VectorAdapter::lookup(adapter.id()).unwrap();
        let id = adapter.id();
        adapter.destroy().unwrap();
        assert_eq!(VectorAdapter::lookup(id).unwrap_err(), Error::NoEntry);

        // enqueue through the stale handle is a safe no-op
        assert_eq!(attached.enqueue(&[9], 0).unwrap(), 0);

        recycle(events, &conf.vector_mp);
    }
}

mod create_validation {
    use super::*;

    #[test]
    fn test() {
        let (dev_id, _dev) = setup_dev(64);
        let base = conf("mp_create_validation", dev_id, 4);

        assert_eq!(
            VectorAdapter::create(&VectorAdapterConf {
                event_dev_id: 201,
                ..base.clone()
            })
            .unwrap_err(),
            Error::InvalidArg
        );

        let mut bad = base.clone();
        bad.vector_sz = 2;
        assert_eq!(VectorAdapter::create(&bad).unwrap_err(), Error::InvalidArg);

        let mut bad = base.clone();
        bad.vector_timeout_ns = 10;
        assert_eq!(VectorAdapter::create(&bad).unwrap_err(), Error::InvalidArg);

        let mut bad = base;
        bad.ev.queue_id = 3;
        assert_eq!(VectorAdapter::create(&bad).unwrap_err(), Error::InvalidArg);

        // nothing leaked into the registry
        let max = vector_adapter::info_get(dev_id)
            .unwrap()
            .max_vector_adapters_per_event_queue;
        assert_eq!(vector_adapter::remaining(dev_id, 0).unwrap(), max);
    }
}

mod device_surface {
    use super::*;

    #[test]
    fn test() {
        let (dev_id, dev) = setup_dev(64);

        let caps = vector_adapter::caps_get(dev_id).unwrap();
        assert_eq!(caps & eventdev::CAP_INTERNAL_PORT, 0);
        assert_ne!(caps & eventdev::CAP_SOV_EOV, 0);

        let info = vector_adapter::info_get(dev_id).unwrap();
        assert!(info.min_vector_sz <= info.max_vector_sz);
        assert!(!info.log2_sz);

        // create provisions a producer port on the portless device
        assert_eq!(dev.nb_ports(), 0);
        let conf = conf("mp_device_surface", dev_id, 4);
        let adapter = VectorAdapter::create(&conf).unwrap();
        assert_eq!(dev.nb_ports(), 1);
        assert_eq!(adapter.port_id(), 0);
        assert_eq!(service::name(adapter.service_id_get().unwrap()).unwrap(), "evt_vector_adapter");
        adapter.destroy().unwrap();
    }
}

mod stats_reset {
    use super::*;

    #[test]
    fn test() {
        let (dev_id, dev) = setup_dev(64);
        let conf = conf("mp_stats_reset", dev_id, 4);
        let adapter = VectorAdapter::create(&conf).unwrap();

        assert_eq!(adapter.enqueue(&[1, 2, 3, 4], 0).unwrap(), 4);
        assert_eq!(adapter.stats_get().unwrap().vectorized, 1);
        adapter.stats_reset().unwrap();
        assert_eq!(adapter.stats_get().unwrap(), Default::default());

        recycle(dev.dequeue_burst(0, 8), &conf.vector_mp);
        adapter.destroy().unwrap();
    }
}
