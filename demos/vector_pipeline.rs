//! An example aggregating a stream of objects into vector events.

use event_vector::event::{EventMeta, EventPayload, EventType, FallbackMeta, SchedType};
use event_vector::mempool::Mempool;
use event_vector::ring_dev::RingDev;
use event_vector::service::ServiceRunner;
use event_vector::vector_adapter::{VectorAdapter, VectorAdapterConf};
use event_vector::eventdev;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::init();

    // Register a ring-backed event device with one queue.
    let dev = Arc::new(RingDev::new(1, 128));
    let driver: Arc<dyn eventdev::EventDevDriver> = Arc::clone(&dev);
    let dev_id = eventdev::register(driver).unwrap();

    // A pool of 32 containers holding 8 elements each.
    let mp = Mempool::create("demo_vectors", 32, 8, 0).unwrap();

    let conf = VectorAdapterConf {
        event_dev_id: dev_id,
        socket_id: 0,
        ev: EventMeta {
            queue_id: 0,
            priority: 64,
            sched_type: SchedType::Atomic,
            event_type: EventType::CpuVector,
            sub_event_type: 0,
            flow_id: 1,
        },
        ev_fallback: FallbackMeta::default(),
        vector_sz: 8,
        vector_timeout_ns: 1_000_000, // 1ms
        vector_mp: mp.clone(),
    };
    let adapter = VectorAdapter::create(&conf).unwrap();

    // Poll the timeout service in the background.
    let runner = ServiceRunner::start();

    // Enqueue 20 objects: two full vectors plus a remainder of four that
    // only the timeout can flush.
    let objs: Vec<u64> = (0..20).collect();
    for batch in objs.chunks(5) {
        let consumed = adapter.enqueue(batch, 0).unwrap();
        println!("enqueued {consumed} objects");
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
    runner.stop();

    // Drain the emitted vector events.
    for event in dev.dequeue_burst(0, 16) {
        if let EventPayload::Vector(v) = event.payload {
            println!("vector of {}: {:?}", v.nb_elem(), v.as_slice());
            mp.put(v);
        }
    }

    adapter.destroy().unwrap();
}
