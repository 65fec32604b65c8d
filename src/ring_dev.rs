//! Ring-backed event device.
//!
//! `RingDev` is a simple software device mainly for testing and development.
//! Each event queue is emulated by a bounded ring: on enqueue it appends the
//! event to the target queue's ring, on dequeue it hands events back out.
//! A full ring rejects the rest of the burst, which makes downstream
//! backpressure easy to provoke in tests.

use crate::event::Event;
use crate::eventdev::{EventDevDriver, EventPortConf};
use crate::ring::Ring;
use crate::{Error, Result};
use log::trace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// A software event device backed by one ring per queue.
#[derive(Debug)]
pub struct RingDev {
    /// Whether the device is started.
    started: AtomicBool,
    /// Ports handed out so far, and how many of them are single-link.
    ports: Mutex<PortCount>,
    /// One ring per event queue.
    queues: Vec<Ring<Event>>,
}

/// Port bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
struct PortCount {
    /// Total ports configured.
    total: u16,
    /// Ports configured single-link.
    single_link: u16,
}

impl RingDev {
    /// Create a device with `nb_queues` queues of `depth` events each.
    #[must_use]
    pub fn new(nb_queues: u8, depth: usize) -> Self {
        Self {
            started: AtomicBool::new(false),
            ports: Mutex::new(PortCount::default()),
            queues: (0..nb_queues).map(|_| Ring::new(depth)).collect(),
        }
    }

    /// Drain up to `max` events from `queue_id`.
    #[must_use]
    pub fn dequeue_burst(&self, queue_id: u8, max: usize) -> Vec<Event> {
        let mut out = Vec::new();
        if let Some(ring) = self.queues.get(usize::from(queue_id)) {
            let _n = ring.dequeue_burst(&mut out, max);
        }
        out
    }

    /// Number of events waiting in `queue_id`.
    #[must_use]
    pub fn queue_len(&self, queue_id: u8) -> usize {
        self.queues
            .get(usize::from(queue_id))
            .map_or(0, Ring::len)
    }

    /// Number of single-link ports configured so far.
    #[must_use]
    pub fn nb_single_link_ports(&self) -> u16 {
        match self.ports.lock() {
            Ok(ports) => ports.single_link,
            Err(poisoned) => poisoned.into_inner().single_link,
        }
    }
}

impl EventDevDriver for RingDev {
    fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.started.store(false, Ordering::Release);
    }

    fn nb_queues(&self) -> u8 {
        u8::try_from(self.queues.len()).unwrap_or(u8::MAX)
    }

    fn nb_ports(&self) -> u16 {
        match self.ports.lock() {
            Ok(ports) => ports.total,
            Err(poisoned) => poisoned.into_inner().total,
        }
    }

    fn setup_port(&self, conf: &EventPortConf) -> Result<u16> {
        if self.is_started() {
            return Err(Error::Busy);
        }
        let mut ports = self.ports.lock().map_err(Error::from)?;
        let port_id = ports.total;
        ports.total += 1;
        if conf.single_link {
            ports.single_link += 1;
        }
        trace!("ring device port {port_id} configured");
        Ok(port_id)
    }

    fn enqueue_burst(&self, _port_id: u16, events: &mut Vec<Event>) -> usize {
        let mut accepted = 0;
        while !events.is_empty() {
            let ev = events.remove(0);
            let Some(ring) = self.queues.get(usize::from(ev.meta.queue_id)) else {
                events.insert(0, ev);
                break;
            };
            match ring.enqueue(ev) {
                Ok(()) => accepted += 1,
                Err(ev) => {
                    events.insert(0, ev);
                    break;
                }
            }
        }
        accepted
    }
}

#[cfg(test)]
mod test {
    use super::RingDev;
    use crate::event::{Event, EventMeta, EventPayload};
    use crate::eventdev::{EventDevDriver, EventPortConf};
    use crate::Error;

    fn u64_event(queue_id: u8, value: u64) -> Event {
        Event {
            meta: EventMeta {
                queue_id,
                ..EventMeta::default()
            },
            payload: EventPayload::U64(value),
        }
    }

    #[test]
    fn test() {
        let dev = RingDev::new(1, 2);
        let port = dev.setup_port(&EventPortConf::default()).unwrap();
        dev.start().unwrap();
        assert_eq!(dev.setup_port(&EventPortConf::default()).unwrap_err(), Error::Busy);

        let mut events = vec![
            u64_event(0, 1),
            u64_event(0, 2),
            u64_event(0, 3),
        ];
        // queue depth is 2, the third event is rejected
        assert_eq!(dev.enqueue_burst(port, &mut events), 2);
        assert_eq!(events.len(), 1);
        assert_eq!(dev.queue_len(0), 2);

        let drained = dev.dequeue_burst(0, 8);
        assert_eq!(drained.len(), 2);
        assert_eq!(dev.enqueue_burst(port, &mut events), 1);
        assert!(events.is_empty());
    }

    #[test]
    fn single_link_accounting() {
        let dev = RingDev::new(1, 8);
        let conf = EventPortConf {
            single_link: true,
            ..EventPortConf::default()
        };
        let _port = dev.setup_port(&conf).unwrap();
        assert_eq!(dev.nb_ports(), 1);
        assert_eq!(dev.nb_single_link_ports(), 1);
    }
}
