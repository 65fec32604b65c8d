//! Event device contract and registry.
//!
//! The scheduler behind an event device is an external collaborator: this
//! module only models the surface the vector adapter needs. A device is
//! anything implementing [`EventDevDriver`], registered into a process-wide
//! table and addressed by a small integer id from then on.

use crate::event::Event;
use crate::vector_adapter::{VectorAdapterConf, VectorAdapterInfo, VectorAdapterOps};
use crate::{Error, Result};
use lazy_static::lazy_static;
use log::trace;
use std::sync::{Arc, RwLock};

/// Maximum number of event devices in one process.
pub const MAX_EVENT_DEVS: usize = 64;

/// Adapter capability: the device has a built-in producer port, so no port
/// provisioning callback is invoked at adapter creation.
pub const CAP_INTERNAL_PORT: u8 = 0b0001;

/// Adapter capability: the device honors start-of-vector and end-of-vector
/// enqueue flags. Without it the flags are ignored with a warning.
pub const CAP_SOV_EOV: u8 = 0b0010;

/// Configuration of a producer-side event port.
///
/// A device tracking single-link queues accounts for `single_link` ports in
/// its single-link queue count when the port is set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPortConf {
    /// Backpressure threshold for new events enqueued through this port.
    pub new_event_threshold: u32,
    /// Maximum burst the port accepts per enqueue call.
    pub enqueue_depth: u16,
    /// Maximum burst the port hands out per dequeue call.
    pub dequeue_depth: u16,
    /// Whether the port is linked to exactly one queue.
    pub single_link: bool,
}

impl Default for EventPortConf {
    #[inline]
    fn default() -> Self {
        Self {
            new_event_threshold: 4096,
            enqueue_depth: 64,
            dequeue_depth: 64,
            single_link: false,
        }
    }
}

/// The surface an event device exposes to this crate.
///
/// `enqueue_burst` drains the accepted prefix out of `events` and leaves the
/// rejected tail in place, so callers keep ownership of anything the device
/// could not take.
pub trait EventDevDriver: Send + Sync {
    /// NUMA socket the device lives on.
    fn socket_id(&self) -> i32 {
        0
    }

    /// Whether the device is currently started.
    fn is_started(&self) -> bool;

    /// Start the device.
    ///
    /// # Errors
    ///
    /// Device specific; a started device must report success.
    fn start(&self) -> Result<()>;

    /// Stop the device.
    fn stop(&self);

    /// Number of event queues configured on the device.
    fn nb_queues(&self) -> u8;

    /// Number of event ports configured on the device.
    fn nb_ports(&self) -> u16;

    /// Configure one additional event port and return its id. The device
    /// must be stopped.
    ///
    /// # Errors
    ///
    /// Returns `Error::Busy` if the device is running.
    fn setup_port(&self, conf: &EventPortConf) -> Result<u16>;

    /// Enqueue a burst of events through `port_id`. Accepted events are
    /// drained from the front of `events`; the return value is their count.
    fn enqueue_burst(&self, port_id: u16, events: &mut Vec<Event>) -> usize;

    /// Vector adapter capabilities of this device. The default advertises
    /// none, which selects the software aggregation engine.
    fn vector_adapter_caps(&self) -> u8 {
        0
    }

    /// Vector adapter limits of this device.
    fn vector_limits(&self) -> VectorAdapterInfo {
        VectorAdapterInfo::default()
    }

    /// Device-provided vector adapter implementation, for devices that
    /// aggregate internally. `None` selects the software engine.
    fn create_vector_adapter(
        &self,
        conf: &VectorAdapterConf,
        port_id: u16,
    ) -> Option<Result<Arc<dyn VectorAdapterOps>>> {
        let _ = (conf, port_id);
        None
    }
}

lazy_static! {
    /// Registered devices, indexed by device id.
    static ref DEVICES: RwLock<Vec<Option<Arc<dyn EventDevDriver>>>> = RwLock::new(Vec::new());
}

/// Register a device and return its id.
///
/// # Errors
///
/// Returns `Error::NoSpace` once [`MAX_EVENT_DEVS`] devices are registered.
pub fn register(driver: Arc<dyn EventDevDriver>) -> Result<u8> {
    let mut devs = DEVICES.write().map_err(Error::from)?;
    let slot = devs.iter().position(Option::is_none);
    let dev_id = match slot {
        Some(slot) => {
            devs[slot] = Some(driver);
            slot
        }
        None => {
            if devs.len() >= MAX_EVENT_DEVS {
                return Err(Error::NoSpace);
            }
            devs.push(Some(driver));
            devs.len() - 1
        }
    };
    trace!("registered event device {dev_id}");
    Ok(u8::try_from(dev_id).unwrap_or(u8::MAX))
}

/// Remove a device from the registry. Outstanding handles stay valid until
/// dropped.
///
/// # Errors
///
/// Returns `Error::InvalidArg` if `dev_id` does not name a registered device.
pub fn unregister(dev_id: u8) -> Result<()> {
    let mut devs = DEVICES.write().map_err(Error::from)?;
    match devs.get_mut(usize::from(dev_id)) {
        Some(slot) if slot.is_some() => {
            *slot = None;
            trace!("unregistered event device {dev_id}");
            Ok(())
        }
        _ => Err(Error::InvalidArg),
    }
}

/// Fetch the driver registered under `dev_id`.
///
/// # Errors
///
/// Returns `Error::InvalidArg` if `dev_id` does not name a registered device.
pub fn driver(dev_id: u8) -> Result<Arc<dyn EventDevDriver>> {
    let devs = DEVICES.read().map_err(Error::from)?;
    devs.get(usize::from(dev_id))
        .and_then(Clone::clone)
        .ok_or(Error::InvalidArg)
}

/// Whether `dev_id` names a registered device.
#[must_use]
pub fn is_valid(dev_id: u8) -> bool {
    driver(dev_id).is_ok()
}

#[cfg(test)]
mod test {
    use super::{driver, is_valid, register, unregister};
    use crate::ring_dev::RingDev;
    use crate::Error;
    use std::sync::Arc;

    #[test]
    fn test() {
        let dev_id = register(Arc::new(RingDev::new(2, 8))).unwrap();
        assert!(is_valid(dev_id));
        assert_eq!(driver(dev_id).unwrap().nb_queues(), 2);

        unregister(dev_id).unwrap();
        assert!(!is_valid(dev_id));
        assert_eq!(unregister(dev_id).unwrap_err(), Error::InvalidArg);
        assert_eq!(driver(dev_id).unwrap_err(), Error::InvalidArg);
    }
}
