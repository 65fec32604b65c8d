//! Monotonic tick counter.
//!
//! Timeouts in this crate are data-driven deadlines: a vector's age is the
//! difference between the current tick count and the tick recorded when the
//! vector was last touched. The counter is read from a process-wide monotonic
//! clock, so comparing ticks never involves wall-clock syscalls or timezone
//! state.

use lazy_static::lazy_static;
use std::time::Instant;

lazy_static! {
    /// Captured on first use; all tick values are offsets from this point.
    static ref EPOCH: Instant = Instant::now();
}

/// Nanoseconds per second.
const NS_PER_S: u64 = 1_000_000_000;

/// Tick frequency in Hz.
#[inline]
#[must_use]
pub fn hz() -> u64 {
    NS_PER_S
}

/// Ticks elapsed since the counter was first read in this process.
#[inline]
#[must_use]
pub fn cycles() -> u64 {
    u64::try_from(EPOCH.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Convert a nanosecond interval to ticks, saturating on overflow.
#[inline]
#[must_use]
pub fn ns_to_cycles(ns: u64) -> u64 {
    let ticks = u128::from(ns) * u128::from(hz()) / u128::from(NS_PER_S);
    u64::try_from(ticks).unwrap_or(u64::MAX)
}
