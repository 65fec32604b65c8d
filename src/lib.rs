//! A software event vector adapter.
//!
//! The adapter sits in front of an event queue and aggregates discrete 64-bit
//! object references into bounded vector events. A vector is emitted to the
//! event device when it reaches its configured size, when the caller requests
//! an explicit flush, or when its timeout elapses. Timeout flushing is handled
//! by a single shared service that every software adapter instance attaches
//! to; the surrounding runtime decides which worker polls it.
//!
//! # Examples
//!
//! Aggregating objects into vectors of four:
//!
//! ```no_run
//! use event_vector::event::{EventMeta, EventType, FallbackMeta};
//! use event_vector::mempool::Mempool;
//! use event_vector::ring_dev::RingDev;
//! use event_vector::vector_adapter::{VectorAdapter, VectorAdapterConf};
//! use event_vector::{eventdev, vector_adapter};
//! use std::sync::Arc;
//!
//! let dev_id = eventdev::register(Arc::new(RingDev::new(1, 128))).unwrap();
//! let conf = VectorAdapterConf {
//!     event_dev_id: dev_id,
//!     socket_id: 0,
//!     ev: EventMeta {
//!         event_type: EventType::CpuVector,
//!         ..EventMeta::default()
//!     },
//!     ev_fallback: FallbackMeta::default(),
//!     vector_sz: 4,
//!     vector_timeout_ns: vector_adapter::MIN_VECTOR_TIMEOUT_NS,
//!     vector_mp: Mempool::create("vectors", 16, 4, 0).unwrap(),
//! };
//! let adapter = VectorAdapter::create(&conf).unwrap();
//! let consumed = adapter.enqueue(&[1, 2, 3, 4], 0).unwrap();
//! assert_eq!(consumed, 4);
//! ```

#![deny(missing_docs, unsafe_code, unused_must_use)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use thiserror::Error as ThisError;

pub mod cycles;
pub mod event;
pub mod eventdev;
pub mod mempool;
pub mod ring;
pub mod ring_dev;
pub mod service;
mod sw_adapter;
mod test_utils;
pub mod vector_adapter;

/// Errors reported by this crate, modeled on errno values.
#[non_exhaustive]
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument (`EINVAL`).
    #[error("Invalid argument")]
    InvalidArg,
    /// Out of memory (`ENOMEM`).
    #[error("Out of memory")]
    NoMem,
    /// No space left on the target (`ENOSPC`).
    #[error("No space left on device")]
    NoSpace,
    /// No buffer available (`ENOBUFS`).
    #[error("No buffer space available")]
    NoBuf,
    /// No free device or adapter slot (`ENODEV`).
    #[error("No such device")]
    NoDev,
    /// The named object does not exist (`ENOENT`).
    #[error("No such entry")]
    NoEntry,
    /// No backing service for this handle (`ESRCH`).
    #[error("No such service")]
    NoProcess,
    /// The operation is not implemented by this device or adapter (`ENOTSUP`).
    #[error("Operation not supported")]
    NotSupported,
    /// The named object already exists (`EEXIST`).
    #[error("Already exists")]
    Exists,
    /// The target is busy and the operation cannot proceed (`EBUSY`).
    #[error("Resource busy")]
    Busy,
    /// Unclassified failure.
    #[error("Unknown error")]
    Unknown,
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The errno value this error maps to.
    #[inline]
    #[must_use]
    pub fn to_errno(self) -> i32 {
        match self {
            Error::InvalidArg => 22,
            Error::NoMem => 12,
            Error::NoSpace => 28,
            Error::NoBuf => 105,
            Error::NoDev => 19,
            Error::NoEntry => 2,
            Error::NoProcess => 3,
            Error::NotSupported => 95,
            Error::Exists => 17,
            Error::Busy => 16,
            Error::Unknown => 5,
        }
    }

    /// Build an `Error` from an errno value. Unrecognized values map to
    /// [`Error::Unknown`].
    #[inline]
    #[must_use]
    pub fn from_errno(errno: i32) -> Self {
        match errno.abs() {
            22 => Error::InvalidArg,
            12 => Error::NoMem,
            28 => Error::NoSpace,
            105 => Error::NoBuf,
            19 => Error::NoDev,
            2 => Error::NoEntry,
            3 => Error::NoProcess,
            95 => Error::NotSupported,
            17 => Error::Exists,
            16 => Error::Busy,
            _ => Error::Unknown,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    #[inline]
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::Unknown
    }
}
