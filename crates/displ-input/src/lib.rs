//! Host input to guest kbdif events.
//!
//! A [`RingEventPump`] wires the host's keyboard, pointer and touch sources (each optional) to
//! one guest input ring. Source callbacks only encode and enqueue; a single worker thread owns
//! the ring's producer index and publishes events in callback order.
#![forbid(unsafe_code)]

mod capability;
pub mod mem;
mod pump;

use displ_ring::RingError;
use thiserror::Error;

pub use capability::{
    FrameFn, InputCapabilities, InputProvider, KeyFn, Keyboard, KeyboardCallbacks, MoveFn, Pointer,
    PointerCallbacks, Touch, TouchCallbacks, TouchPointFn, TouchUpFn,
};
pub use pump::{
    EventPublisher, OverflowPolicy, PumpConfig, PumpStats, RingEventPump, DEFAULT_QUEUE_DEPTH,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("no {kind} named {id:?}")]
    UnknownDevice { kind: &'static str, id: String },

    #[error("{kind} {id:?} is unavailable: {reason}")]
    Unavailable {
        kind: &'static str,
        id: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum PumpError {
    #[error("event ring full ({capacity} slots)")]
    RingFull { capacity: u32 },

    #[error("pump is stopping")]
    Stopped,

    #[error("cannot start pump worker")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Ring(RingError),
}

impl From<RingError> for PumpError {
    fn from(err: RingError) -> Self {
        match err {
            RingError::Full { capacity } => PumpError::RingFull { capacity },
            other => PumpError::Ring(other),
        }
    }
}
