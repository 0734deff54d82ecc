//! Shared-memory rings between the backend and a guest frontend.
//!
//! - [`EventRing`]: backend-produced event page (kbdif input events, displif page-flip events).
//!   The backend owns the producer index; the guest owns the consumer index.
//! - [`RequestRing`]: the backend half of a request/response ring (displif requests).
//! - [`FrontRing`]: the frontend half, for tooling and tests that play the guest.
//!
//! Guest-owned indices are re-validated on every access; a guest that moves them outside the
//! ring's capacity gets [`RingError::Corrupt`], never an out-of-bounds slot access.
#![forbid(unsafe_code)]

mod channel;
mod event_ring;
mod front;
mod request_ring;

use thiserror::Error;

pub use channel::{ChannelError, CountingChannelFactory, CountingEventChannel, EventChannel, EventChannelFactory};
pub use event_ring::{EventRing, EventRingLayout};
pub use front::FrontRing;
pub use request_ring::RequestRing;

use displ_grant::GrantError;

#[derive(Debug, Error)]
pub enum RingError {
    #[error("ring full ({capacity} slots in use)")]
    Full { capacity: u32 },

    #[error("ring indices corrupt: producer={prod} consumer={cons} capacity={capacity}")]
    Corrupt { prod: u32, cons: u32, capacity: u32 },

    #[error("record is {found} bytes, ring slots are {expected}")]
    RecordSize { expected: usize, found: usize },

    #[error("ring page does not fit the layout")]
    BadLayout,

    #[error(transparent)]
    Grant(#[from] GrantError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub type Result<T> = std::result::Result<T, RingError>;
