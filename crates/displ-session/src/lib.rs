//! Per-frontend connection handling.
//!
//! A [`FrontendSession`] follows one guest device through the XenBus state handshake in the
//! control-plane store and binds a [`FrontendHandler`] once the frontend has published its ring
//! details. Two handlers are provided:
//! - [`InputFrontend`] (vkbd): maps the shared input page and runs a `RingEventPump` fed by
//!   host input sources.
//! - [`DisplayFrontend`] (vdispl): maps each connector's request and event rings and services
//!   buffer requests through a `BufferRegistry`.
#![forbid(unsafe_code)]

mod config;
mod display;
mod identity;
mod input;
mod session;
mod store;

use displ_buffers::BufferError;
use displ_grant::GrantError;
use displ_input::{InputError, PumpError};
use displ_ring::{ChannelError, RingError};
use thiserror::Error;

pub use config::{BackendConfig, ConfigError};
pub use display::{request_status, DisplayFrontend};
pub use identity::{parse_identity, DeviceIdentity};
pub use input::InputFrontend;
pub use session::{FrontendHandler, FrontendSession, SessionContext};
pub use store::{ControlPlaneStore, MemStore, StoreError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid device identity {identity:?}: {reason}")]
    InvalidIdentity { identity: String, reason: String },

    #[error("missing control-plane key {0}")]
    MissingKey(String),

    #[error("invalid value {value:?} at {path}")]
    InvalidValue { path: String, value: String },

    #[error("frontend at {0} publishes no connectors")]
    NoConnectors(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Grant(#[from] GrantError),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Pump(#[from] PumpError),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

pub type Result<T> = std::result::Result<T, SessionError>;
