//! Paravirtual display and input backend.
//!
//! The backend serves guest frontends over shared memory: it resolves and maps the pages a
//! guest grants it, imports display buffers into the GPU without copying when it can, and
//! pumps host input events into the guest's input ring. Each concern lives in its own crate;
//! this crate re-exports them under one roof.
//!
//! | module       | crate            |
//! |--------------|------------------|
//! | [`protocol`] | guest ABI records and constants |
//! | [`grant`]    | grant table, directory walker, mappings |
//! | [`ring`]     | event channels, event and request rings |
//! | [`gpu`]      | DRM zero-copy import |
//! | [`buffers`]  | display/frame buffer registry and display sink |
//! | [`input`]    | input sources and the ring event pump |
//! | [`session`]  | frontend state machine, frontends, configuration |
#![forbid(unsafe_code)]

pub use displ_buffers as buffers;
pub use displ_gpu as gpu;
pub use displ_grant as grant;
pub use displ_input as input;
pub use displ_protocol as protocol;
pub use displ_ring as ring;
pub use displ_session as session;

pub use displ_session::{BackendConfig, DisplayFrontend, FrontendSession, InputFrontend};
