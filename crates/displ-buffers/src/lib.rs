//! Display buffers and frame buffers of one display frontend.
//!
//! The guest names display buffers (pixel storage backed by its granted pages) and frame buffers
//! (a format and geometry laid over one display buffer) with 64-bit cookies of its choosing.
//! [`BufferRegistry`] owns both tables, materializes the guest memory through the grant table or
//! the zero-copy importer, and hands finished frames to a [`DisplaySink`].
#![forbid(unsafe_code)]

pub mod mem;
mod registry;
mod sink;

use displ_gpu::ImportError;
use displ_grant::GrantError;
use thiserror::Error;

pub use registry::{
    BufferRegistry, CookiePolicy, DisplayBuffer, DisplayBufferInfo, DisplayBufferRequest,
    FrameBufferInfo, FrameBufferRequest,
};
pub use sink::{DisplayMode, DisplaySink, Frame, FrameBufferDesc, PixelSource, SinkError, SurfaceId};

/// Guest-chosen buffer identifier.
pub type Cookie = u64;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("no buffer with cookie {cookie:#x}")]
    NotFound { cookie: Cookie },

    #[error("frame buffer {fb_cookie:#x} refers to unknown display buffer {db_cookie:#x}")]
    UnknownDisplayBuffer { fb_cookie: Cookie, db_cookie: Cookie },

    #[error("display buffer {0:#x} already exists")]
    DuplicateCookie(Cookie),

    #[error("invalid buffer geometry {width}x{height}x{bpp}")]
    InvalidGeometry { width: u32, height: u32, bpp: u32 },

    #[error(transparent)]
    Grant(#[from] GrantError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

pub type Result<T> = std::result::Result<T, BufferError>;
