//! Guest-visible ABI shared between the display/input backend and the paravirtualized
//! frontend drivers.
//!
//! Everything in this crate is a byte-layout contract with the guest kernel:
//! - [`kbdif`]: the virtual keyboard/pointer/touch shared page and its event records,
//! - [`displif`]: the virtual display page directory, request/response and event records,
//! - [`ring`]: the generic shared request/response ring header,
//! - [`xenbus`]: the device state values published through the control-plane store,
//! - [`fourcc`]: DRM pixel format codes used by frame buffers.
//!
//! All multi-byte fields are little-endian. Decoding never panics on guest-supplied bytes;
//! unknown tags surface as [`DecodeError`].
#![forbid(unsafe_code)]

pub mod displif;
pub mod fourcc;
pub mod kbdif;
pub mod ring;
pub mod xenbus;

use thiserror::Error;

/// Size of one hypervisor page. Grant references always name a whole page of this size.
pub const XEN_PAGE_SIZE: usize = 4096;

/// Errors decoding guest-written records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record too short: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("unknown input event type {0}")]
    UnknownEventType(u8),

    #[error("unknown multi-touch event type {0}")]
    UnknownMultiTouchType(u8),

    #[error("unknown display operation {operation:#04x} (request id {id})")]
    UnknownOperation { id: u16, operation: u8 },

    #[error("invalid xenbus state {0}")]
    InvalidState(u32),
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

pub(crate) fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    read_u32(bytes, offset) as i32
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

pub(crate) fn check_len(bytes: &[u8], expected: usize) -> Result<(), DecodeError> {
    if bytes.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            found: bytes.len(),
        });
    }
    Ok(())
}
