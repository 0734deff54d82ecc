//! Shared request/response ring header (`xen/io/ring.h`).
//!
//! One granted page holds a 64-byte header followed by a power-of-two number of slots. Each
//! slot is a union of one request and one response, so the slot size is the larger of the two.
//! Indices are free-running `u32`s; slot position is `idx & (entries - 1)`.

use crate::XEN_PAGE_SIZE;

pub const REQ_PROD: usize = 0;
pub const REQ_EVENT: usize = 4;
pub const RSP_PROD: usize = 8;
pub const RSP_EVENT: usize = 12;

/// Slots start after the header and its padding.
pub const RING_ENTRIES_OFFSET: usize = 64;

/// Number of slots of `slot_size` bytes that fit in one page, rounded down to a power of two.
pub const fn ring_entries(slot_size: usize) -> usize {
    if slot_size == 0 || slot_size > XEN_PAGE_SIZE - RING_ENTRIES_OFFSET {
        return 0;
    }
    let raw = (XEN_PAGE_SIZE - RING_ENTRIES_OFFSET) / slot_size;
    1 << (usize::BITS - 1 - raw.leading_zeros())
}

pub const fn slot_offset(index: u32, entries: usize, slot_size: usize) -> usize {
    RING_ENTRIES_OFFSET + (index as usize & (entries - 1)) * slot_size
}
