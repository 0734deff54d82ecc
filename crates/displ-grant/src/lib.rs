//! Cross-domain page grants.
//!
//! The hypervisor's grant-table device is the only way the backend touches guest memory. It is
//! modelled by the [`GrantTable`] trait so the rest of the backend can run against the real
//! device or against [`mem::MemGrantTable`] in tests.
//!
//! - [`walker::resolve_directory`] turns a guest-built page directory into a flat, validated
//!   list of grant references.
//! - [`GrantMapping`] maps such a list as one logically contiguous region and unmaps it exactly
//!   once when dropped.
#![forbid(unsafe_code)]

mod mapping;
pub mod mem;
pub mod walker;

use core::fmt;

use thiserror::Error;

pub use displ_protocol::XEN_PAGE_SIZE;
pub use mapping::GrantMapping;
pub use walker::{page_count, resolve_directory, MAX_BUFFER_SIZE};

/// Hypervisor domain identifier.
pub type DomId = u16;

/// A guest-issued grant reference naming one page of guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GrantRef(pub u32);

impl fmt::Display for GrantRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gref:{}", self.0)
    }
}

/// Opaque handle of one page currently mapped into the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageHandle(pub u64);

/// Errors reported by a [`GrantTable`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrantTableError {
    #[error("domain {domid} refused to map {gref}")]
    Refused { domid: DomId, gref: GrantRef },

    #[error("stale page handle {0:?}")]
    StaleHandle(PageHandle),

    #[error("page access out of range: offset={offset} len={len}")]
    OutOfRange { offset: usize, len: usize },
}

/// Errors surfaced by directory resolution and grant mappings.
#[derive(Debug, Error)]
pub enum GrantError {
    #[error("invalid grant directory at {head}: {reason}")]
    InvalidDirectory { head: GrantRef, reason: &'static str },

    #[error("failed to map {gref} from domain {domid}")]
    MapFailed {
        domid: DomId,
        gref: GrantRef,
        #[source]
        source: GrantTableError,
    },

    #[error("no grant references to map")]
    Empty,

    #[error("mapping access out of bounds: offset={offset} len={len} size={size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("grant table access failed: {0}")]
    Access(#[from] GrantTableError),
}

pub type Result<T> = std::result::Result<T, GrantError>;

/// Host grant-table primitive.
///
/// Every successful [`GrantTable::map_page`] must be paired with exactly one
/// [`GrantTable::unmap_page`]. Page accesses are bounded by [`XEN_PAGE_SIZE`].
pub trait GrantTable: Send + Sync {
    fn map_page(&self, domid: DomId, gref: GrantRef) -> std::result::Result<PageHandle, GrantTableError>;

    fn unmap_page(&self, page: PageHandle);

    fn read_page(
        &self,
        page: PageHandle,
        offset: usize,
        dst: &mut [u8],
    ) -> std::result::Result<(), GrantTableError>;

    fn write_page(
        &self,
        page: PageHandle,
        offset: usize,
        src: &[u8],
    ) -> std::result::Result<(), GrantTableError>;
}

pub(crate) fn check_page_range(
    offset: usize,
    len: usize,
) -> std::result::Result<(), GrantTableError> {
    match offset.checked_add(len) {
        Some(end) if end <= XEN_PAGE_SIZE => Ok(()),
        _ => Err(GrantTableError::OutOfRange { offset, len }),
    }
}
