//! Zero-copy import of guest pages into GPU buffer objects.
//!
//! Two DRM devices are involved: the Xen zero-copy helper device, which can build a dumb buffer
//! directly on top of granted guest pages, and the display card, which the compositor can scan
//! out from. A buffer created on the first is moved to the second through a PRIME descriptor.
//! The ioctl surface is the [`DrmDevice`] trait; [`soft::SoftDrmHost`] implements it in memory.
#![forbid(unsafe_code)]

mod importer;
pub mod soft;

use core::fmt;

use displ_grant::{DomId, GrantRef};
use thiserror::Error;

pub use importer::{ZeroCopyBuffer, ZeroCopyImporter};

/// GEM handle, local to one DRM device file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GemHandle(pub u32);

/// PRIME (dma-buf) file descriptor used to move a buffer between devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrimeFd(pub i32);

/// A CPU mapping of a dumb buffer (`MODE_MAP_DUMB` + `mmap`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuMapping {
    pub id: u64,
    pub size: usize,
}

/// Parameters of `DRM_IOCTL_XEN_ZCOPY_CREATE_DUMB`.
#[derive(Debug, Clone, Copy)]
pub struct ForeignDumbRequest<'a> {
    pub domid: DomId,
    pub refs: &'a [GrantRef],
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
}

/// What the driver reports back for a new dumb buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbInfo {
    pub handle: GemHandle,
    pub stride: u32,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DrmError {
    #[error("{ioctl} failed: errno {errno}")]
    Rejected { ioctl: &'static str, errno: i32 },
}

/// The ioctl contract the importer needs from a DRM device.
///
/// Release calls (`gem_close`, `close_fd`, `unmap_dumb`) cannot fail from the caller's point of
/// view; implementations log and move on.
pub trait DrmDevice: Send + Sync {
    fn create_foreign_dumb(&self, req: &ForeignDumbRequest<'_>) -> std::result::Result<DumbInfo, DrmError>;

    fn prime_handle_to_fd(&self, handle: GemHandle) -> std::result::Result<PrimeFd, DrmError>;

    fn prime_fd_to_handle(&self, fd: PrimeFd) -> std::result::Result<GemHandle, DrmError>;

    fn close_fd(&self, fd: PrimeFd);

    fn map_dumb(&self, handle: GemHandle, size: usize) -> std::result::Result<CpuMapping, DrmError>;

    fn unmap_dumb(&self, mapping: CpuMapping);

    fn read_mapping(&self, mapping: CpuMapping, offset: usize, dst: &mut [u8]) -> std::result::Result<(), DrmError>;

    fn gem_flink(&self, handle: GemHandle) -> std::result::Result<u32, DrmError>;

    fn gem_close(&self, handle: GemHandle);
}

/// The acquisition step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStage {
    CreateDumb,
    ExportPrime,
    ImportPrime,
    MapDumb,
    Flink,
    ReadPixels,
}

impl fmt::Display for ImportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImportStage::CreateDumb => "create foreign dumb buffer",
            ImportStage::ExportPrime => "export prime descriptor",
            ImportStage::ImportPrime => "import prime descriptor",
            ImportStage::MapDumb => "map dumb buffer",
            ImportStage::Flink => "flink",
            ImportStage::ReadPixels => "read pixels",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("zero-copy import failed at {stage}: {source}")]
    Failed {
        stage: ImportStage,
        #[source]
        source: DrmError,
    },

    #[error("buffer has not been imported into the display device")]
    NotImported,

    #[error("buffer has no CPU mapping")]
    NotMapped,
}

pub type Result<T> = std::result::Result<T, ImportError>;

pub(crate) fn failed(stage: ImportStage) -> impl FnOnce(DrmError) -> ImportError {
    move |source| ImportError::Failed { stage, source }
}
