use std::fmt;
use std::sync::{Arc, OnceLock};

use displ_grant::{DomId, GrantRef};
use tracing::{debug, warn};

use crate::{
    failed, CpuMapping, DrmDevice, ForeignDumbRequest, GemHandle, ImportError, ImportStage, Result,
};

/// Builds [`ZeroCopyBuffer`]s from granted guest pages.
#[derive(Clone)]
pub struct ZeroCopyImporter {
    zcopy: Arc<dyn DrmDevice>,
    card: Arc<dyn DrmDevice>,
}

impl ZeroCopyImporter {
    /// `zcopy` is the device that can wrap foreign pages, `card` the one the display uses.
    pub fn new(zcopy: Arc<dyn DrmDevice>, card: Arc<dyn DrmDevice>) -> Self {
        Self { zcopy, card }
    }

    /// Create a driver buffer backed directly by the guest pages in `refs`.
    pub fn import(
        &self,
        refs: &[GrantRef],
        width: u32,
        height: u32,
        bpp: u32,
        domid: DomId,
    ) -> Result<ZeroCopyBuffer> {
        let info = self
            .zcopy
            .create_foreign_dumb(&ForeignDumbRequest {
                domid,
                refs,
                width,
                height,
                bpp,
            })
            .map_err(|source| {
                warn!(domid, pages = refs.len(), width, height, bpp, error = %source, "foreign dumb creation refused");
                ImportError::Failed {
                    stage: ImportStage::CreateDumb,
                    source,
                }
            })?;

        debug!(
            domid,
            handle = info.handle.0,
            stride = info.stride,
            size = info.size,
            "zero-copy dumb created"
        );
        Ok(ZeroCopyBuffer {
            zcopy: self.zcopy.clone(),
            card: self.card.clone(),
            foreign: info.handle,
            local: None,
            cpu: None,
            width,
            height,
            bpp,
            stride: info.stride,
            size: info.size,
            name: OnceLock::new(),
        })
    }

    /// [`ZeroCopyImporter::import`] followed by
    /// [`ZeroCopyBuffer::export_and_import_local`]: the result is usable by the display.
    pub fn import_for_display(
        &self,
        refs: &[GrantRef],
        width: u32,
        height: u32,
        bpp: u32,
        domid: DomId,
        map_cpu: bool,
    ) -> Result<ZeroCopyBuffer> {
        self.import(refs, width, height, bpp, domid)?
            .export_and_import_local(map_cpu)
    }
}

impl fmt::Debug for ZeroCopyImporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZeroCopyImporter").finish_non_exhaustive()
    }
}

/// A GPU buffer object whose storage is the guest's own pages.
///
/// Owns up to three resources, acquired in order: the zero-copy device handle, the display
/// device handle, and a CPU mapping. They are released in the reverse order when the buffer is
/// dropped. A failed acquisition step drops the buffer, so no partially built buffer escapes.
pub struct ZeroCopyBuffer {
    zcopy: Arc<dyn DrmDevice>,
    card: Arc<dyn DrmDevice>,
    foreign: GemHandle,
    local: Option<GemHandle>,
    cpu: Option<CpuMapping>,
    width: u32,
    height: u32,
    bpp: u32,
    stride: u32,
    size: u64,
    name: OnceLock<u32>,
}

impl ZeroCopyBuffer {
    /// Move the buffer to the display device through a PRIME descriptor and optionally map it
    /// for CPU access. Steps already done are skipped.
    pub fn export_and_import_local(mut self, map_cpu: bool) -> Result<Self> {
        if self.local.is_none() {
            let fd = self
                .zcopy
                .prime_handle_to_fd(self.foreign)
                .map_err(failed(ImportStage::ExportPrime))?;
            let imported = self.card.prime_fd_to_handle(fd);
            self.zcopy.close_fd(fd);
            self.local = Some(imported.map_err(failed(ImportStage::ImportPrime))?);
        }

        if map_cpu && self.cpu.is_none() {
            let local = self.local.ok_or(ImportError::NotImported)?;
            let size = usize::try_from(self.size).map_err(|_| ImportError::Failed {
                stage: ImportStage::MapDumb,
                source: crate::DrmError::Rejected {
                    ioctl: "MODE_MAP_DUMB",
                    errno: 75, // EOVERFLOW
                },
            })?;
            self.cpu = Some(
                self.card
                    .map_dumb(local, size)
                    .map_err(failed(ImportStage::MapDumb))?,
            );
        }

        debug!(
            foreign = self.foreign.0,
            local = self.local.map(|h| h.0),
            mapped = self.cpu.is_some(),
            "zero-copy buffer imported for display"
        );
        Ok(self)
    }

    /// Global GEM name of the display-device handle. Computed on first use and cached.
    pub fn name(&self) -> Result<u32> {
        if let Some(name) = self.name.get() {
            return Ok(*name);
        }
        let local = self.local.ok_or(ImportError::NotImported)?;
        let name = self
            .card
            .gem_flink(local)
            .map_err(failed(ImportStage::Flink))?;
        Ok(*self.name.get_or_init(|| name))
    }

    /// Copy pixels out of the CPU mapping.
    pub fn read_pixels(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let mapping = self.cpu.ok_or(ImportError::NotMapped)?;
        self.card
            .read_mapping(mapping, offset, dst)
            .map_err(failed(ImportStage::ReadPixels))
    }

    pub fn foreign_handle(&self) -> GemHandle {
        self.foreign
    }

    pub fn local_handle(&self) -> Option<GemHandle> {
        self.local
    }

    pub fn is_cpu_mapped(&self) -> bool {
        self.cpu.is_some()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bpp(&self) -> u32 {
        self.bpp
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for ZeroCopyBuffer {
    fn drop(&mut self) {
        if let Some(mapping) = self.cpu.take() {
            self.card.unmap_dumb(mapping);
        }
        if let Some(local) = self.local.take() {
            self.card.gem_close(local);
        }
        self.zcopy.gem_close(self.foreign);
        debug!(handle = self.foreign.0, "zero-copy buffer released");
    }
}

impl fmt::Debug for ZeroCopyBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZeroCopyBuffer")
            .field("foreign", &self.foreign)
            .field("local", &self.local)
            .field("cpu", &self.cpu)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("size", &self.size)
            .finish()
    }
}
