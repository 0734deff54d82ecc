use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use displ_gpu::{ZeroCopyBuffer, ZeroCopyImporter};
use displ_grant::{resolve_directory, DomId, GrantMapping, GrantRef, GrantTable, MAX_BUFFER_SIZE};
use displ_protocol::fourcc;
use tracing::{debug, warn};

use crate::{
    BufferError, Cookie, DisplayMode, DisplaySink, Frame, FrameBufferDesc, PixelSource, Result,
    SurfaceId,
};

/// What happens when the guest creates a display buffer under a cookie that is still live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CookiePolicy {
    /// Release the old buffer and install the new one.
    #[default]
    Replace,
    /// Fail with [`BufferError::DuplicateCookie`] and keep the old buffer.
    Reject,
}

/// `DBUF_CREATE` parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayBufferRequest {
    pub cookie: Cookie,
    pub directory: GrantRef,
    pub size: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
}

/// `FB_ATTACH` parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBufferRequest {
    pub db_cookie: Cookie,
    pub fb_cookie: Cookie,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayBufferInfo {
    pub cookie: Cookie,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    /// Size declared by the guest.
    pub size: u32,
    pub stride: u32,
    pub pages: usize,
    pub zero_copy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBufferInfo {
    pub cookie: Cookie,
    pub db_cookie: Cookie,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
}

enum Backing {
    /// Guest pages mapped into the backend, copied into a local store before presenting.
    Copy { mapping: GrantMapping, store: Vec<u8> },
    /// Guest pages handed straight to the GPU driver.
    ZeroCopy(ZeroCopyBuffer),
}

/// A live display buffer. Only reachable through the registry while its lock is held.
pub struct DisplayBuffer {
    cookie: Cookie,
    width: u32,
    height: u32,
    bpp: u32,
    size: u32,
    stride: u32,
    pages: usize,
    backing: Backing,
}

impl DisplayBuffer {
    pub fn info(&self) -> DisplayBufferInfo {
        DisplayBufferInfo {
            cookie: self.cookie,
            width: self.width,
            height: self.height,
            bpp: self.bpp,
            size: self.size,
            stride: self.stride,
            pages: self.pages,
            zero_copy: self.is_zero_copy(),
        }
    }

    pub fn is_zero_copy(&self) -> bool {
        matches!(self.backing, Backing::ZeroCopy(_))
    }

    /// The backend-local pixel store of a copy-path buffer.
    pub fn local_store(&self) -> Option<&[u8]> {
        match &self.backing {
            Backing::Copy { store, .. } => Some(store),
            Backing::ZeroCopy(_) => None,
        }
    }

    pub fn zero_copy(&self) -> Option<&ZeroCopyBuffer> {
        match &self.backing {
            Backing::ZeroCopy(buffer) => Some(buffer),
            Backing::Copy { .. } => None,
        }
    }

    fn pixel_source(&self, needs_cpu: bool) -> Result<PixelSource> {
        Ok(match &self.backing {
            Backing::Copy { store, .. } => PixelSource::Cpu {
                size: store.len(),
                stride: self.stride,
            },
            Backing::ZeroCopy(buffer) if needs_cpu => PixelSource::Cpu {
                size: buffer.size() as usize,
                stride: self.stride,
            },
            Backing::ZeroCopy(buffer) => PixelSource::Gpu {
                name: buffer.name()?,
                stride: self.stride,
            },
        })
    }

    /// Copy guest pixels into the local store. Returns the number of bytes copied; zero-copy
    /// buffers have nothing to copy.
    fn copy_from_guest(&mut self, fb: &FrameBufferInfo) -> Result<usize> {
        let declared = self.size as usize;
        let implied = frame_buffer_bytes(fb, self.bpp);
        match &mut self.backing {
            Backing::ZeroCopy(_) => Ok(0),
            Backing::Copy { mapping, store } => {
                let n = store.len().min(declared).min(mapping.size()).min(implied);
                mapping.read_at(0, &mut store[..n])?;
                Ok(n)
            }
        }
    }
}

impl fmt::Debug for DisplayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayBuffer").field("info", &self.info()).finish()
    }
}

/// Bytes a frame buffer's geometry covers, using the format's pixel size or, for formats the
/// table does not know, the display buffer's.
fn frame_buffer_bytes(fb: &FrameBufferInfo, db_bpp: u32) -> usize {
    let bytes_pp = fourcc::bytes_per_pixel(fb.pixel_format).unwrap_or_else(|| db_bpp.div_ceil(8));
    (fb.width as usize)
        .saturating_mul(bytes_pp as usize)
        .saturating_mul(fb.height as usize)
}

/// Stride and size of a `width x height x bpp` buffer, if the geometry is acceptable.
fn geometry(width: u32, height: u32, bpp: u32) -> Option<(u32, usize)> {
    if width == 0 || height == 0 || bpp == 0 || bpp > 32 {
        return None;
    }
    let stride = width.checked_mul(bpp.div_ceil(8))?;
    let size = stride.checked_mul(height)?;
    (size <= MAX_BUFFER_SIZE).then_some((stride, size as usize))
}

struct FrameBuffer {
    info: FrameBufferInfo,
    surface: SurfaceId,
}

#[derive(Default)]
struct Tables {
    display: HashMap<Cookie, DisplayBuffer>,
    frame: HashMap<Cookie, FrameBuffer>,
}

/// Display and frame buffers of one frontend, keyed by guest cookies.
///
/// Both tables sit behind one lock. Guest memory is resolved and imported before the lock is
/// taken; the insertion (and removal of whatever it replaces) is a single locked step, and
/// replaced or destroyed buffers are released after the lock is dropped.
pub struct BufferRegistry {
    domid: DomId,
    grants: Arc<dyn GrantTable>,
    importer: Option<ZeroCopyImporter>,
    sink: Arc<dyn DisplaySink>,
    policy: CookiePolicy,
    map_cpu: bool,
    tables: Mutex<Tables>,
}

impl BufferRegistry {
    /// A registry that maps guest pages and copies them for the sink.
    pub fn new(domid: DomId, grants: Arc<dyn GrantTable>, sink: Arc<dyn DisplaySink>) -> Self {
        Self {
            domid,
            grants,
            importer: None,
            sink,
            policy: CookiePolicy::default(),
            map_cpu: false,
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Import display buffers with `importer` instead of mapping and copying them.
    pub fn with_importer(mut self, importer: ZeroCopyImporter) -> Self {
        self.importer = Some(importer);
        self
    }

    pub fn with_cookie_policy(mut self, policy: CookiePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Also map zero-copy buffers for CPU access when the sink does not require it.
    pub fn with_cpu_mapping(mut self, map_cpu: bool) -> Self {
        self.map_cpu = map_cpu;
        self
    }

    pub fn domid(&self) -> DomId {
        self.domid
    }

    pub fn is_zero_copy(&self) -> bool {
        self.importer.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn create_display_buffer(&self, req: &DisplayBufferRequest) -> Result<DisplayBufferInfo> {
        let DisplayBufferRequest {
            cookie,
            directory,
            size,
            width,
            height,
            bpp,
        } = *req;

        if self.policy == CookiePolicy::Reject && self.lock().display.contains_key(&cookie) {
            warn!(domid = self.domid, cookie, "display buffer cookie already in use");
            return Err(BufferError::DuplicateCookie(cookie));
        }

        let (stride, local_size) = geometry(width, height, bpp).ok_or_else(|| {
            warn!(domid = self.domid, cookie, width, height, bpp, "rejecting display buffer geometry");
            BufferError::InvalidGeometry { width, height, bpp }
        })?;

        let refs = resolve_directory(self.grants.as_ref(), self.domid, directory, size)?;
        let pages = refs.len();
        let (backing, stride) = match &self.importer {
            Some(importer) => {
                let buffer = importer.import_for_display(
                    &refs,
                    width,
                    height,
                    bpp,
                    self.domid,
                    self.map_cpu || self.sink.needs_cpu_access(),
                )?;
                let stride = buffer.stride();
                (Backing::ZeroCopy(buffer), stride)
            }
            None => {
                let mapping = GrantMapping::map(self.grants.clone(), self.domid, refs)?;
                let store = vec![0u8; local_size];
                (Backing::Copy { mapping, store }, stride)
            }
        };

        let buffer = DisplayBuffer {
            cookie,
            width,
            height,
            bpp,
            size,
            stride,
            pages,
            backing,
        };
        let info = buffer.info();

        let replaced = {
            let mut tables = self.lock();
            if self.policy == CookiePolicy::Reject && tables.display.contains_key(&cookie) {
                warn!(domid = self.domid, cookie, "display buffer cookie raced into use");
                return Err(BufferError::DuplicateCookie(cookie));
            }
            tables.display.insert(cookie, buffer)
        };
        if replaced.is_some() {
            debug!(domid = self.domid, cookie, "display buffer replaced");
        }
        drop(replaced);

        debug!(
            domid = self.domid,
            cookie,
            width,
            height,
            bpp,
            pages,
            zero_copy = info.zero_copy,
            "display buffer created"
        );
        Ok(info)
    }

    pub fn create_frame_buffer(&self, req: &FrameBufferRequest) -> Result<FrameBufferInfo> {
        let needs_cpu = self.sink.needs_cpu_access();
        let mut tables = self.lock();
        let Some(db) = tables.display.get(&req.db_cookie) else {
            warn!(
                domid = self.domid,
                fb_cookie = req.fb_cookie,
                db_cookie = req.db_cookie,
                "frame buffer attach to unknown display buffer"
            );
            return Err(BufferError::UnknownDisplayBuffer {
                fb_cookie: req.fb_cookie,
                db_cookie: req.db_cookie,
            });
        };

        let source = db.pixel_source(needs_cpu)?;
        let desc = FrameBufferDesc {
            width: req.width,
            height: req.height,
            pixel_format: req.pixel_format,
        };
        let surface = self.sink.create_surface(&desc, source)?;
        let info = FrameBufferInfo {
            cookie: req.fb_cookie,
            db_cookie: req.db_cookie,
            width: req.width,
            height: req.height,
            pixel_format: req.pixel_format,
        };
        let replaced = tables.frame.insert(req.fb_cookie, FrameBuffer { info, surface });
        drop(tables);

        if let Some(old) = replaced {
            self.sink.destroy_surface(old.surface);
        }
        debug!(
            domid = self.domid,
            fb_cookie = req.fb_cookie,
            db_cookie = req.db_cookie,
            surface = surface.0,
            "frame buffer created"
        );
        Ok(info)
    }

    pub fn get_display_buffer(&self, cookie: Cookie) -> Result<DisplayBufferInfo> {
        self.lock()
            .display
            .get(&cookie)
            .map(DisplayBuffer::info)
            .ok_or(BufferError::NotFound { cookie })
    }

    /// Run `f` against a live display buffer while the registry lock is held.
    pub fn with_display_buffer<R>(&self, cookie: Cookie, f: impl FnOnce(&DisplayBuffer) -> R) -> Result<R> {
        let tables = self.lock();
        let db = tables
            .display
            .get(&cookie)
            .ok_or(BufferError::NotFound { cookie })?;
        Ok(f(db))
    }

    pub fn get_frame_buffer(&self, cookie: Cookie) -> Result<FrameBufferInfo> {
        self.lock()
            .frame
            .get(&cookie)
            .map(|fb| fb.info)
            .ok_or(BufferError::NotFound { cookie })
    }

    /// Follow a frame buffer to its display buffer.
    pub fn resolve_frame_buffer(&self, fb_cookie: Cookie) -> Result<(FrameBufferInfo, DisplayBufferInfo)> {
        let tables = self.lock();
        let fb = tables
            .frame
            .get(&fb_cookie)
            .ok_or(BufferError::NotFound { cookie: fb_cookie })?;
        let db = tables
            .display
            .get(&fb.info.db_cookie)
            .ok_or(BufferError::UnknownDisplayBuffer {
                fb_cookie,
                db_cookie: fb.info.db_cookie,
            })?;
        Ok((fb.info, db.info()))
    }

    /// Remove and release a display buffer. Frame buffers referring to it are left in place
    /// and fail to resolve from now on. Returns whether anything was removed.
    pub fn destroy_display_buffer(&self, cookie: Cookie) -> bool {
        let removed = self.lock().display.remove(&cookie);
        let found = removed.is_some();
        drop(removed);
        debug!(domid = self.domid, cookie, found, "display buffer destroyed");
        found
    }

    pub fn destroy_frame_buffer(&self, cookie: Cookie) -> bool {
        let removed = self.lock().frame.remove(&cookie);
        let found = removed.is_some();
        if let Some(fb) = removed {
            self.sink.destroy_surface(fb.surface);
        }
        debug!(domid = self.domid, cookie, found, "frame buffer destroyed");
        found
    }

    /// Copy the guest pixels behind `fb_cookie` into its display buffer's local store.
    ///
    /// Never touches more than `min(local store, declared size, mapped size, frame buffer
    /// size)` bytes. A no-op for zero-copy buffers.
    pub fn copy_buffer(&self, fb_cookie: Cookie) -> Result<usize> {
        let mut tables = self.lock();
        let Tables { display, frame } = &mut *tables;
        let fb = frame
            .get(&fb_cookie)
            .ok_or(BufferError::NotFound { cookie: fb_cookie })?;
        let db = display
            .get_mut(&fb.info.db_cookie)
            .ok_or(BufferError::UnknownDisplayBuffer {
                fb_cookie,
                db_cookie: fb.info.db_cookie,
            })?;
        db.copy_from_guest(&fb.info)
    }

    /// Bring the frame buffer up to date and hand it to the sink.
    pub fn present(&self, fb_cookie: Cookie) -> Result<()> {
        let needs_cpu = self.sink.needs_cpu_access();
        let mut tables = self.lock();
        let Tables { display, frame } = &mut *tables;
        let fb = frame
            .get(&fb_cookie)
            .ok_or(BufferError::NotFound { cookie: fb_cookie })?;
        let db = display
            .get_mut(&fb.info.db_cookie)
            .ok_or(BufferError::UnknownDisplayBuffer {
                fb_cookie,
                db_cookie: fb.info.db_cookie,
            })?;

        db.copy_from_guest(&fb.info)?;
        let implied = frame_buffer_bytes(&fb.info, db.bpp);
        match &db.backing {
            Backing::Copy { store, .. } => {
                let n = store.len().min(implied);
                self.sink.present(fb.surface, Frame::Cpu(&store[..n]))?;
            }
            Backing::ZeroCopy(buffer) if needs_cpu && buffer.is_cpu_mapped() => {
                let n = (buffer.size() as usize).min(implied);
                let mut pixels = vec![0u8; n];
                buffer.read_pixels(0, &mut pixels)?;
                self.sink.present(fb.surface, Frame::Cpu(&pixels))?;
            }
            Backing::ZeroCopy(buffer) => {
                self.sink.present(fb.surface, Frame::Gpu { name: buffer.name()? })?;
            }
        }
        Ok(())
    }

    /// Show `fb_cookie` with `mode`, or blank the display when the mode has no area.
    pub fn set_config(&self, fb_cookie: Cookie, mode: DisplayMode) -> Result<()> {
        if mode.width == 0 || mode.height == 0 {
            self.sink.configure(None)?;
            return Ok(());
        }
        let tables = self.lock();
        let fb = tables
            .frame
            .get(&fb_cookie)
            .ok_or(BufferError::NotFound { cookie: fb_cookie })?;
        if !tables.display.contains_key(&fb.info.db_cookie) {
            return Err(BufferError::UnknownDisplayBuffer {
                fb_cookie,
                db_cookie: fb.info.db_cookie,
            });
        }
        self.sink.configure(Some((fb.surface, mode)))?;
        Ok(())
    }

    pub fn display_buffer_count(&self) -> usize {
        self.lock().display.len()
    }

    pub fn frame_buffer_count(&self) -> usize {
        self.lock().frame.len()
    }

    /// Release everything, as on frontend disconnect.
    pub fn clear(&self) {
        let Tables { display, frame } = std::mem::take(&mut *self.lock());
        for fb in frame.into_values() {
            self.sink.destroy_surface(fb.surface);
        }
        let released = display.len();
        drop(display);
        if released > 0 {
            debug!(domid = self.domid, released, "display buffers released");
        }
    }
}

impl Drop for BufferRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for BufferRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRegistry")
            .field("domid", &self.domid)
            .field("zero_copy", &self.importer.is_some())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_limits() {
        assert_eq!(geometry(64, 64, 32), Some((256, 16384)));
        assert_eq!(geometry(3, 1, 24), Some((9, 9)));
        assert_eq!(geometry(0, 64, 32), None);
        assert_eq!(geometry(64, 64, 0), None);
        assert_eq!(geometry(64, 64, 33), None);
        assert_eq!(geometry(u32::MAX, 2, 32), None);
        assert_eq!(geometry(16384, 16384, 32), None);
    }

    #[test]
    fn frame_buffer_bytes_prefers_format_size() {
        let fb = FrameBufferInfo {
            cookie: 1,
            db_cookie: 2,
            width: 10,
            height: 10,
            pixel_format: fourcc::DRM_FORMAT_RGB565,
        };
        assert_eq!(frame_buffer_bytes(&fb, 32), 200);
        let unknown = FrameBufferInfo {
            pixel_format: 0,
            ..fb
        };
        assert_eq!(frame_buffer_bytes(&unknown, 32), 400);
        let huge = FrameBufferInfo {
            width: u32::MAX,
            height: u32::MAX,
            ..fb
        };
        assert_eq!(frame_buffer_bytes(&huge, 32), usize::MAX);
    }
}
