//! A [`DisplaySink`] that keeps everything it is given, for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use displ_protocol::fourcc;

use crate::{DisplayMode, DisplaySink, Frame, FrameBufferDesc, PixelSource, SinkError, SurfaceId};

/// One presented frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presented {
    Cpu { surface: SurfaceId, pixels: Vec<u8> },
    Gpu { surface: SurfaceId, name: u32 },
}

#[derive(Default)]
struct State {
    next_surface: u64,
    surfaces: BTreeMap<SurfaceId, (FrameBufferDesc, PixelSource)>,
    presented: Vec<Presented>,
    config: Option<(SurfaceId, DisplayMode)>,
}

#[derive(Default)]
pub struct MemDisplay {
    cpu_only: bool,
    fail_present: AtomicBool,
    state: Mutex<State>,
}

impl MemDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A display that can only consume CPU pixels.
    pub fn cpu_only() -> Self {
        Self {
            cpu_only: true,
            ..Self::default()
        }
    }

    pub fn set_fail_present(&self, fail: bool) {
        self.fail_present.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn surfaces(&self) -> Vec<(SurfaceId, FrameBufferDesc, PixelSource)> {
        self.lock()
            .surfaces
            .iter()
            .map(|(id, (desc, source))| (*id, *desc, *source))
            .collect()
    }

    pub fn presented(&self) -> Vec<Presented> {
        self.lock().presented.clone()
    }

    pub fn config(&self) -> Option<(SurfaceId, DisplayMode)> {
        self.lock().config
    }
}

impl DisplaySink for MemDisplay {
    fn needs_cpu_access(&self) -> bool {
        self.cpu_only
    }

    fn create_surface(&self, desc: &FrameBufferDesc, source: PixelSource) -> Result<SurfaceId, SinkError> {
        if fourcc::bytes_per_pixel(desc.pixel_format).is_none() {
            return Err(SinkError::UnsupportedFormat(desc.pixel_format));
        }
        let mut state = self.lock();
        state.next_surface += 1;
        let id = SurfaceId(state.next_surface);
        state.surfaces.insert(id, (*desc, source));
        Ok(id)
    }

    fn destroy_surface(&self, surface: SurfaceId) {
        let mut state = self.lock();
        state.surfaces.remove(&surface);
        if state.config.is_some_and(|(s, _)| s == surface) {
            state.config = None;
        }
    }

    fn present(&self, surface: SurfaceId, frame: Frame<'_>) -> Result<(), SinkError> {
        if self.fail_present.load(Ordering::SeqCst) {
            return Err(SinkError::Rejected("present disabled".into()));
        }
        let mut state = self.lock();
        if !state.surfaces.contains_key(&surface) {
            return Err(SinkError::UnknownSurface(surface));
        }
        state.presented.push(match frame {
            Frame::Cpu(pixels) => Presented::Cpu {
                surface,
                pixels: pixels.to_vec(),
            },
            Frame::Gpu { name } => Presented::Gpu { surface, name },
        });
        Ok(())
    }

    fn configure(&self, config: Option<(SurfaceId, DisplayMode)>) -> Result<(), SinkError> {
        let mut state = self.lock();
        if let Some((surface, _)) = config {
            if !state.surfaces.contains_key(&surface) {
                return Err(SinkError::UnknownSurface(surface));
            }
        }
        state.config = config;
        Ok(())
    }
}
