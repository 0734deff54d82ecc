use thiserror::Error;

/// Handle of a surface created by a [`DisplaySink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBufferDesc {
    pub width: u32,
    pub height: u32,
    /// DRM fourcc.
    pub pixel_format: u32,
}

/// Where a surface's pixels come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelSource {
    /// Bytes handed over on every present.
    Cpu { size: usize, stride: u32 },
    /// A GEM buffer the sink imports by global name.
    Gpu { name: u32, stride: u32 },
}

/// A finished frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    Cpu(&'a [u8]),
    Gpu { name: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("unsupported pixel format {0:#010x}")]
    UnsupportedFormat(u32),

    #[error("unknown surface {0:?}")]
    UnknownSurface(SurfaceId),

    #[error("display rejected the request: {0}")]
    Rejected(String),
}

/// The compositor side of the display.
pub trait DisplaySink: Send + Sync {
    /// Whether the sink can only consume CPU-visible pixels, even for zero-copy buffers.
    fn needs_cpu_access(&self) -> bool {
        false
    }

    fn create_surface(&self, desc: &FrameBufferDesc, source: PixelSource) -> Result<SurfaceId, SinkError>;

    fn destroy_surface(&self, surface: SurfaceId);

    fn present(&self, surface: SurfaceId, frame: Frame<'_>) -> Result<(), SinkError>;

    /// Show `surface` with `mode`, or blank the output when `None`.
    fn configure(&self, config: Option<(SurfaceId, DisplayMode)>) -> Result<(), SinkError>;
}
