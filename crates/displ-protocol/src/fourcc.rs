//! DRM fourcc pixel format codes (`drm_fourcc.h`) used in `fb_attach.pixel_format`.

pub const fn fourcc_code(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

pub const DRM_FORMAT_C8: u32 = fourcc_code(b'C', b'8', b' ', b' ');
pub const DRM_FORMAT_RGB565: u32 = fourcc_code(b'R', b'G', b'1', b'6');
pub const DRM_FORMAT_XRGB1555: u32 = fourcc_code(b'X', b'R', b'1', b'5');
pub const DRM_FORMAT_ARGB1555: u32 = fourcc_code(b'A', b'R', b'1', b'5');
pub const DRM_FORMAT_RGB888: u32 = fourcc_code(b'R', b'G', b'2', b'4');
pub const DRM_FORMAT_XRGB8888: u32 = fourcc_code(b'X', b'R', b'2', b'4');
pub const DRM_FORMAT_ARGB8888: u32 = fourcc_code(b'A', b'R', b'2', b'4');
pub const DRM_FORMAT_XBGR8888: u32 = fourcc_code(b'X', b'B', b'2', b'4');
pub const DRM_FORMAT_ABGR8888: u32 = fourcc_code(b'A', b'B', b'2', b'4');

/// Bytes per pixel of the packed single-plane formats, `None` for anything else.
pub fn bytes_per_pixel(fourcc: u32) -> Option<u32> {
    match fourcc {
        DRM_FORMAT_C8 => Some(1),
        DRM_FORMAT_RGB565 | DRM_FORMAT_XRGB1555 | DRM_FORMAT_ARGB1555 => Some(2),
        DRM_FORMAT_RGB888 => Some(3),
        DRM_FORMAT_XRGB8888 | DRM_FORMAT_ARGB8888 | DRM_FORMAT_XBGR8888 | DRM_FORMAT_ABGR8888 => {
            Some(4)
        }
        _ => None,
    }
}
