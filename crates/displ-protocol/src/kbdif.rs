//! Virtual keyboard / pointer / multi-touch ABI (`xen/io/kbdif.h`).
//!
//! The frontend grants one shared page. The page starts with four ring indices, followed by
//! an "in" ring (backend → frontend input events) and an "out" ring (frontend → backend, unused
//! by this backend). The backend owns `in_prod`; the guest owns `in_cons`.
//!
//! Page layout:
//! - `0x000` `in_cons: u32`
//! - `0x004` `in_prod: u32`
//! - `0x008` `out_cons: u32`
//! - `0x00c` `out_prod: u32`
//! - `0x400..0x800` in ring, [`XENKBD_IN_RING_LEN`] records of [`XENKBD_IN_EVENT_SIZE`] bytes
//! - `0x800..0xc00` out ring

use crate::{check_len, read_i32, read_u32, DecodeError};

pub const XENKBD_TYPE_MOTION: u8 = 1;
pub const XENKBD_TYPE_RESERVED: u8 = 2;
pub const XENKBD_TYPE_KEY: u8 = 3;
pub const XENKBD_TYPE_POS: u8 = 4;
pub const XENKBD_TYPE_MTOUCH: u8 = 5;

pub const XENKBD_MT_EV_DOWN: u8 = 0;
pub const XENKBD_MT_EV_UP: u8 = 1;
pub const XENKBD_MT_EV_MOTION: u8 = 2;
pub const XENKBD_MT_EV_SYN: u8 = 3;
pub const XENKBD_MT_EV_SHAPE: u8 = 4;
pub const XENKBD_MT_EV_ORIENT: u8 = 5;

/// Every in-ring record occupies exactly this many bytes regardless of its type.
pub const XENKBD_IN_EVENT_SIZE: usize = 40;

pub const XENKBD_IN_RING_OFFS: usize = 1024;
pub const XENKBD_IN_RING_SIZE: usize = 1024;
pub const XENKBD_IN_RING_LEN: usize = XENKBD_IN_RING_SIZE / XENKBD_IN_EVENT_SIZE;

pub const XENKBD_OUT_RING_OFFS: usize = XENKBD_IN_RING_OFFS + XENKBD_IN_RING_SIZE;
pub const XENKBD_OUT_RING_SIZE: usize = 1024;

/// Byte offsets of the ring indices at the start of the shared page.
pub mod page_offset {
    pub const IN_CONS: usize = 0;
    pub const IN_PROD: usize = 4;
    pub const OUT_CONS: usize = 8;
    pub const OUT_PROD: usize = 12;
}

/// Control-plane store keys under the frontend / backend device directories.
pub mod field {
    pub const EVT_CHANNEL: &str = "event-channel";
    pub const RING_GREF: &str = "page-gref";
    pub const ID: &str = "id";
    pub const FEAT_ABS_POINTER: &str = "feature-abs-pointer";
    pub const FEAT_MTOUCH: &str = "feature-multi-touch";
    pub const MT_NUM_CONTACTS: &str = "multi-touch-num-contacts";
}

const KEY_PRESSED_OFFSET: usize = 1;
const KEY_KEYCODE_OFFSET: usize = 4;
const MOTION_X_OFFSET: usize = 4;
const MOTION_Y_OFFSET: usize = 8;
const MOTION_Z_OFFSET: usize = 12;
const MTOUCH_EVENT_TYPE_OFFSET: usize = 1;
const MTOUCH_CONTACT_ID_OFFSET: usize = 2;
const MTOUCH_PAYLOAD_OFFSET: usize = 8;

/// Sub-record of a [`InputEvent::MultiTouch`] record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiTouchEvent {
    Down { abs_x: i32, abs_y: i32 },
    Up,
    Motion { abs_x: i32, abs_y: i32 },
    /// Marks the end of a batch of contact updates.
    Frame,
    Shape { major: u32, minor: u32 },
    Orientation(i16),
}

impl MultiTouchEvent {
    pub fn event_type(self) -> u8 {
        match self {
            MultiTouchEvent::Down { .. } => XENKBD_MT_EV_DOWN,
            MultiTouchEvent::Up => XENKBD_MT_EV_UP,
            MultiTouchEvent::Motion { .. } => XENKBD_MT_EV_MOTION,
            MultiTouchEvent::Frame => XENKBD_MT_EV_SYN,
            MultiTouchEvent::Shape { .. } => XENKBD_MT_EV_SHAPE,
            MultiTouchEvent::Orientation(_) => XENKBD_MT_EV_ORIENT,
        }
    }
}

/// One record of the kbdif "in" ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Key { keycode: u32, pressed: bool },
    Motion { rel_x: i32, rel_y: i32, rel_z: i32 },
    Position { abs_x: i32, abs_y: i32, rel_z: i32 },
    MultiTouch { contact_id: u8, event: MultiTouchEvent },
}

impl InputEvent {
    pub fn event_type(&self) -> u8 {
        match self {
            InputEvent::Key { .. } => XENKBD_TYPE_KEY,
            InputEvent::Motion { .. } => XENKBD_TYPE_MOTION,
            InputEvent::Position { .. } => XENKBD_TYPE_POS,
            InputEvent::MultiTouch { .. } => XENKBD_TYPE_MTOUCH,
        }
    }

    /// Encode into the fixed-size ring record. Unused bytes are zero.
    pub fn to_le_bytes(self) -> [u8; XENKBD_IN_EVENT_SIZE] {
        let mut out = [0u8; XENKBD_IN_EVENT_SIZE];
        out[0] = self.event_type();
        match self {
            InputEvent::Key { keycode, pressed } => {
                out[KEY_PRESSED_OFFSET] = pressed as u8;
                put(&mut out, KEY_KEYCODE_OFFSET, &keycode.to_le_bytes());
            }
            InputEvent::Motion { rel_x, rel_y, rel_z } => {
                put(&mut out, MOTION_X_OFFSET, &rel_x.to_le_bytes());
                put(&mut out, MOTION_Y_OFFSET, &rel_y.to_le_bytes());
                put(&mut out, MOTION_Z_OFFSET, &rel_z.to_le_bytes());
            }
            InputEvent::Position {
                abs_x,
                abs_y,
                rel_z,
            } => {
                put(&mut out, MOTION_X_OFFSET, &abs_x.to_le_bytes());
                put(&mut out, MOTION_Y_OFFSET, &abs_y.to_le_bytes());
                put(&mut out, MOTION_Z_OFFSET, &rel_z.to_le_bytes());
            }
            InputEvent::MultiTouch { contact_id, event } => {
                out[MTOUCH_EVENT_TYPE_OFFSET] = event.event_type();
                out[MTOUCH_CONTACT_ID_OFFSET] = contact_id;
                let p = MTOUCH_PAYLOAD_OFFSET;
                match event {
                    MultiTouchEvent::Down { abs_x, abs_y }
                    | MultiTouchEvent::Motion { abs_x, abs_y } => {
                        put(&mut out, p, &abs_x.to_le_bytes());
                        put(&mut out, p + 4, &abs_y.to_le_bytes());
                    }
                    MultiTouchEvent::Shape { major, minor } => {
                        put(&mut out, p, &major.to_le_bytes());
                        put(&mut out, p + 4, &minor.to_le_bytes());
                    }
                    MultiTouchEvent::Orientation(angle) => {
                        put(&mut out, p, &angle.to_le_bytes());
                    }
                    MultiTouchEvent::Up | MultiTouchEvent::Frame => {}
                }
            }
        }
        out
    }

    /// Decode a ring record the way the guest driver reads it.
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        check_len(bytes, XENKBD_IN_EVENT_SIZE)?;
        Ok(match bytes[0] {
            XENKBD_TYPE_KEY => InputEvent::Key {
                keycode: read_u32(bytes, KEY_KEYCODE_OFFSET),
                pressed: bytes[KEY_PRESSED_OFFSET] != 0,
            },
            XENKBD_TYPE_MOTION => InputEvent::Motion {
                rel_x: read_i32(bytes, MOTION_X_OFFSET),
                rel_y: read_i32(bytes, MOTION_Y_OFFSET),
                rel_z: read_i32(bytes, MOTION_Z_OFFSET),
            },
            XENKBD_TYPE_POS => InputEvent::Position {
                abs_x: read_i32(bytes, MOTION_X_OFFSET),
                abs_y: read_i32(bytes, MOTION_Y_OFFSET),
                rel_z: read_i32(bytes, MOTION_Z_OFFSET),
            },
            XENKBD_TYPE_MTOUCH => {
                let p = MTOUCH_PAYLOAD_OFFSET;
                let event = match bytes[MTOUCH_EVENT_TYPE_OFFSET] {
                    XENKBD_MT_EV_DOWN => MultiTouchEvent::Down {
                        abs_x: read_i32(bytes, p),
                        abs_y: read_i32(bytes, p + 4),
                    },
                    XENKBD_MT_EV_UP => MultiTouchEvent::Up,
                    XENKBD_MT_EV_MOTION => MultiTouchEvent::Motion {
                        abs_x: read_i32(bytes, p),
                        abs_y: read_i32(bytes, p + 4),
                    },
                    XENKBD_MT_EV_SYN => MultiTouchEvent::Frame,
                    XENKBD_MT_EV_SHAPE => MultiTouchEvent::Shape {
                        major: read_u32(bytes, p),
                        minor: read_u32(bytes, p + 4),
                    },
                    XENKBD_MT_EV_ORIENT => {
                        MultiTouchEvent::Orientation(i16::from_le_bytes([bytes[p], bytes[p + 1]]))
                    }
                    other => return Err(DecodeError::UnknownMultiTouchType(other)),
                };
                InputEvent::MultiTouch {
                    contact_id: bytes[MTOUCH_CONTACT_ID_OFFSET],
                    event,
                }
            }
            other => return Err(DecodeError::UnknownEventType(other)),
        })
    }
}

fn put(out: &mut [u8], offset: usize, bytes: &[u8]) {
    out[offset..offset + bytes.len()].copy_from_slice(bytes);
}
