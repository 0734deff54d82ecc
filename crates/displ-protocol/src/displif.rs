//! Virtual display ABI (`xen/io/displif.h`).
//!
//! Each connector has a request ring (a regular shared request/response ring, see
//! [`crate::ring`]) carrying [`DisplayRequest`]s and [`DisplayResponse`]s, plus a separate
//! event page on which the backend produces [`PageFlipEvent`]s.
//!
//! Display buffers are described by a chained page directory: every directory page starts
//! with the grant reference of the next directory page (0 terminates the chain) followed by
//! up to [`XENDISPL_DIR_REFS_PER_PAGE`] grant references of buffer pages.

use bytemuck::{Pod, Zeroable};

use crate::{check_len, read_u16, read_u32, read_u64, DecodeError, XEN_PAGE_SIZE};

pub const XENDISPL_OP_DBUF_CREATE: u8 = 0x10;
pub const XENDISPL_OP_DBUF_DESTROY: u8 = 0x11;
pub const XENDISPL_OP_FB_ATTACH: u8 = 0x12;
pub const XENDISPL_OP_FB_DETACH: u8 = 0x13;
pub const XENDISPL_OP_SET_CONFIG: u8 = 0x14;
pub const XENDISPL_OP_PG_FLIP: u8 = 0x15;

pub const XENDISPL_EVT_PG_FLIP: u8 = 0x00;

/// `dbuf_create.flags`: the backend, not the frontend, allocates the buffer pages.
pub const XENDISPL_DBUF_FLG_REQ_ALLOC: u32 = 1 << 0;

pub const XENDISPL_REQ_SIZE: usize = 64;
pub const XENDISPL_RESP_SIZE: usize = 64;
pub const XENDISPL_EVT_SIZE: usize = 64;

/// Linux errno values; a response status is 0 or one of these negated.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EFAULT: i32 = 14;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
    pub const EOPNOTSUPP: i32 = 95;
}

const PAYLOAD_OFFSET: usize = 8;
const RESP_STATUS_OFFSET: usize = 4;

/// Byte offset of `gref_dir_next_page` in a directory page.
pub const XENDISPL_DIR_NEXT_PAGE_OFFSET: usize = 0;
/// Byte offset of the first buffer grant reference in a directory page.
pub const XENDISPL_DIR_GREFS_OFFSET: usize = 4;
pub const XENDISPL_DIR_REFS_PER_PAGE: usize = (XEN_PAGE_SIZE - XENDISPL_DIR_GREFS_OFFSET) / 4;

/// Event page: guest-owned consumer index, backend-owned producer index, then the ring.
pub mod event_page {
    use super::XENDISPL_EVT_SIZE;
    use crate::XEN_PAGE_SIZE;

    pub const IN_CONS: usize = 0;
    pub const IN_PROD: usize = 4;
    pub const RING_OFFSET: usize = 64;
    pub const RING_SIZE: usize = XEN_PAGE_SIZE - RING_OFFSET;
    pub const RING_LEN: usize = RING_SIZE / XENDISPL_EVT_SIZE;
}

/// Per-connector control-plane store keys.
pub mod field {
    pub const REQ_RING_REF: &str = "req-ring-ref";
    pub const REQ_CHANNEL: &str = "req-event-channel";
    pub const EVT_RING_REF: &str = "evt-ring-ref";
    pub const EVT_CHANNEL: &str = "evt-event-channel";
    pub const BE_ALLOC: &str = "be-alloc";
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DbufCreateReq {
    pub dbuf_cookie: u64,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    pub buffer_sz: u32,
    pub flags: u32,
    pub gref_directory: u32,
    pub data_ofs: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct CookieReq {
    pub cookie: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FbAttachReq {
    pub dbuf_cookie: u64,
    pub fb_cookie: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SetConfigReq {
    pub fb_cookie: u64,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    pub reserved: u32,
}

const _: () = {
    assert!(core::mem::size_of::<DbufCreateReq>() == 40);
    assert!(core::mem::size_of::<FbAttachReq>() == 32);
    assert!(core::mem::size_of::<SetConfigReq>() == 32);
    assert!(PAYLOAD_OFFSET + core::mem::size_of::<DbufCreateReq>() <= XENDISPL_REQ_SIZE);
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestBody {
    DbufCreate(DbufCreateReq),
    DbufDestroy(CookieReq),
    FbAttach(FbAttachReq),
    FbDetach(CookieReq),
    SetConfig(SetConfigReq),
    PageFlip(CookieReq),
}

impl RequestBody {
    pub fn operation(&self) -> u8 {
        match self {
            RequestBody::DbufCreate(_) => XENDISPL_OP_DBUF_CREATE,
            RequestBody::DbufDestroy(_) => XENDISPL_OP_DBUF_DESTROY,
            RequestBody::FbAttach(_) => XENDISPL_OP_FB_ATTACH,
            RequestBody::FbDetach(_) => XENDISPL_OP_FB_DETACH,
            RequestBody::SetConfig(_) => XENDISPL_OP_SET_CONFIG,
            RequestBody::PageFlip(_) => XENDISPL_OP_PG_FLIP,
        }
    }
}

/// A request slot as written by the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayRequest {
    pub id: u16,
    pub body: RequestBody,
}

impl DisplayRequest {
    /// Peek the `(id, operation)` header of a request slot without decoding the payload, so a
    /// response can still be produced for requests that fail to decode.
    pub fn header(bytes: &[u8]) -> Result<(u16, u8), DecodeError> {
        check_len(bytes, PAYLOAD_OFFSET)?;
        Ok((read_u16(bytes, 0), bytes[2]))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        check_len(bytes, XENDISPL_REQ_SIZE)?;
        let (id, operation) = Self::header(bytes)?;
        let payload = &bytes[PAYLOAD_OFFSET..];
        let body = match operation {
            XENDISPL_OP_DBUF_CREATE => RequestBody::DbufCreate(Payload::read_le(payload)),
            XENDISPL_OP_DBUF_DESTROY => RequestBody::DbufDestroy(Payload::read_le(payload)),
            XENDISPL_OP_FB_ATTACH => RequestBody::FbAttach(Payload::read_le(payload)),
            XENDISPL_OP_FB_DETACH => RequestBody::FbDetach(Payload::read_le(payload)),
            XENDISPL_OP_SET_CONFIG => RequestBody::SetConfig(Payload::read_le(payload)),
            XENDISPL_OP_PG_FLIP => RequestBody::PageFlip(Payload::read_le(payload)),
            operation => return Err(DecodeError::UnknownOperation { id, operation }),
        };
        Ok(Self { id, body })
    }

    /// Encode the request as a frontend would. Used by tests and tooling that drive the
    /// backend from the guest side.
    pub fn encode(&self) -> [u8; XENDISPL_REQ_SIZE] {
        let mut out = [0u8; XENDISPL_REQ_SIZE];
        out[0..2].copy_from_slice(&self.id.to_le_bytes());
        out[2] = self.body.operation();
        let payload = &mut out[PAYLOAD_OFFSET..];
        match &self.body {
            RequestBody::DbufCreate(req) => req.write_le(payload),
            RequestBody::DbufDestroy(req)
            | RequestBody::FbDetach(req)
            | RequestBody::PageFlip(req) => req.write_le(payload),
            RequestBody::FbAttach(req) => req.write_le(payload),
            RequestBody::SetConfig(req) => req.write_le(payload),
        }
        out
    }
}

/// Little-endian field codec for request payloads, independent of host byte order.
///
/// Fields are laid out in declaration order; the `Pod` derive on each payload rejects any
/// layout with padding, so that order matches the guest ABI offsets. Callers hand in a slice
/// at least `size_of::<Self>()` long (`decode` checks the slot length first).
trait Payload: Pod {
    fn read_le(payload: &[u8]) -> Self;
    fn write_le(&self, out: &mut [u8]);
}

struct LeReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> LeReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn u32(&mut self) -> u32 {
        let value = read_u32(self.bytes, self.offset);
        self.offset += 4;
        value
    }

    fn u64(&mut self) -> u64 {
        let value = read_u64(self.bytes, self.offset);
        self.offset += 8;
        value
    }
}

struct LeWriter<'a> {
    bytes: &'a mut [u8],
    offset: usize,
}

impl<'a> LeWriter<'a> {
    fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes[self.offset..self.offset + 4].copy_from_slice(&value.to_le_bytes());
        self.offset += 4;
        self
    }

    fn u64(&mut self, value: u64) -> &mut Self {
        self.bytes[self.offset..self.offset + 8].copy_from_slice(&value.to_le_bytes());
        self.offset += 8;
        self
    }
}

impl Payload for DbufCreateReq {
    fn read_le(payload: &[u8]) -> Self {
        let mut r = LeReader::new(payload);
        Self {
            dbuf_cookie: r.u64(),
            width: r.u32(),
            height: r.u32(),
            bpp: r.u32(),
            buffer_sz: r.u32(),
            flags: r.u32(),
            gref_directory: r.u32(),
            data_ofs: r.u32(),
            reserved: r.u32(),
        }
    }

    fn write_le(&self, out: &mut [u8]) {
        LeWriter::new(out)
            .u64(self.dbuf_cookie)
            .u32(self.width)
            .u32(self.height)
            .u32(self.bpp)
            .u32(self.buffer_sz)
            .u32(self.flags)
            .u32(self.gref_directory)
            .u32(self.data_ofs)
            .u32(self.reserved);
    }
}

impl Payload for CookieReq {
    fn read_le(payload: &[u8]) -> Self {
        Self {
            cookie: LeReader::new(payload).u64(),
        }
    }

    fn write_le(&self, out: &mut [u8]) {
        LeWriter::new(out).u64(self.cookie);
    }
}

impl Payload for FbAttachReq {
    fn read_le(payload: &[u8]) -> Self {
        let mut r = LeReader::new(payload);
        Self {
            dbuf_cookie: r.u64(),
            fb_cookie: r.u64(),
            width: r.u32(),
            height: r.u32(),
            pixel_format: r.u32(),
            reserved: r.u32(),
        }
    }

    fn write_le(&self, out: &mut [u8]) {
        LeWriter::new(out)
            .u64(self.dbuf_cookie)
            .u64(self.fb_cookie)
            .u32(self.width)
            .u32(self.height)
            .u32(self.pixel_format)
            .u32(self.reserved);
    }
}

impl Payload for SetConfigReq {
    fn read_le(payload: &[u8]) -> Self {
        let mut r = LeReader::new(payload);
        Self {
            fb_cookie: r.u64(),
            x: r.u32(),
            y: r.u32(),
            width: r.u32(),
            height: r.u32(),
            bpp: r.u32(),
            reserved: r.u32(),
        }
    }

    fn write_le(&self, out: &mut [u8]) {
        LeWriter::new(out)
            .u64(self.fb_cookie)
            .u32(self.x)
            .u32(self.y)
            .u32(self.width)
            .u32(self.height)
            .u32(self.bpp)
            .u32(self.reserved);
    }
}

/// A response slot. `status` is 0 on success or a negative errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayResponse {
    pub id: u16,
    pub operation: u8,
    pub status: i32,
}

impl DisplayResponse {
    pub fn to_le_bytes(self) -> [u8; XENDISPL_RESP_SIZE] {
        let mut out = [0u8; XENDISPL_RESP_SIZE];
        out[0..2].copy_from_slice(&self.id.to_le_bytes());
        out[2] = self.operation;
        out[RESP_STATUS_OFFSET..RESP_STATUS_OFFSET + 4].copy_from_slice(&self.status.to_le_bytes());
        out
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        check_len(bytes, XENDISPL_RESP_SIZE)?;
        Ok(Self {
            id: read_u16(bytes, 0),
            operation: bytes[2],
            status: crate::read_i32(bytes, RESP_STATUS_OFFSET),
        })
    }
}

/// Sent on the event page once a flipped frame buffer has been handed to the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlipEvent {
    pub id: u16,
    pub fb_cookie: u64,
}

impl PageFlipEvent {
    pub fn to_le_bytes(self) -> [u8; XENDISPL_EVT_SIZE] {
        let mut out = [0u8; XENDISPL_EVT_SIZE];
        out[0..2].copy_from_slice(&self.id.to_le_bytes());
        out[2] = XENDISPL_EVT_PG_FLIP;
        out[PAYLOAD_OFFSET..PAYLOAD_OFFSET + 8].copy_from_slice(&self.fb_cookie.to_le_bytes());
        out
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        check_len(bytes, XENDISPL_EVT_SIZE)?;
        if bytes[2] != XENDISPL_EVT_PG_FLIP {
            return Err(DecodeError::UnknownEventType(bytes[2]));
        }
        Ok(Self {
            id: read_u16(bytes, 0),
            fb_cookie: read_u64(bytes, PAYLOAD_OFFSET),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_page_holds_1023_refs() {
        assert_eq!(XENDISPL_DIR_REFS_PER_PAGE, 1023);
        assert_eq!(event_page::RING_LEN, 63);
    }

    #[test]
    fn dbuf_create_payload_offsets() {
        let req = DisplayRequest {
            id: 7,
            body: RequestBody::DbufCreate(DbufCreateReq {
                dbuf_cookie: 0x1122_3344_5566_7788,
                width: 64,
                height: 48,
                bpp: 32,
                buffer_sz: 64 * 48 * 4,
                flags: 0,
                gref_directory: 0xabcd,
                data_ofs: 0,
                reserved: 0,
            }),
        };
        let bytes = req.encode();
        assert_eq!(&bytes[0..2], &[7, 0]);
        assert_eq!(bytes[2], XENDISPL_OP_DBUF_CREATE);
        assert_eq!(read_u64(&bytes, 8), 0x1122_3344_5566_7788);
        assert_eq!(crate::read_u32(&bytes, 16), 64);
        assert_eq!(crate::read_u32(&bytes, 20), 48);
        assert_eq!(crate::read_u32(&bytes, 24), 32);
        assert_eq!(crate::read_u32(&bytes, 28), 64 * 48 * 4);
        assert_eq!(crate::read_u32(&bytes, 36), 0xabcd);
        assert_eq!(DisplayRequest::decode(&bytes), Ok(req));
    }

    #[test]
    fn fb_attach_decodes_from_little_endian_bytes() {
        let mut bytes = [0u8; XENDISPL_REQ_SIZE];
        bytes[0..2].copy_from_slice(&[0x34, 0x12]);
        bytes[2] = XENDISPL_OP_FB_ATTACH;
        bytes[8..16].copy_from_slice(&[0x01, 0, 0, 0, 0, 0, 0, 0x80]);
        bytes[16..24].copy_from_slice(&[0x0a, 0, 0, 0, 0, 0, 0, 0]);
        bytes[24..28].copy_from_slice(&[0x00, 0x04, 0, 0]);
        bytes[28..32].copy_from_slice(&[0x00, 0x03, 0, 0]);
        bytes[32..36].copy_from_slice(b"XR24");
        let req = DisplayRequest::decode(&bytes).unwrap();
        assert_eq!(
            req,
            DisplayRequest {
                id: 0x1234,
                body: RequestBody::FbAttach(FbAttachReq {
                    dbuf_cookie: 0x8000_0000_0000_0001,
                    fb_cookie: 10,
                    width: 1024,
                    height: 768,
                    pixel_format: u32::from_le_bytes(*b"XR24"),
                    reserved: 0,
                }),
            }
        );
        assert_eq!(req.encode(), bytes);
    }

    #[test]
    fn set_config_encodes_fields_in_abi_order() {
        let bytes = DisplayRequest {
            id: 1,
            body: RequestBody::SetConfig(SetConfigReq {
                fb_cookie: 0x0102_0304_0506_0708,
                x: 1,
                y: 2,
                width: 640,
                height: 480,
                bpp: 32,
                reserved: 0,
            }),
        }
        .encode();
        assert_eq!(&bytes[8..16], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&bytes[16..20], &[1, 0, 0, 0]);
        assert_eq!(&bytes[20..24], &[2, 0, 0, 0]);
        assert_eq!(&bytes[24..28], &[0x80, 0x02, 0, 0]);
        assert_eq!(&bytes[28..32], &[0xe0, 0x01, 0, 0]);
        assert_eq!(&bytes[32..36], &[32, 0, 0, 0]);
    }

    #[test]
    fn unknown_operation_keeps_request_id() {
        let mut bytes = [0u8; XENDISPL_REQ_SIZE];
        bytes[0] = 9;
        bytes[2] = 0x7f;
        assert_eq!(
            DisplayRequest::decode(&bytes),
            Err(DecodeError::UnknownOperation {
                id: 9,
                operation: 0x7f
            })
        );
    }

    #[test]
    fn response_status_is_signed() {
        let rsp = DisplayResponse {
            id: 3,
            operation: XENDISPL_OP_FB_ATTACH,
            status: -2,
        };
        let bytes = rsp.to_le_bytes();
        assert_eq!(&bytes[4..8], &(-2i32).to_le_bytes());
        assert_eq!(DisplayResponse::from_le_bytes(&bytes), Ok(rsp));
    }
}
