use displ_protocol::displif::{
    CookieReq, DisplayRequest, FbAttachReq, PageFlipEvent, RequestBody, SetConfigReq,
    XENDISPL_OP_FB_ATTACH, XENDISPL_OP_PG_FLIP, XENDISPL_OP_SET_CONFIG,
};
use displ_protocol::fourcc::DRM_FORMAT_XRGB8888;
use displ_protocol::kbdif::{
    InputEvent, MultiTouchEvent, XENKBD_MT_EV_DOWN, XENKBD_MT_EV_ORIENT, XENKBD_TYPE_MOTION,
    XENKBD_TYPE_MTOUCH, XENKBD_TYPE_POS,
};
use pretty_assertions::assert_eq;

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

#[test]
fn motion_and_position_share_field_offsets() {
    let motion = InputEvent::Motion {
        rel_x: -5,
        rel_y: 7,
        rel_z: -1,
    }
    .to_le_bytes();
    assert_eq!(motion[0], XENKBD_TYPE_MOTION);
    assert_eq!(u32_at(&motion, 4) as i32, -5);
    assert_eq!(u32_at(&motion, 8) as i32, 7);
    assert_eq!(u32_at(&motion, 12) as i32, -1);

    let pos = InputEvent::Position {
        abs_x: 640,
        abs_y: 480,
        rel_z: 0,
    }
    .to_le_bytes();
    assert_eq!(pos[0], XENKBD_TYPE_POS);
    assert_eq!(u32_at(&pos, 4), 640);
    assert_eq!(u32_at(&pos, 8), 480);
}

#[test]
fn multitouch_payload_starts_at_offset_8() {
    let down = InputEvent::MultiTouch {
        contact_id: 3,
        event: MultiTouchEvent::Down {
            abs_x: 100,
            abs_y: 200,
        },
    }
    .to_le_bytes();
    assert_eq!(down[0], XENKBD_TYPE_MTOUCH);
    assert_eq!(down[1], XENKBD_MT_EV_DOWN);
    assert_eq!(down[2], 3);
    assert_eq!(u32_at(&down, 8), 100);
    assert_eq!(u32_at(&down, 12), 200);

    let orient = InputEvent::MultiTouch {
        contact_id: 1,
        event: MultiTouchEvent::Orientation(-90),
    };
    let bytes = orient.to_le_bytes();
    assert_eq!(bytes[1], XENKBD_MT_EV_ORIENT);
    assert_eq!(&bytes[8..10], &(-90i16).to_le_bytes());
    assert_eq!(InputEvent::from_le_bytes(&bytes), Ok(orient));
}

#[test]
fn fb_attach_and_set_config_layouts() {
    let attach = DisplayRequest {
        id: 1,
        body: RequestBody::FbAttach(FbAttachReq {
            dbuf_cookie: 1,
            fb_cookie: 10,
            width: 64,
            height: 64,
            pixel_format: DRM_FORMAT_XRGB8888,
            reserved: 0,
        }),
    }
    .encode();
    assert_eq!(attach[2], XENDISPL_OP_FB_ATTACH);
    assert_eq!(u64_at(&attach, 8), 1);
    assert_eq!(u64_at(&attach, 16), 10);
    assert_eq!(u32_at(&attach, 24), 64);
    assert_eq!(u32_at(&attach, 28), 64);
    assert_eq!(u32_at(&attach, 32), DRM_FORMAT_XRGB8888);

    let config = DisplayRequest {
        id: 2,
        body: RequestBody::SetConfig(SetConfigReq {
            fb_cookie: 10,
            x: 0,
            y: 0,
            width: 1024,
            height: 768,
            bpp: 32,
            reserved: 0,
        }),
    }
    .encode();
    assert_eq!(config[2], XENDISPL_OP_SET_CONFIG);
    assert_eq!(u64_at(&config, 8), 10);
    assert_eq!(u32_at(&config, 24), 1024);
    assert_eq!(u32_at(&config, 28), 768);
    assert_eq!(u32_at(&config, 32), 32);
}

#[test]
fn page_flip_request_and_event() {
    let flip = DisplayRequest {
        id: 0xbeef,
        body: RequestBody::PageFlip(CookieReq { cookie: 42 }),
    };
    let bytes = flip.encode();
    assert_eq!(bytes[2], XENDISPL_OP_PG_FLIP);
    assert_eq!(DisplayRequest::decode(&bytes), Ok(flip));

    let evt = PageFlipEvent {
        id: 5,
        fb_cookie: 42,
    };
    let bytes = evt.to_le_bytes();
    assert_eq!(bytes[2], 0);
    assert_eq!(u64_at(&bytes, 8), 42);
    assert_eq!(PageFlipEvent::from_le_bytes(&bytes), Ok(evt));
}
