use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use displ_grant::mem::MemGrantTable;
use displ_grant::{GrantMapping, GrantRef};
use displ_input::mem::{MemKeyboard, MemPointer, MemTouch};
use displ_input::{
    EventPublisher, InputCapabilities, OverflowPolicy, PumpConfig, PumpError, PumpStats,
    RingEventPump,
};
use displ_protocol::kbdif::{self, InputEvent, MultiTouchEvent};
use displ_ring::{CountingEventChannel, EventRing, EventRingLayout};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

const DOM: u16 = 3;

struct Guest {
    grants: Arc<MemGrantTable>,
    page: GrantRef,
    channel: Arc<CountingEventChannel>,
}

impl Guest {
    fn new() -> Self {
        let grants = Arc::new(MemGrantTable::new());
        let page = grants.grant_page(DOM);
        Self {
            grants,
            page,
            channel: Arc::new(CountingEventChannel::new(7)),
        }
    }

    fn ring(&self, slots: u32) -> EventRing {
        let mapping = GrantMapping::map(self.grants.clone(), DOM, vec![self.page]).unwrap();
        EventRing::new(
            mapping,
            EventRingLayout::KBDIF_IN.with_slots(slots),
            self.channel.clone(),
        )
        .unwrap()
    }

    fn prod(&self) -> u32 {
        self.grants
            .guest_read_u32(DOM, self.page, kbdif::page_offset::IN_PROD)
            .unwrap()
    }

    fn cons(&self) -> u32 {
        self.grants
            .guest_read_u32(DOM, self.page, kbdif::page_offset::IN_CONS)
            .unwrap()
    }

    fn consume(&self, n: u32) {
        let cons = self.cons() + n;
        self.grants
            .guest_write_u32(DOM, self.page, kbdif::page_offset::IN_CONS, cons)
            .unwrap();
    }

    /// Records between the consumer and producer indices, oldest first.
    fn pending(&self, slots: u32) -> Vec<InputEvent> {
        (self.cons()..self.prod())
            .map(|i| {
                let offset = kbdif::XENKBD_IN_RING_OFFS + (i % slots) as usize * kbdif::XENKBD_IN_EVENT_SIZE;
                let bytes = self
                    .grants
                    .guest_read(DOM, self.page, offset, kbdif::XENKBD_IN_EVENT_SIZE)
                    .unwrap();
                InputEvent::from_le_bytes(&bytes).unwrap()
            })
            .collect()
    }
}

fn key(keycode: u32) -> InputEvent {
    InputEvent::Key {
        keycode,
        pressed: true,
    }
}

#[test]
fn fifth_key_down_on_four_slot_ring_is_ring_full() {
    let guest = Guest::new();
    let mut publisher = EventPublisher::new(guest.ring(4), OverflowPolicy::Drop);

    for code in 1..=4 {
        publisher.publish(&key(code)).unwrap();
    }
    assert!(matches!(
        publisher.publish(&key(5)),
        Err(PumpError::RingFull { capacity: 4 })
    ));
    assert_eq!(guest.prod(), 4);
    assert_eq!(guest.cons(), 0);
    assert_eq!(guest.channel.notifications(), 4);

    guest.consume(1);
    publisher.publish(&key(5)).unwrap();
    assert_eq!(guest.prod(), 5);
    assert_eq!(guest.pending(4), vec![key(2), key(3), key(4), key(5)]);
}

#[test]
fn blocking_publish_gives_up_after_timeout() {
    let guest = Guest::new();
    let timeout = Duration::from_millis(20);
    let mut publisher = EventPublisher::new(guest.ring(1), OverflowPolicy::Block { timeout });
    publisher.publish(&key(1)).unwrap();

    let started = Instant::now();
    assert!(matches!(
        publisher.publish(&key(2)),
        Err(PumpError::RingFull { capacity: 1 })
    ));
    assert!(started.elapsed() >= timeout);
    assert_eq!(guest.prod(), 1);
}

#[test]
fn blocking_publish_resumes_when_guest_consumes() {
    let guest = Arc::new(Guest::new());
    let mut publisher = EventPublisher::new(
        guest.ring(1),
        OverflowPolicy::Block {
            timeout: Duration::from_secs(10),
        },
    );
    publisher.publish(&key(1)).unwrap();

    let consumer = {
        let guest = guest.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            guest.consume(1);
        })
    };
    publisher.publish(&key(2)).unwrap();
    consumer.join().unwrap();
    assert_eq!(guest.pending(1), vec![key(2)]);
}

#[test]
fn pump_publishes_in_callback_order() {
    let guest = Guest::new();
    let keyboard = Arc::new(MemKeyboard::new("kbd0"));
    let pointer = Arc::new(MemPointer::new("ptr0"));
    let touch = Arc::new(MemTouch::new("tch0"));
    let pump = RingEventPump::start(
        DOM,
        guest.ring(kbdif::XENKBD_IN_RING_LEN as u32),
        InputCapabilities {
            keyboard: Some(keyboard.clone()),
            pointer: Some(pointer.clone()),
            touch: Some(touch.clone()),
        },
        PumpConfig::default(),
    )
    .unwrap();
    assert!(keyboard.is_running() && pointer.is_running() && touch.is_running());

    assert!(keyboard.key(30, true));
    assert!(pointer.move_relative(1, -2, 0));
    assert!(pointer.move_absolute(100, 200, 1));
    assert!(pointer.button(0x110, true));
    assert!(touch.down(2, 10, 20));
    assert!(touch.motion(2, 11, 21));
    assert!(touch.frame());
    assert!(touch.up(2));
    assert!(keyboard.key(30, false));

    let stats = pump.stop();
    assert_eq!(
        stats,
        PumpStats {
            published: 9,
            dropped: 0,
            ring_full: 0
        }
    );
    assert_eq!(
        guest.pending(kbdif::XENKBD_IN_RING_LEN as u32),
        vec![
            key(30),
            InputEvent::Motion {
                rel_x: 1,
                rel_y: -2,
                rel_z: 0
            },
            InputEvent::Position {
                abs_x: 100,
                abs_y: 200,
                rel_z: 1
            },
            key(0x110),
            InputEvent::MultiTouch {
                contact_id: 2,
                event: MultiTouchEvent::Down { abs_x: 10, abs_y: 20 }
            },
            InputEvent::MultiTouch {
                contact_id: 2,
                event: MultiTouchEvent::Motion { abs_x: 11, abs_y: 21 }
            },
            InputEvent::MultiTouch {
                contact_id: 0,
                event: MultiTouchEvent::Frame
            },
            InputEvent::MultiTouch {
                contact_id: 2,
                event: MultiTouchEvent::Up
            },
            InputEvent::Key {
                keycode: 30,
                pressed: false
            },
        ]
    );
    assert_eq!(guest.channel.notifications(), 9);
}

#[test]
fn pump_drops_what_the_ring_cannot_hold() {
    let guest = Guest::new();
    let keyboard = Arc::new(MemKeyboard::new("kbd0"));
    let pump = RingEventPump::start(
        DOM,
        guest.ring(4),
        InputCapabilities {
            keyboard: Some(keyboard.clone()),
            ..Default::default()
        },
        PumpConfig::default(),
    )
    .unwrap();

    for code in 1..=5 {
        assert!(keyboard.key(code, true));
    }
    let stats = pump.stop();
    assert_eq!(
        stats,
        PumpStats {
            published: 4,
            dropped: 1,
            ring_full: 1
        }
    );
    assert_eq!(guest.prod(), 4);
    assert_eq!(guest.pending(4), vec![key(1), key(2), key(3), key(4)]);
}

#[test]
fn stop_stops_sources_and_releases_ring() {
    let guest = Guest::new();
    let keyboard = Arc::new(MemKeyboard::new("kbd0"));
    let touch = Arc::new(MemTouch::new("tch0"));
    let pump = RingEventPump::start(
        DOM,
        guest.ring(4),
        InputCapabilities {
            keyboard: Some(keyboard.clone()),
            pointer: None,
            touch: Some(touch.clone()),
        },
        PumpConfig::default(),
    )
    .unwrap();
    assert_eq!(guest.grants.active_mappings(), 1);

    drop(pump);
    assert_eq!((keyboard.starts(), keyboard.stops()), (1, 1));
    assert_eq!((touch.starts(), touch.stops()), (1, 1));
    assert!(!keyboard.key(1, true));
    assert_eq!(guest.grants.active_mappings(), 0);
    assert_eq!(guest.prod(), 0);
}

#[test]
fn stop_interrupts_a_blocked_publish() {
    let guest = Guest::new();
    let keyboard = Arc::new(MemKeyboard::new("kbd0"));
    let pump = RingEventPump::start(
        DOM,
        guest.ring(1),
        InputCapabilities {
            keyboard: Some(keyboard.clone()),
            ..Default::default()
        },
        PumpConfig {
            overflow: OverflowPolicy::Block {
                timeout: Duration::from_secs(30),
            },
            ..Default::default()
        },
    )
    .unwrap();

    assert!(keyboard.key(1, true));
    assert!(keyboard.key(2, true));
    let deadline = Instant::now() + Duration::from_secs(5);
    while pump.stats().published < 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }

    let started = Instant::now();
    let stats = pump.stop();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(
        stats,
        PumpStats {
            published: 1,
            dropped: 1,
            ring_full: 0
        }
    );
    assert_eq!(guest.pending(1), vec![key(1)]);
}

#[test]
fn stop_takes_back_source_callbacks() {
    let guest = Guest::new();
    let keyboard = Arc::new(MemKeyboard::new("kbd0"));
    let pointer = Arc::new(MemPointer::new("ptr0"));
    let pump = RingEventPump::start(
        DOM,
        guest.ring(4),
        InputCapabilities {
            keyboard: Some(keyboard.clone()),
            pointer: Some(pointer.clone()),
            touch: None,
        },
        PumpConfig::default(),
    )
    .unwrap();
    assert!(keyboard.has_callbacks() && pointer.has_callbacks());

    let _ = pump.stop();
    assert!(!keyboard.has_callbacks());
    assert!(!pointer.has_callbacks());

    // A restarted source has nowhere to deliver.
    displ_input::Keyboard::start(keyboard.as_ref());
    assert!(!keyboard.key(1, true));
    assert_eq!(guest.prod(), 0);
}

#[test]
fn out_of_range_contact_is_dropped() {
    let guest = Guest::new();
    let touch = Arc::new(MemTouch::new("tch0"));
    let pump = RingEventPump::start(
        DOM,
        guest.ring(4),
        InputCapabilities {
            touch: Some(touch.clone()),
            ..Default::default()
        },
        PumpConfig::default(),
    )
    .unwrap();

    assert!(touch.down(300, 1, 1));
    assert!(touch.up(-1));
    assert!(touch.down(255, 1, 1));
    let stats = pump.stop();
    assert_eq!((stats.published, stats.dropped), (1, 2));
    assert_eq!(
        guest.pending(4),
        vec![InputEvent::MultiTouch {
            contact_id: 255,
            event: MultiTouchEvent::Down { abs_x: 1, abs_y: 1 }
        }]
    );
}

#[test]
fn pump_without_sources_is_idle() {
    let guest = Guest::new();
    let pump = RingEventPump::start(DOM, guest.ring(4), InputCapabilities::default(), PumpConfig::default()).unwrap();
    assert!(pump.capabilities().is_empty());
    assert_eq!(pump.stop(), PumpStats::default());
    assert_eq!(guest.channel.notifications(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn producer_stays_within_capacity(
        slots in 1u32..8,
        steps in proptest::collection::vec(any::<bool>(), 1..80),
    ) {
        let guest = Guest::new();
        let mut publisher = EventPublisher::new(guest.ring(slots), OverflowPolicy::Drop);
        for (i, publish) in steps.into_iter().enumerate() {
            let in_flight = guest.prod() - guest.cons();
            if publish {
                let result = publisher.publish(&key(i as u32));
                if in_flight == slots {
                    let full = matches!(result, Err(PumpError::RingFull { .. }));
                    prop_assert!(full);
                } else {
                    prop_assert!(result.is_ok());
                }
            } else if in_flight > 0 {
                guest.consume(1);
            }
            prop_assert!(guest.prod() - guest.cons() <= slots);
        }
    }
}
