use std::sync::Arc;

use displ_grant::mem::MemGrantTable;
use displ_grant::{GrantMapping, GrantRef};
use displ_ring::{CountingEventChannel, EventRing, EventRingLayout, FrontRing, RequestRing, RingError};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

const DOM: u16 = 2;
const SLOT: usize = 64;

fn request_pair() -> (FrontRing, RequestRing, Arc<CountingEventChannel>) {
    let table = Arc::new(MemGrantTable::new());
    let gref = table.grant_page(DOM);
    let front_page = GrantMapping::map(table.clone(), DOM, vec![gref]).unwrap();
    let back_page = GrantMapping::map(table, DOM, vec![gref]).unwrap();
    let front = FrontRing::init(front_page, SLOT).unwrap();
    let channel = Arc::new(CountingEventChannel::new(9));
    let back = RequestRing::new(back_page, SLOT, channel.clone()).unwrap();
    (front, back, channel)
}

#[test]
fn every_request_gets_one_response_in_order() {
    let (mut front, mut back, channel) = request_pair();
    for i in 0..5u8 {
        front.push_request(&[i; SLOT]).unwrap();
    }

    let handled = back
        .service(|req| {
            let mut rsp = vec![0u8; SLOT];
            rsp[0] = req[0] + 100;
            rsp
        })
        .unwrap();
    assert_eq!(handled, 5);
    // The frontend's initial rsp_event of 1 asks for a wakeup.
    assert_eq!(channel.notifications(), 1);

    let mut seen = Vec::new();
    while let Some(rsp) = front.pop_response().unwrap() {
        seen.push(rsp[0]);
    }
    assert_eq!(seen, vec![100, 101, 102, 103, 104]);
}

#[test]
fn requests_wrap_around_the_ring() {
    let (mut front, mut back, _) = request_pair();
    for round in 0..3u8 {
        for i in 0..32u8 {
            front.push_request(&[round.wrapping_mul(32).wrapping_add(i); SLOT]).unwrap();
        }
        assert!(matches!(front.push_request(&[0; SLOT]), Err(RingError::Full { .. })));
        back.service(|req| req.to_vec()).unwrap();
        for i in 0..32u8 {
            let rsp = front.pop_response().unwrap().unwrap();
            assert_eq!(rsp[0], round.wrapping_mul(32).wrapping_add(i));
        }
    }
}

#[test]
fn producer_overflow_is_detected() {
    let (mut front, mut back, _) = request_pair();
    front.force_req_prod(33).unwrap();
    assert!(matches!(
        back.pop_request(),
        Err(RingError::Corrupt { prod: 33, cons: 0, capacity: 32 })
    ));
}

#[test]
fn final_check_rearms_request_event() {
    let (_front, mut back, _) = request_pair();
    assert!(!back.final_check_for_requests().unwrap());
}

fn kbd_ring(slots: u32) -> (Arc<MemGrantTable>, GrantRef, EventRing) {
    let table = Arc::new(MemGrantTable::new());
    let gref = table.grant_page(DOM);
    let page = GrantMapping::map(table.clone(), DOM, vec![gref]).unwrap();
    let ring = EventRing::new(
        page,
        EventRingLayout::KBDIF_IN.with_slots(slots),
        Arc::new(CountingEventChannel::new(1)),
    )
    .unwrap();
    (table, gref, ring)
}

#[derive(Debug, Clone)]
enum Step {
    Publish,
    Consume(u32),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => Just(Step::Publish),
        1 => (0u32..8).prop_map(Step::Consume),
    ]
}

proptest! {
    #[test]
    fn producer_never_passes_consumer_plus_capacity(
        slots in 1u32..=25,
        steps in proptest::collection::vec(step(), 1..200),
    ) {
        let (table, gref, mut ring) = kbd_ring(slots);
        let mut cons = 0u32;
        for step in steps {
            match step {
                Step::Publish => {
                    let before = ring.producer_index();
                    match ring.push(&[0x55; 40]) {
                        Ok(()) => prop_assert_eq!(ring.producer_index(), before + 1),
                        Err(RingError::Full { .. }) => {
                            prop_assert_eq!(before - cons, slots);
                            prop_assert_eq!(ring.producer_index(), before);
                        }
                        Err(other) => prop_assert!(false, "unexpected error {other}"),
                    }
                }
                Step::Consume(n) => {
                    cons += n.min(ring.producer_index() - cons);
                    table.guest_write_u32(DOM, gref, 0, cons).unwrap();
                }
            }
            let published = table.guest_read_u32(DOM, gref, 4).unwrap();
            prop_assert_eq!(published, ring.producer_index());
            prop_assert!(published - cons <= slots);
        }
    }
}
