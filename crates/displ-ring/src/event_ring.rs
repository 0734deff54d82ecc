use std::fmt;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use displ_grant::GrantMapping;
use displ_protocol::{displif, kbdif};
use tracing::{trace, warn};

use crate::{EventChannel, Result, RingError};

/// Where the indices and slots of an event page live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRingLayout {
    pub cons_offset: usize,
    pub prod_offset: usize,
    pub ring_offset: usize,
    pub slot_size: usize,
    pub slots: u32,
}

impl EventRingLayout {
    /// kbdif "in" ring: 25 records of 40 bytes at offset 1024.
    pub const KBDIF_IN: Self = Self {
        cons_offset: kbdif::page_offset::IN_CONS,
        prod_offset: kbdif::page_offset::IN_PROD,
        ring_offset: kbdif::XENKBD_IN_RING_OFFS,
        slot_size: kbdif::XENKBD_IN_EVENT_SIZE,
        slots: kbdif::XENKBD_IN_RING_LEN as u32,
    };

    /// displif event page: 63 records of 64 bytes at offset 64.
    pub const DISPLIF_EVT: Self = Self {
        cons_offset: displif::event_page::IN_CONS,
        prod_offset: displif::event_page::IN_PROD,
        ring_offset: displif::event_page::RING_OFFSET,
        slot_size: displif::XENDISPL_EVT_SIZE,
        slots: displif::event_page::RING_LEN as u32,
    };

    /// Same layout, fewer usable slots.
    pub fn with_slots(self, slots: u32) -> Self {
        Self { slots, ..self }
    }

    fn end(&self) -> usize {
        self.ring_offset + self.slot_size * self.slots as usize
    }
}

/// Producer side of a backend → frontend event page.
///
/// Only the producer index is written by the backend; it is kept privately and published after
/// each record. The guest's consumer index is re-read on every push and checked against the
/// capacity, so `producer - consumer <= slots` holds after every publish.
pub struct EventRing {
    page: GrantMapping,
    layout: EventRingLayout,
    channel: Arc<dyn EventChannel>,
    prod: u32,
}

impl EventRing {
    /// Wrap an already-mapped event page. The current producer index on the page is adopted so
    /// a reconnecting backend continues where the previous one stopped.
    pub fn new(
        page: GrantMapping,
        layout: EventRingLayout,
        channel: Arc<dyn EventChannel>,
    ) -> Result<Self> {
        if layout.slots == 0 || layout.slot_size == 0 || layout.end() > page.size() {
            return Err(RingError::BadLayout);
        }
        let prod = page.read_u32(layout.prod_offset)?;
        Ok(Self {
            page,
            layout,
            channel,
            prod,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.layout.slots
    }

    pub fn producer_index(&self) -> u32 {
        self.prod
    }

    pub fn consumer_index(&self) -> Result<u32> {
        Ok(self.page.read_u32(self.layout.cons_offset)?)
    }

    /// Free slots, or `Corrupt` if the guest's consumer index is inconsistent.
    pub fn free_slots(&self) -> Result<u32> {
        let cons = self.consumer_index()?;
        let used = self.prod.wrapping_sub(cons);
        if used > self.layout.slots {
            warn!(prod = self.prod, cons, capacity = self.layout.slots, "event ring corrupt");
            return Err(RingError::Corrupt {
                prod: self.prod,
                cons,
                capacity: self.layout.slots,
            });
        }
        Ok(self.layout.slots - used)
    }

    /// Append one record and notify the frontend.
    pub fn push(&mut self, record: &[u8]) -> Result<()> {
        if record.len() != self.layout.slot_size {
            return Err(RingError::RecordSize {
                expected: self.layout.slot_size,
                found: record.len(),
            });
        }
        if self.free_slots()? == 0 {
            return Err(RingError::Full {
                capacity: self.layout.slots,
            });
        }

        let slot = (self.prod % self.layout.slots) as usize;
        let offset = self.layout.ring_offset + slot * self.layout.slot_size;
        self.page.write_at(offset, record)?;
        // The record must be visible before the index that publishes it.
        fence(Ordering::Release);
        self.prod = self.prod.wrapping_add(1);
        self.page.write_u32(self.layout.prod_offset, self.prod)?;
        trace!(prod = self.prod, slot, "event published");
        self.channel.notify()?;
        Ok(())
    }
}

impl fmt::Debug for EventRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRing")
            .field("layout", &self.layout)
            .field("prod", &self.prod)
            .field("port", &self.channel.port())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CountingEventChannel;
    use displ_grant::mem::MemGrantTable;

    fn ring(layout: EventRingLayout) -> (Arc<MemGrantTable>, displ_grant::GrantRef, Arc<CountingEventChannel>, EventRing) {
        let table = Arc::new(MemGrantTable::new());
        let gref = table.grant_page(1);
        let page = GrantMapping::map(table.clone(), 1, vec![gref]).unwrap();
        let channel = Arc::new(CountingEventChannel::new(5));
        let ring = EventRing::new(page, layout, channel.clone()).unwrap();
        (table, gref, channel, ring)
    }

    #[test]
    fn push_writes_slot_then_index() {
        let (table, gref, channel, mut ring) = ring(EventRingLayout::KBDIF_IN);
        let record = [0xabu8; 40];
        ring.push(&record).unwrap();
        assert_eq!(table.guest_read(1, gref, 1024, 40).unwrap(), record.to_vec());
        assert_eq!(table.guest_read_u32(1, gref, 4).unwrap(), 1);
        assert_eq!(channel.notifications(), 1);
    }

    #[test]
    fn slot_index_wraps_modulo_capacity() {
        let (table, gref, _, mut ring) = ring(EventRingLayout::KBDIF_IN);
        for i in 0..25u8 {
            ring.push(&[i; 40]).unwrap();
        }
        table.guest_write_u32(1, gref, 0, 25).unwrap();
        ring.push(&[0xee; 40]).unwrap();
        // Record 25 lands in slot 0.
        assert_eq!(table.guest_read(1, gref, 1024, 1).unwrap(), vec![0xee]);
    }

    #[test]
    fn full_ring_does_not_advance_producer() {
        let (table, gref, channel, mut ring) = ring(EventRingLayout::KBDIF_IN.with_slots(4));
        for _ in 0..4 {
            ring.push(&[1; 40]).unwrap();
        }
        assert!(matches!(ring.push(&[1; 40]), Err(RingError::Full { capacity: 4 })));
        assert_eq!(ring.producer_index(), 4);
        assert_eq!(table.guest_read_u32(1, gref, 4).unwrap(), 4);
        assert_eq!(channel.notifications(), 4);
    }

    #[test]
    fn consumer_ahead_of_producer_is_corrupt() {
        let (table, gref, _, mut ring) = ring(EventRingLayout::KBDIF_IN);
        table.guest_write_u32(1, gref, 0, 7).unwrap();
        assert!(matches!(ring.push(&[0; 40]), Err(RingError::Corrupt { .. })));
        assert_eq!(ring.producer_index(), 0);
    }

    #[test]
    fn wrong_record_size_is_rejected() {
        let (_, _, _, mut ring) = ring(EventRingLayout::DISPLIF_EVT);
        assert!(matches!(
            ring.push(&[0; 40]),
            Err(RingError::RecordSize { expected: 64, found: 40 })
        ));
    }

    #[test]
    fn adopts_existing_producer_index() {
        let table = Arc::new(MemGrantTable::new());
        let gref = table.grant_page(1);
        table.guest_write_u32(1, gref, 0, 10).unwrap();
        table.guest_write_u32(1, gref, 4, 12).unwrap();
        let page = GrantMapping::map(table.clone(), 1, vec![gref]).unwrap();
        let ring = EventRing::new(page, EventRingLayout::KBDIF_IN, Arc::new(CountingEventChannel::new(1))).unwrap();
        assert_eq!(ring.producer_index(), 12);
        assert_eq!(ring.free_slots().unwrap(), 23);
    }
}
