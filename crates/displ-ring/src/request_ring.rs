use std::fmt;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use displ_grant::GrantMapping;
use displ_protocol::ring::{ring_entries, slot_offset, REQ_EVENT, REQ_PROD, RSP_EVENT, RSP_PROD};
use tracing::{trace, warn};

use crate::{EventChannel, Result, RingError};

/// Backend half of a shared request/response ring.
///
/// `req_cons` and the private response producer live only here; the guest sees responses once
/// [`RequestRing::push_responses`] publishes them.
pub struct RequestRing {
    page: GrantMapping,
    channel: Arc<dyn EventChannel>,
    slot_size: usize,
    entries: u32,
    req_cons: u32,
    rsp_prod_pvt: u32,
}

impl RequestRing {
    pub fn new(page: GrantMapping, slot_size: usize, channel: Arc<dyn EventChannel>) -> Result<Self> {
        let entries = ring_entries(slot_size);
        if entries == 0 || page.size() < slot_offset(0, entries, slot_size) + entries * slot_size {
            return Err(RingError::BadLayout);
        }
        Ok(Self {
            page,
            channel,
            slot_size,
            entries: entries as u32,
            req_cons: 0,
            rsp_prod_pvt: 0,
        })
    }

    pub fn entries(&self) -> u32 {
        self.entries
    }

    pub fn channel(&self) -> &Arc<dyn EventChannel> {
        &self.channel
    }

    /// Take the next unconsumed request, if any.
    ///
    /// A guest producer index more than one ring ahead of the backend is reported as `Corrupt`
    /// rather than followed.
    pub fn pop_request(&mut self) -> Result<Option<Vec<u8>>> {
        let req_prod = self.page.read_u32(REQ_PROD)?;
        fence(Ordering::Acquire);
        let pending = req_prod.wrapping_sub(self.req_cons);
        if pending > self.entries {
            warn!(req_prod, req_cons = self.req_cons, "request producer overflow");
            return Err(RingError::Corrupt {
                prod: req_prod,
                cons: self.req_cons,
                capacity: self.entries,
            });
        }
        if pending == 0 {
            return Ok(None);
        }
        let mut slot = vec![0u8; self.slot_size];
        self.page.read_at(self.offset(self.req_cons), &mut slot)?;
        self.req_cons = self.req_cons.wrapping_add(1);
        Ok(Some(slot))
    }

    /// Queue a response in the next response slot. Not visible to the guest until
    /// [`RequestRing::push_responses`].
    pub fn put_response(&mut self, response: &[u8]) -> Result<()> {
        if response.len() > self.slot_size {
            return Err(RingError::RecordSize {
                expected: self.slot_size,
                found: response.len(),
            });
        }
        self.page.write_at(self.offset(self.rsp_prod_pvt), response)?;
        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);
        Ok(())
    }

    /// Publish queued responses and notify the guest if it asked to be woken for them.
    /// Returns whether a notification was sent.
    pub fn push_responses(&mut self) -> Result<bool> {
        let old = self.page.read_u32(RSP_PROD)?;
        let new = self.rsp_prod_pvt;
        fence(Ordering::Release);
        self.page.write_u32(RSP_PROD, new)?;
        fence(Ordering::SeqCst);
        let rsp_event = self.page.read_u32(RSP_EVENT)?;
        let notify = new.wrapping_sub(rsp_event) < new.wrapping_sub(old);
        if notify {
            self.channel.notify()?;
        }
        trace!(rsp_prod = new, rsp_event, notify, "responses pushed");
        Ok(notify)
    }

    /// Re-arm `req_event` and check once more for requests that raced with it.
    pub fn final_check_for_requests(&mut self) -> Result<bool> {
        if self.has_unconsumed()? {
            return Ok(true);
        }
        self.page.write_u32(REQ_EVENT, self.req_cons.wrapping_add(1))?;
        fence(Ordering::SeqCst);
        self.has_unconsumed()
    }

    /// Drain every pending request through `handler`, one response per request, until the
    /// final check finds the ring empty. Returns the number of requests handled.
    pub fn service<F>(&mut self, mut handler: F) -> Result<usize>
    where
        F: FnMut(&[u8]) -> Vec<u8>,
    {
        let mut handled = 0;
        loop {
            while let Some(request) = self.pop_request()? {
                let response = handler(&request);
                self.put_response(&response)?;
                handled += 1;
            }
            self.push_responses()?;
            if !self.final_check_for_requests()? {
                return Ok(handled);
            }
        }
    }

    fn has_unconsumed(&self) -> Result<bool> {
        let req_prod = self.page.read_u32(REQ_PROD)?;
        Ok(req_prod != self.req_cons)
    }

    fn offset(&self, index: u32) -> usize {
        slot_offset(index, self.entries as usize, self.slot_size)
    }
}

impl fmt::Debug for RequestRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRing")
            .field("entries", &self.entries)
            .field("req_cons", &self.req_cons)
            .field("rsp_prod_pvt", &self.rsp_prod_pvt)
            .finish()
    }
}
