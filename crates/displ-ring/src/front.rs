use displ_grant::GrantMapping;
use displ_protocol::ring::{ring_entries, slot_offset, REQ_EVENT, REQ_PROD, RSP_EVENT, RSP_PROD};

use crate::{Result, RingError};

/// Frontend half of a request/response ring.
///
/// The backend never uses this; it exists so guest behaviour can be driven from tooling and
/// tests against the same page layout the backend reads.
#[derive(Debug)]
pub struct FrontRing {
    page: GrantMapping,
    slot_size: usize,
    entries: u32,
    req_prod_pvt: u32,
    rsp_cons: u32,
}

impl FrontRing {
    /// Initialise the shared header and take ownership of the frontend indices.
    pub fn init(page: GrantMapping, slot_size: usize) -> Result<Self> {
        let entries = ring_entries(slot_size);
        if entries == 0 || page.size() < slot_offset(0, entries, slot_size) + entries * slot_size {
            return Err(RingError::BadLayout);
        }
        page.write_u32(REQ_PROD, 0)?;
        page.write_u32(RSP_PROD, 0)?;
        page.write_u32(REQ_EVENT, 1)?;
        page.write_u32(RSP_EVENT, 1)?;
        Ok(Self {
            page,
            slot_size,
            entries: entries as u32,
            req_prod_pvt: 0,
            rsp_cons: 0,
        })
    }

    /// Write and publish one request.
    pub fn push_request(&mut self, request: &[u8]) -> Result<()> {
        if request.len() > self.slot_size {
            return Err(RingError::RecordSize {
                expected: self.slot_size,
                found: request.len(),
            });
        }
        if self.req_prod_pvt.wrapping_sub(self.rsp_cons) >= self.entries {
            return Err(RingError::Full {
                capacity: self.entries,
            });
        }
        let offset = slot_offset(self.req_prod_pvt, self.entries as usize, self.slot_size);
        self.page.write_at(offset, request)?;
        self.req_prod_pvt = self.req_prod_pvt.wrapping_add(1);
        self.page.write_u32(REQ_PROD, self.req_prod_pvt)?;
        Ok(())
    }

    /// Overwrite the shared request producer index without writing a slot, the way a broken
    /// or hostile guest might.
    pub fn force_req_prod(&mut self, value: u32) -> Result<()> {
        self.page.write_u32(REQ_PROD, value)?;
        Ok(())
    }

    pub fn pop_response(&mut self) -> Result<Option<Vec<u8>>> {
        let rsp_prod = self.page.read_u32(RSP_PROD)?;
        if rsp_prod == self.rsp_cons {
            return Ok(None);
        }
        let mut slot = vec![0u8; self.slot_size];
        let offset = slot_offset(self.rsp_cons, self.entries as usize, self.slot_size);
        self.page.read_at(offset, &mut slot)?;
        self.rsp_cons = self.rsp_cons.wrapping_add(1);
        self.page.write_u32(RSP_EVENT, self.rsp_cons.wrapping_add(1))?;
        Ok(Some(slot))
    }
}
