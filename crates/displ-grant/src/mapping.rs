use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::{DomId, GrantError, GrantRef, GrantTable, PageHandle, Result, XEN_PAGE_SIZE};

/// An ordered list of guest pages mapped into the backend as one logical region.
///
/// The mapping owns its page handles: they are released when the value is dropped, on every
/// path, including a map call that fails halfway through.
pub struct GrantMapping {
    table: Arc<dyn GrantTable>,
    domid: DomId,
    refs: Vec<GrantRef>,
    pages: Vec<PageHandle>,
}

impl GrantMapping {
    /// Map every reference in `refs`, in order.
    ///
    /// If any page is refused, the pages mapped so far are unmapped before `MapFailed` is
    /// returned.
    pub fn map(table: Arc<dyn GrantTable>, domid: DomId, refs: Vec<GrantRef>) -> Result<Self> {
        if refs.is_empty() {
            return Err(GrantError::Empty);
        }

        let mut mapping = GrantMapping {
            table,
            domid,
            refs: Vec::new(),
            pages: Vec::with_capacity(refs.len()),
        };
        for &gref in &refs {
            match mapping.table.map_page(domid, gref) {
                Ok(page) => mapping.pages.push(page),
                Err(source) => {
                    warn!(
                        domid,
                        %gref,
                        mapped = mapping.pages.len(),
                        error = %source,
                        "grant map refused; releasing partial mapping"
                    );
                    // Dropping `mapping` unmaps what was mapped.
                    return Err(GrantError::MapFailed {
                        domid,
                        gref,
                        source,
                    });
                }
            }
        }
        mapping.refs = refs;
        debug!(domid, pages = mapping.pages.len(), "grant mapping created");
        Ok(mapping)
    }

    pub fn domid(&self) -> DomId {
        self.domid
    }

    pub fn refs(&self) -> &[GrantRef] {
        &self.refs
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Size of the mapped region in bytes.
    pub fn size(&self) -> usize {
        self.pages.len() * XEN_PAGE_SIZE
    }

    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len())?;
        let mut done = 0;
        while done < dst.len() {
            let pos = offset + done;
            let (page, in_page) = (pos / XEN_PAGE_SIZE, pos % XEN_PAGE_SIZE);
            let chunk = (XEN_PAGE_SIZE - in_page).min(dst.len() - done);
            self.table
                .read_page(self.pages[page], in_page, &mut dst[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        let mut done = 0;
        while done < src.len() {
            let pos = offset + done;
            let (page, in_page) = (pos / XEN_PAGE_SIZE, pos % XEN_PAGE_SIZE);
            let chunk = (XEN_PAGE_SIZE - in_page).min(src.len() - done);
            self.table
                .write_page(self.pages[page], in_page, &src[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_at(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Release the mapping now. Equivalent to dropping it.
    pub fn unmap(self) {}

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        let size = self.size();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(GrantError::OutOfBounds { offset, len, size }),
        }
    }
}

impl Drop for GrantMapping {
    fn drop(&mut self) {
        if self.pages.is_empty() {
            return;
        }
        for page in self.pages.drain(..).rev() {
            self.table.unmap_page(page);
        }
        debug!(domid = self.domid, refs = self.refs.len(), "grant mapping released");
    }
}

impl fmt::Debug for GrantMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrantMapping")
            .field("domid", &self.domid)
            .field("refs", &self.refs)
            .field("pages", &self.pages.len())
            .finish()
    }
}
