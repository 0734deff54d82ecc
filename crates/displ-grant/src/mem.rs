//! In-process grant table.
//!
//! Plays both sides of the hypervisor: the "guest" half allocates and fills granted pages, the
//! [`GrantTable`] half maps them for the backend. Mapped pages alias the guest page, so writes
//! on either side are visible on the other, like a real foreign mapping.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use displ_protocol::displif::{XENDISPL_DIR_GREFS_OFFSET, XENDISPL_DIR_REFS_PER_PAGE};

use crate::{check_page_range, DomId, GrantRef, GrantTable, GrantTableError, PageHandle, XEN_PAGE_SIZE};

type Page = Arc<Mutex<Box<[u8]>>>;

#[derive(Default)]
struct Inner {
    next_gref: u32,
    next_handle: u64,
    granted: HashMap<(DomId, GrantRef), Page>,
    revoked: HashSet<(DomId, GrantRef)>,
    mapped: HashMap<PageHandle, (DomId, GrantRef, Page)>,
    map_calls: usize,
    stale_unmaps: usize,
}

#[derive(Default)]
pub struct MemGrantTable {
    inner: Mutex<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemGrantTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant one zero-filled page on behalf of `domid`. References start at 1; 0 is never
    /// issued.
    pub fn grant_page(&self, domid: DomId) -> GrantRef {
        self.grant_page_inner(domid).0
    }

    pub fn grant_pages(&self, domid: DomId, count: usize) -> Vec<GrantRef> {
        (0..count).map(|_| self.grant_page(domid)).collect()
    }

    /// Grant enough pages for `size` bytes plus a directory describing them, the way a display
    /// frontend does before `DBUF_CREATE`. Returns `(directory head, buffer refs)`.
    pub fn grant_buffer(&self, domid: DomId, size: usize) -> (GrantRef, Vec<GrantRef>) {
        let refs = self.grant_pages(domid, size.div_ceil(XEN_PAGE_SIZE));
        let head = self.build_directory(domid, &refs);
        (head, refs)
    }

    /// Write `refs` into freshly granted, chained directory pages and return the head.
    pub fn build_directory(&self, domid: DomId, refs: &[GrantRef]) -> GrantRef {
        let chunks: Vec<&[GrantRef]> = if refs.is_empty() {
            vec![refs]
        } else {
            refs.chunks(XENDISPL_DIR_REFS_PER_PAGE).collect()
        };
        let dir_pages: Vec<(GrantRef, Page)> =
            chunks.iter().map(|_| self.grant_page_inner(domid)).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let next = dir_pages.get(i + 1).map_or(0, |(g, _)| g.0);
            let mut data = lock(&dir_pages[i].1);
            data[0..4].copy_from_slice(&next.to_le_bytes());
            for (slot, gref) in chunk.iter().enumerate() {
                let at = XENDISPL_DIR_GREFS_OFFSET + slot * 4;
                data[at..at + 4].copy_from_slice(&gref.0.to_le_bytes());
            }
        }
        dir_pages[0].0
    }

    /// Revoke a grant. Later map attempts fail; existing mappings stay valid.
    pub fn revoke(&self, domid: DomId, gref: GrantRef) {
        lock(&self.inner).revoked.insert((domid, gref));
    }

    /// Write into a granted page from the guest side.
    pub fn guest_write(
        &self,
        domid: DomId,
        gref: GrantRef,
        offset: usize,
        src: &[u8],
    ) -> Result<(), GrantTableError> {
        check_page_range(offset, src.len())?;
        let page = self.guest_page(domid, gref)?;
        lock(&page)[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn guest_read(
        &self,
        domid: DomId,
        gref: GrantRef,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>, GrantTableError> {
        check_page_range(offset, len)?;
        let page = self.guest_page(domid, gref)?;
        let data = lock(&page);
        Ok(data[offset..offset + len].to_vec())
    }

    pub fn guest_read_u32(
        &self,
        domid: DomId,
        gref: GrantRef,
        offset: usize,
    ) -> Result<u32, GrantTableError> {
        let bytes = self.guest_read(domid, gref, offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn guest_write_u32(
        &self,
        domid: DomId,
        gref: GrantRef,
        offset: usize,
        value: u32,
    ) -> Result<(), GrantTableError> {
        self.guest_write(domid, gref, offset, &value.to_le_bytes())
    }

    /// Number of pages currently mapped by the backend.
    pub fn active_mappings(&self) -> usize {
        lock(&self.inner).mapped.len()
    }

    /// Total `map_page` calls, successful or not.
    pub fn map_calls(&self) -> usize {
        lock(&self.inner).map_calls
    }

    /// `unmap_page` calls naming a handle that was not mapped (double unmaps).
    pub fn stale_unmaps(&self) -> usize {
        lock(&self.inner).stale_unmaps
    }

    /// Grant references currently mapped, in no particular order.
    pub fn mapped_refs(&self) -> Vec<GrantRef> {
        lock(&self.inner).mapped.values().map(|(_, gref, _)| *gref).collect()
    }

    fn grant_page_inner(&self, domid: DomId) -> (GrantRef, Page) {
        let mut inner = lock(&self.inner);
        inner.next_gref += 1;
        let gref = GrantRef(inner.next_gref);
        let page: Page = Arc::new(Mutex::new(vec![0u8; XEN_PAGE_SIZE].into_boxed_slice()));
        inner.granted.insert((domid, gref), page.clone());
        (gref, page)
    }

    fn guest_page(&self, domid: DomId, gref: GrantRef) -> Result<Page, GrantTableError> {
        lock(&self.inner)
            .granted
            .get(&(domid, gref))
            .cloned()
            .ok_or(GrantTableError::Refused { domid, gref })
    }

    fn mapped_page(&self, page: PageHandle) -> Result<Page, GrantTableError> {
        lock(&self.inner)
            .mapped
            .get(&page)
            .map(|(_, _, p)| p.clone())
            .ok_or(GrantTableError::StaleHandle(page))
    }
}

impl GrantTable for MemGrantTable {
    fn map_page(&self, domid: DomId, gref: GrantRef) -> Result<PageHandle, GrantTableError> {
        let mut inner = lock(&self.inner);
        inner.map_calls += 1;
        if inner.revoked.contains(&(domid, gref)) {
            return Err(GrantTableError::Refused { domid, gref });
        }
        let page = inner
            .granted
            .get(&(domid, gref))
            .cloned()
            .ok_or(GrantTableError::Refused { domid, gref })?;
        inner.next_handle += 1;
        let handle = PageHandle(inner.next_handle);
        inner.mapped.insert(handle, (domid, gref, page));
        Ok(handle)
    }

    fn unmap_page(&self, page: PageHandle) {
        let mut inner = lock(&self.inner);
        if inner.mapped.remove(&page).is_none() {
            inner.stale_unmaps += 1;
        }
    }

    fn read_page(&self, page: PageHandle, offset: usize, dst: &mut [u8]) -> Result<(), GrantTableError> {
        check_page_range(offset, dst.len())?;
        let page = self.mapped_page(page)?;
        let data = lock(&page);
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
        Ok(())
    }

    fn write_page(&self, page: PageHandle, offset: usize, src: &[u8]) -> Result<(), GrantTableError> {
        check_page_range(offset, src.len())?;
        let page = self.mapped_page(page)?;
        let mut data = lock(&page);
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}
