//! Display buffer page directory resolution.
//!
//! The guest chains directory pages through their first word. The chain is untrusted: it is
//! resolved once, up front, into an owned list of exactly as many references as the declared
//! size needs, and each directory page is mapped only while its entries are read.

use std::collections::HashSet;

use displ_protocol::displif::{
    XENDISPL_DIR_GREFS_OFFSET, XENDISPL_DIR_NEXT_PAGE_OFFSET, XENDISPL_DIR_REFS_PER_PAGE,
};
use tracing::{debug, warn};

use crate::{DomId, GrantError, GrantRef, GrantTable, PageHandle, Result, XEN_PAGE_SIZE};

/// Largest display buffer the backend accepts from a guest (256 MiB).
pub const MAX_BUFFER_SIZE: u32 = 256 * 1024 * 1024;

/// Pages needed to hold `size` bytes.
pub fn page_count(size: u32) -> usize {
    (size as usize).div_ceil(XEN_PAGE_SIZE)
}

/// Unmaps a directory page when the walk moves on, or bails out.
struct DirectoryPage<'a> {
    table: &'a dyn GrantTable,
    page: PageHandle,
}

impl Drop for DirectoryPage<'_> {
    fn drop(&mut self) {
        self.table.unmap_page(self.page);
    }
}

/// Resolve the directory starting at `head` into the ordered buffer page references covering
/// `size` bytes.
///
/// Entries past `ceil(size / page)` on the last directory page are ignored and no further
/// `next` links are followed once enough references have been collected.
pub fn resolve_directory(
    table: &dyn GrantTable,
    domid: DomId,
    head: GrantRef,
    size: u32,
) -> Result<Vec<GrantRef>> {
    if size == 0 || size > MAX_BUFFER_SIZE {
        warn!(domid, %head, size, "rejecting display buffer size");
        return Err(GrantError::InvalidDirectory {
            head,
            reason: "buffer size out of range",
        });
    }

    let wanted = page_count(size);
    let mut refs = Vec::with_capacity(wanted);
    let mut visited = HashSet::new();
    let mut current = head;
    let mut dir_pages = 0usize;

    while refs.len() < wanted {
        if current.0 == 0 {
            warn!(domid, %head, collected = refs.len(), wanted, "grant directory ends early");
            return Err(GrantError::InvalidDirectory {
                head,
                reason: "directory chain ends before the buffer is covered",
            });
        }
        if !visited.insert(current) {
            warn!(domid, %head, gref = %current, "grant directory loops");
            return Err(GrantError::InvalidDirectory {
                head,
                reason: "directory chain revisits a page",
            });
        }

        let page = table
            .map_page(domid, current)
            .map_err(|source| GrantError::MapFailed {
                domid,
                gref: current,
                source,
            })?;
        let page = DirectoryPage { table, page };

        let take = (wanted - refs.len()).min(XENDISPL_DIR_REFS_PER_PAGE);
        let mut next = [0u8; 4];
        page.table
            .read_page(page.page, XENDISPL_DIR_NEXT_PAGE_OFFSET, &mut next)?;
        let mut entries = vec![0u8; take * 4];
        page.table
            .read_page(page.page, XENDISPL_DIR_GREFS_OFFSET, &mut entries)?;
        drop(page);

        refs.extend(
            entries
                .chunks_exact(4)
                .map(|e| GrantRef(u32::from_le_bytes([e[0], e[1], e[2], e[3]]))),
        );
        dir_pages += 1;
        current = GrantRef(u32::from_le_bytes(next));
    }

    debug!(domid, %head, pages = refs.len(), dir_pages, "grant directory resolved");
    Ok(refs)
}
