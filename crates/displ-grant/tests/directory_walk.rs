use std::sync::Arc;

use displ_grant::mem::MemGrantTable;
use displ_grant::{page_count, resolve_directory, GrantMapping, GrantRef, XEN_PAGE_SIZE};
use displ_protocol::displif::XENDISPL_DIR_REFS_PER_PAGE;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

const DOM: u16 = 7;

#[test]
fn two_page_directory_for_16k_buffer() {
    let table = MemGrantTable::new();
    // A two-page directory; a 16 KiB buffer is covered by the first four entries.
    let (head, refs) = table.grant_buffer(DOM, (XENDISPL_DIR_REFS_PER_PAGE + 1) * XEN_PAGE_SIZE);
    let resolved = resolve_directory(&table, DOM, head, 16384).unwrap();
    assert_eq!(resolved.len(), 4);
    assert_eq!(resolved, refs[..4].to_vec());
    assert_eq!(table.active_mappings(), 0);
}

#[test]
fn multi_page_directory_is_followed_in_order() {
    let table = MemGrantTable::new();
    let count = XENDISPL_DIR_REFS_PER_PAGE + 5;
    let (head, refs) = table.grant_buffer(DOM, count * XEN_PAGE_SIZE);
    let resolved = resolve_directory(&table, DOM, head, (count * XEN_PAGE_SIZE) as u32).unwrap();
    assert_eq!(resolved.len(), count);
    assert_eq!(resolved, refs);
}

#[test]
fn walker_stops_before_following_extra_links() {
    let table = MemGrantTable::new();
    let count = XENDISPL_DIR_REFS_PER_PAGE * 2;
    let (head, refs) = table.grant_buffer(DOM, count * XEN_PAGE_SIZE);
    // The buffer only needs the first directory page; the second is never mapped.
    let second_dir = GrantRef(table.guest_read_u32(DOM, head, 0).unwrap());
    table.revoke(DOM, second_dir);
    let size = (XENDISPL_DIR_REFS_PER_PAGE * XEN_PAGE_SIZE) as u32;
    let resolved = resolve_directory(&table, DOM, head, size).unwrap();
    assert_eq!(resolved, refs[..XENDISPL_DIR_REFS_PER_PAGE].to_vec());
    assert_eq!(table.map_calls(), 1);
}

#[test]
fn resolved_refs_map_as_one_region() {
    let table = Arc::new(MemGrantTable::new());
    let (head, refs) = table.grant_buffer(DOM, 3 * XEN_PAGE_SIZE);
    table.guest_write(DOM, refs[2], 0, b"tail").unwrap();

    let resolved = resolve_directory(table.as_ref(), DOM, head, 3 * XEN_PAGE_SIZE as u32).unwrap();
    let mapping = GrantMapping::map(table.clone(), DOM, resolved).unwrap();
    let mut buf = [0u8; 4];
    mapping.read_at(2 * XEN_PAGE_SIZE, &mut buf).unwrap();
    assert_eq!(&buf, b"tail");
    drop(mapping);
    assert_eq!(table.active_mappings(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn walker_returns_exactly_ceil_size_over_page(
        size in 1u32..=(3 * XENDISPL_DIR_REFS_PER_PAGE * XEN_PAGE_SIZE) as u32,
        extra_pages in 0usize..4,
    ) {
        let table = MemGrantTable::new();
        let wanted = page_count(size);
        // The guest may grant more pages than the size needs; trailing entries are ignored.
        let refs = table.grant_pages(DOM, wanted + extra_pages);
        let head = table.build_directory(DOM, &refs);

        let resolved = resolve_directory(&table, DOM, head, size).unwrap();
        prop_assert_eq!(resolved.len(), (size as usize).div_ceil(XEN_PAGE_SIZE));
        prop_assert_eq!(&resolved[..], &refs[..wanted]);
        prop_assert_eq!(table.active_mappings(), 0);
        prop_assert_eq!(table.map_calls(), wanted.div_ceil(XENDISPL_DIR_REFS_PER_PAGE));
    }
}
