use lumbung::types::page::{Page, PageType};
use lumbung::types::{PAGE_SIZE, PAGE_HEADER_SIZE, SLOT_DIRECTORY_ENTRY_SIZE};

fn leaf(page_id: u64) -> Page {
    Page::new(page_id, PageType::Leaf, PAGE_SIZE)
}

#[test]
fn test_empty_page_round_trip() {
    let page = leaf(7);
    let bytes = page.to_bytes();
    assert_eq!(bytes.len(), PAGE_SIZE);
    let decoded = Page::from_bytes(7, &bytes).unwrap();
    assert_eq!(decoded.cell_count(), 0);
    assert_eq!(decoded.page_type, PageType::Leaf);
    assert_eq!(decoded.right_child, None);
}

#[test]
fn test_page_round_trip_preserves_cells_and_right_child() {
    let mut page = Page::new(3, PageType::Interior, PAGE_SIZE);
    page.insert_cell_at(0, b"alpha").unwrap();
    page.insert_cell_at(1, b"bravo").unwrap();
    page.insert_cell_at(2, b"charlie").unwrap();
    page.right_child = Some(42);

    let decoded = Page::from_bytes(3, &page.to_bytes()).unwrap();
    assert_eq!(decoded.cell_count(), 3);
    assert_eq!(decoded.get_cell(0).unwrap(), b"alpha");
    assert_eq!(decoded.get_cell(1).unwrap(), b"bravo");
    assert_eq!(decoded.get_cell(2).unwrap(), b"charlie");
    assert_eq!(decoded.right_child, Some(42));
}

#[test]
fn test_stored_page_id_cross_check() {
    let page = leaf(5);
    let bytes = page.to_bytes();
    assert!(Page::from_bytes(6, &bytes).is_err());
}

#[test]
fn test_positional_insert_keeps_slot_order() {
    let mut page = leaf(1);
    page.insert_cell_at(0, b"bb").unwrap();
    page.insert_cell_at(0, b"aa").unwrap();
    page.insert_cell_at(2, b"cc").unwrap();
    assert_eq!(page.get_cell(0).unwrap(), b"aa");
    assert_eq!(page.get_cell(1).unwrap(), b"bb");
    assert_eq!(page.get_cell(2).unwrap(), b"cc");
}

#[test]
fn test_remove_cell_and_reuse_space() {
    let mut page = leaf(1);
    page.insert_cell_at(0, b"first").unwrap();
    page.insert_cell_at(1, b"second").unwrap();
    page.insert_cell_at(2, b"third").unwrap();
    let before = page.available_space();

    page.remove_cell(1).unwrap();
    assert_eq!(page.cell_count(), 2);
    assert_eq!(page.get_cell(0).unwrap(), b"first");
    assert_eq!(page.get_cell(1).unwrap(), b"third");
    assert!(page.available_space() > before);

    // Removed space is reusable
    page.insert_cell_at(1, b"second again").unwrap();
    assert_eq!(page.get_cell(1).unwrap(), b"second again");
}

#[test]
fn test_replace_cell() {
    let mut page = leaf(1);
    page.insert_cell_at(0, b"old").unwrap();
    page.replace_cell(0, b"replacement").unwrap();
    assert_eq!(page.cell_count(), 1);
    assert_eq!(page.get_cell(0).unwrap(), b"replacement");
}

#[test]
fn test_can_fit_accounts_for_slot_entry() {
    let page = leaf(1);
    let max_payload = PAGE_SIZE - PAGE_HEADER_SIZE - SLOT_DIRECTORY_ENTRY_SIZE;
    assert!(page.can_fit(max_payload));
    assert!(!page.can_fit(max_payload + 1));
}

#[test]
fn test_page_fills_and_rejects_overflow() {
    let mut page = leaf(1);
    let cell = vec![0xabu8; 100];
    let mut inserted = 0;
    while page.can_fit(cell.len()) {
        page.insert_cell_at(inserted, &cell).unwrap();
        inserted += 1;
    }
    assert!(inserted > 30);
    assert!(page.insert_cell_at(inserted, &cell).is_err());
    // Existing cells are intact after the failed insert
    assert_eq!(page.cell_count(), inserted);
    assert_eq!(page.get_cell(0).unwrap(), cell.as_slice());
}
