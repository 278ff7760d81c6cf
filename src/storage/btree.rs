use serde::{Deserialize, Serialize};

use crate::types::error::{DatabaseError, Result};
use crate::types::page::{Page, PageType};
use crate::types::record::Record;
use crate::types::value::{DataType, Value};
use crate::types::{PAGE_HEADER_SIZE, PageId, SLOT_DIRECTORY_ENTRY_SIZE};

/// Nodes are rebalanced once their cell payload drops below
/// `usable_size / MIN_FILL_DIVISOR` (the root is exempt).
pub const MIN_FILL_DIVISOR: usize = 4;

/// Page access seam between the tree and the transaction layer.
///
/// Reads resolve through write set → WAL → cache → store; writes stage
/// copy-on-write pages into the active write transaction, so concurrent
/// readers keep observing pre-mutation pages until commit.
pub trait PageIo {
    fn read_page(&mut self, page_id: PageId) -> Result<Page>;
    fn write_page(&mut self, page: Page) -> Result<()>;
    fn allocate_page(&mut self, page_type: PageType) -> Result<Page>;
    fn free_page(&mut self, page_id: PageId) -> Result<()>;
    fn usable_size(&self) -> usize;
    /// Record that a split/merge/root move happened (invalidates cursors).
    fn mark_structural(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplicatePolicy {
    Overwrite,
    Reject,
}

impl DuplicatePolicy {
    pub fn name(&self) -> &'static str {
        match self {
            DuplicatePolicy::Overwrite => "overwrite",
            DuplicatePolicy::Reject => "reject",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "overwrite" => Ok(DuplicatePolicy::Overwrite),
            "reject" => Ok(DuplicatePolicy::Reject),
            _ => Err(DatabaseError::CorruptedDatabase {
                reason: format!("unknown duplicate policy: {}", name),
            }),
        }
    }
}

/// Catalog entry for one tree: its name, root page, declared key type and
/// duplicate policy (both fixed at creation).
#[derive(Debug, Clone, PartialEq)]
pub struct TreeDef {
    pub name: String,
    pub root: PageId,
    pub key_type: DataType,
    pub on_duplicate: DuplicatePolicy,
}

/*
 * Cell formats (keys use the self-delimiting Value codec):
 *   leaf cell:     key | record
 *   interior cell: child_page_id(8) | key
 *
 * An interior cell's child holds every key strictly below the cell's key;
 * the page-level right_child pointer holds the rest. Slots are kept in
 * key order, so lookup is a scan with early exit and splits never re-sort.
 */

fn leaf_cell(key: &Value, record: &Record) -> Vec<u8> {
    let mut cell = key.to_bytes();
    cell.extend_from_slice(&record.to_bytes());
    cell
}

fn parse_leaf_cell(cell: &[u8]) -> Result<(Value, Record)> {
    let (key, consumed) = Value::from_bytes(cell)?;
    let record = Record::from_bytes(&cell[consumed..])?;
    Ok((key, record))
}

fn leaf_cell_key(cell: &[u8]) -> Result<Value> {
    Ok(Value::from_bytes(cell)?.0)
}

fn interior_cell(child: PageId, key: &Value) -> Vec<u8> {
    let mut cell = Vec::with_capacity(8 + key.serialized_size());
    cell.extend_from_slice(&child.to_le_bytes());
    cell.extend_from_slice(&key.to_bytes());
    cell
}

fn parse_interior_cell(cell: &[u8]) -> Result<(PageId, Value)> {
    if cell.len() < 9 {
        return Err(DatabaseError::SerializationError {
            details: "interior cell too short".to_string(),
        });
    }
    let child = u64::from_le_bytes(cell[0..8].try_into().expect("8-byte slice"));
    let (key, _) = Value::from_bytes(&cell[8..])?;
    Ok((child, key))
}

fn cell_key(page: &Page, slot: usize) -> Result<Value> {
    let cell = page.get_cell(slot).ok_or(DatabaseError::InvalidSlotIndex {
        index: slot,
        max: page.cell_count(),
    })?;
    if page.is_leaf() {
        leaf_cell_key(cell)
    } else {
        Ok(parse_interior_cell(cell)?.1)
    }
}

/// Child page for branch `index` of an interior page; `cell_count()` is
/// the right-child branch.
fn child_at(page: &Page, index: usize) -> Result<PageId> {
    if index < page.cell_count() {
        let cell = page.get_cell(index).expect("slot bounds checked");
        Ok(parse_interior_cell(cell)?.0)
    } else {
        page.right_child.ok_or(DatabaseError::CorruptedPage {
            page_id: page.page_id,
            reason: "interior page missing right child".to_string(),
        })
    }
}

fn set_cell_child(page: &mut Page, index: usize, child: PageId) -> Result<()> {
    let cell = page.get_cell(index).ok_or(DatabaseError::InvalidSlotIndex {
        index,
        max: page.cell_count(),
    })?;
    let (_, key) = parse_interior_cell(cell)?;
    page.replace_cell(index, &interior_cell(child, &key))
}

/// Leaf position for `key`: Ok(slot) on an exact match, Err(slot) with the
/// insertion point otherwise.
fn leaf_search(page: &Page, key: &Value) -> Result<std::result::Result<usize, usize>> {
    for slot in 0..page.cell_count() {
        let existing = cell_key(page, slot)?;
        match key.key_cmp(&existing) {
            std::cmp::Ordering::Equal => return Ok(Ok(slot)),
            std::cmp::Ordering::Less => return Ok(Err(slot)),
            std::cmp::Ordering::Greater => {}
        }
    }
    Ok(Err(page.cell_count()))
}

/// Interior branch index for `key`: the first separator above it, else the
/// right-child branch. A key equal to a separator routes right.
fn interior_branch(page: &Page, key: &Value) -> Result<usize> {
    for slot in 0..page.cell_count() {
        let separator = cell_key(page, slot)?;
        if key.key_cmp(&separator) == std::cmp::Ordering::Less {
            return Ok(slot);
        }
    }
    Ok(page.cell_count())
}

fn is_underfull(page: &Page) -> bool {
    page.used_cell_bytes() < page.usable_size() / MIN_FILL_DIVISOR
}

fn max_cell_size(usable: usize) -> usize {
    (usable - PAGE_HEADER_SIZE - SLOT_DIRECTORY_ENTRY_SIZE) / 2
}

struct SplitResult {
    separator: Value,
    right_page_id: PageId,
}

/// Free every page of the subtree rooted at `root` (post-order). Used
/// when a whole tree is dropped.
pub fn free_tree(io: &mut dyn PageIo, root: PageId) -> Result<usize> {
    let page = io.read_page(root)?;
    let mut freed = 1;
    if !page.is_leaf() {
        for branch in 0..=page.cell_count() {
            freed += free_tree(io, child_at(&page, branch)?)?;
        }
    }
    io.free_page(root)?;
    Ok(freed)
}

#[derive(Debug, Clone, Copy)]
pub struct PathEntry {
    pub page_id: PageId,
    /// Branch index on interior pages, slot index on the leaf.
    pub index: usize,
}

/// Stateful position within a tree: the root-to-leaf path of one record.
///
/// The epoch is the engine's structural epoch at creation; the statement
/// layer refuses to advance a cursor whose epoch is stale.
#[derive(Debug, Clone)]
pub struct Cursor {
    pub path: Vec<PathEntry>,
    pub exhausted: bool,
    pub epoch: u64,
}

impl Cursor {
    fn exhausted_cursor(epoch: u64) -> Self {
        Self {
            path: Vec::new(),
            exhausted: true,
            epoch,
        }
    }
}

pub struct BTree {
    pub def: TreeDef,
}

impl BTree {
    pub fn new(def: TreeDef) -> Self {
        Self { def }
    }

    /// Create an empty tree: a single leaf root.
    pub fn create(io: &mut dyn PageIo) -> Result<PageId> {
        let root = io.allocate_page(PageType::Leaf)?;
        let root_id = root.page_id;
        io.write_page(root)?;
        Ok(root_id)
    }

    pub fn lookup(&self, io: &mut dyn PageIo, key: &Value) -> Result<Option<Record>> {
        let mut page = io.read_page(self.def.root)?;
        loop {
            if page.is_leaf() {
                return match leaf_search(&page, key)? {
                    Ok(slot) => {
                        let cell = page.get_cell(slot).expect("slot bounds checked");
                        Ok(Some(parse_leaf_cell(cell)?.1))
                    }
                    Err(_) => Ok(None),
                };
            }
            let branch = interior_branch(&page, key)?;
            page = io.read_page(child_at(&page, branch)?)?;
        }
    }

    pub fn insert(&mut self, io: &mut dyn PageIo, key: Value, record: Record) -> Result<()> {
        let cell = leaf_cell(&key, &record);
        if cell.len() > max_cell_size(io.usable_size()) {
            return Err(DatabaseError::Misuse {
                reason: format!("record of {} bytes exceeds page capacity", cell.len()),
            });
        }
        if let Some(split) = self.insert_into(io, self.def.root, &key, &record)? {
            // Root split: the tree grows one level.
            let old_root = self.def.root;
            let mut new_root = io.allocate_page(PageType::Interior)?;
            new_root.insert_cell_at(0, &interior_cell(old_root, &split.separator))?;
            new_root.right_child = Some(split.right_page_id);
            self.def.root = new_root.page_id;
            io.write_page(new_root)?;
            io.mark_structural();
        }
        Ok(())
    }

    fn insert_into(
        &self,
        io: &mut dyn PageIo,
        page_id: PageId,
        key: &Value,
        record: &Record,
    ) -> Result<Option<SplitResult>> {
        let mut page = io.read_page(page_id)?;
        if page.is_leaf() {
            let slot = match leaf_search(&page, key)? {
                Ok(slot) => {
                    if self.def.on_duplicate == DuplicatePolicy::Reject {
                        return Err(DatabaseError::DuplicateKey {
                            tree: self.def.name.clone(),
                            key: key.render_text(),
                        });
                    }
                    page.remove_cell(slot)?;
                    slot
                }
                Err(slot) => slot,
            };
            let cell = leaf_cell(key, record);
            if page.can_fit(cell.len()) {
                page.insert_cell_at(slot, &cell)?;
                io.write_page(page)?;
                return Ok(None);
            }
            return Ok(Some(self.split_page(io, page, slot, &cell)?));
        }

        let branch = interior_branch(&page, key)?;
        let child = child_at(&page, branch)?;
        let Some(split) = self.insert_into(io, child, key, record)? else {
            return Ok(None);
        };

        // The child split: route keys below the separator to the old
        // child, the rest to the new right page.
        let new_cell = interior_cell(child, &split.separator);
        if branch < page.cell_count() {
            set_cell_child(&mut page, branch, split.right_page_id)?;
        } else {
            page.right_child = Some(split.right_page_id);
        }
        if page.can_fit(new_cell.len()) {
            page.insert_cell_at(branch, &new_cell)?;
            io.write_page(page)?;
            return Ok(None);
        }
        Ok(Some(self.split_page(io, page, branch, &new_cell)?))
    }

    /// Split `page` while inserting `new_cell` at slot `insert_at`. The
    /// left half stays on the original page; the right half moves to a
    /// fresh page. Splits at the byte-weighted median.
    fn split_page(
        &self,
        io: &mut dyn PageIo,
        mut page: Page,
        insert_at: usize,
        new_cell: &[u8],
    ) -> Result<SplitResult> {
        io.mark_structural();
        let mut cells: Vec<Vec<u8>> = (0..page.cell_count())
            .map(|i| page.get_cell(i).expect("slot bounds checked").to_vec())
            .collect();
        cells.insert(insert_at, new_cell.to_vec());

        let total: usize = cells.iter().map(Vec::len).sum();
        let mut split_point = 0;
        let mut left_bytes = 0;
        while split_point < cells.len() - 1 && left_bytes + cells[split_point].len() < total / 2 {
            left_bytes += cells[split_point].len();
            split_point += 1;
        }
        split_point = split_point.max(1);

        let mut right = io.allocate_page(page.page_type)?;
        let (separator, right_start) = if page.is_leaf() {
            // The separator is the right half's minimum key; it stays in
            // the right leaf.
            (leaf_cell_key(&cells[split_point])?, split_point)
        } else {
            // The median separator moves up; its child becomes the left
            // page's right child.
            let (median_child, median_key) = parse_interior_cell(&cells[split_point])?;
            right.right_child = page.right_child;
            page.right_child = Some(median_child);
            (median_key, split_point + 1)
        };

        page.clear();
        for (i, cell) in cells[..split_point].iter().enumerate() {
            page.insert_cell_at(i, cell)?;
        }
        for (i, cell) in cells[right_start..].iter().enumerate() {
            right.insert_cell_at(i, cell)?;
        }
        if page.is_leaf() {
            // leaves keep no right_child
        } else if right.right_child.is_none() {
            return Err(DatabaseError::CorruptedPage {
                page_id: right.page_id,
                reason: "interior split produced no right child".to_string(),
            });
        }

        let right_page_id = right.page_id;
        io.write_page(page)?;
        io.write_page(right)?;
        Ok(SplitResult {
            separator,
            right_page_id,
        })
    }

    /// Delete `key`. Returns whether it was present. Underfull nodes
    /// borrow from a sibling when possible, otherwise merge; a root left
    /// with no separators collapses, reducing depth by one.
    pub fn delete(&mut self, io: &mut dyn PageIo, key: &Value) -> Result<bool> {
        let found = self.delete_from(io, self.def.root, key)?;
        if !found {
            return Ok(false);
        }
        let root = io.read_page(self.def.root)?;
        if !root.is_leaf() && root.cell_count() == 0 {
            let new_root = root.right_child.ok_or(DatabaseError::CorruptedPage {
                page_id: root.page_id,
                reason: "empty root with no right child".to_string(),
            })?;
            io.free_page(root.page_id)?;
            self.def.root = new_root;
            io.mark_structural();
        }
        Ok(true)
    }

    fn delete_from(&self, io: &mut dyn PageIo, page_id: PageId, key: &Value) -> Result<bool> {
        let mut page = io.read_page(page_id)?;
        if page.is_leaf() {
            return match leaf_search(&page, key)? {
                Ok(slot) => {
                    page.remove_cell(slot)?;
                    io.write_page(page)?;
                    Ok(true)
                }
                Err(_) => Ok(false),
            };
        }

        let branch = interior_branch(&page, key)?;
        let child_id = child_at(&page, branch)?;
        if !self.delete_from(io, child_id, key)? {
            return Ok(false);
        }

        let child = io.read_page(child_id)?;
        if is_underfull(&child) {
            self.rebalance_child(io, &mut page, branch)?;
            io.write_page(page)?;
        }
        Ok(true)
    }

    /// Fix the underfull child at `branch` by borrowing from an adjacent
    /// sibling or merging with one.
    fn rebalance_child(&self, io: &mut dyn PageIo, parent: &mut Page, branch: usize) -> Result<()> {
        io.mark_structural();
        let child_id = child_at(parent, branch)?;
        let mut child = io.read_page(child_id)?;

        // Prefer borrowing from the left sibling, then the right one.
        if branch > 0 {
            let left_id = child_at(parent, branch - 1)?;
            let mut left = io.read_page(left_id)?;
            if self.can_lend(&left) {
                self.rotate_right(io, parent, branch, &mut left, &mut child)?;
                io.write_page(left)?;
                io.write_page(child)?;
                return Ok(());
            }
        }
        if branch < parent.cell_count() {
            let right_id = child_at(parent, branch + 1)?;
            let mut right = io.read_page(right_id)?;
            if self.can_lend(&right) {
                self.rotate_left(io, parent, branch, &mut child, &mut right)?;
                io.write_page(child)?;
                io.write_page(right)?;
                return Ok(());
            }
        }

        // Neither sibling can lend: merge with one, provided the combined
        // payload fits in a single page. Two siblings each holding a
        // near-maximal cell may have nothing to lend and no room to merge;
        // the underfull page is then left in place until later deletes
        // open one of those paths.
        if branch > 0 {
            let left = io.read_page(child_at(parent, branch - 1)?)?;
            if self.merge_fits(parent, branch - 1, &left, &child)? {
                return self.merge_children(io, parent, branch - 1);
            }
        }
        if branch < parent.cell_count() {
            let right = io.read_page(child_at(parent, branch + 1)?)?;
            if self.merge_fits(parent, branch, &child, &right)? {
                return self.merge_children(io, parent, branch);
            }
        }
        Ok(())
    }

    fn can_lend(&self, page: &Page) -> bool {
        // A lender must stay above the fill floor after giving one cell up.
        let largest = page
            .slots
            .iter()
            .map(|s| s.length as usize)
            .max()
            .unwrap_or(0);
        page.cell_count() > 1
            && page.used_cell_bytes().saturating_sub(largest) >= page.usable_size() / MIN_FILL_DIVISOR
    }

    /// Whether the right page's cells (plus the descending separator on
    /// interior pages) fit into the left page. `remove_cell` compacts, so
    /// `available_space` is exact.
    fn merge_fits(
        &self,
        parent: &Page,
        left_branch: usize,
        left: &Page,
        right: &Page,
    ) -> Result<bool> {
        let mut extra_cells = right.cell_count();
        let mut extra_bytes = right.used_cell_bytes();
        if !left.is_leaf() {
            // The descending separator cell has the same length as the
            // parent's cell: an 8-byte child id followed by the key.
            let sep_cell = parent.get_cell(left_branch).ok_or(DatabaseError::InvalidSlotIndex {
                index: left_branch,
                max: parent.cell_count(),
            })?;
            extra_cells += 1;
            extra_bytes += sep_cell.len();
        }
        Ok(left.available_space() >= extra_bytes + extra_cells * SLOT_DIRECTORY_ENTRY_SIZE)
    }

    /// Whether the underfull child at `branch` has a sibling that could
    /// lend a cell or absorb it in a merge. Mirrors the choices
    /// `rebalance_child` makes.
    fn rebalance_possible(
        &self,
        io: &mut dyn PageIo,
        parent: &Page,
        branch: usize,
    ) -> Result<bool> {
        let child = io.read_page(child_at(parent, branch)?)?;
        if branch > 0 {
            let left = io.read_page(child_at(parent, branch - 1)?)?;
            if self.can_lend(&left) || self.merge_fits(parent, branch - 1, &left, &child)? {
                return Ok(true);
            }
        }
        if branch < parent.cell_count() {
            let right = io.read_page(child_at(parent, branch + 1)?)?;
            if self.can_lend(&right) || self.merge_fits(parent, branch, &child, &right)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Move the left sibling's last entry into `child` (the right page of
    /// the pair), adjusting the separator at `branch - 1`.
    fn rotate_right(
        &self,
        _io: &mut dyn PageIo,
        parent: &mut Page,
        branch: usize,
        left: &mut Page,
        child: &mut Page,
    ) -> Result<()> {
        let sep_index = branch - 1;
        let last = left.cell_count() - 1;
        if child.is_leaf() {
            let moved = left.get_cell(last).expect("slot bounds checked").to_vec();
            let moved_key = leaf_cell_key(&moved)?;
            left.remove_cell(last)?;
            child.insert_cell_at(0, &moved)?;
            // New separator: the moved key, the child's new minimum.
            let left_id = child_at(parent, sep_index)?;
            parent.replace_cell(sep_index, &interior_cell(left_id, &moved_key))?;
        } else {
            // The separator comes down; the left page's last cell goes up.
            let sep_cell = parent.get_cell(sep_index).expect("slot bounds checked");
            let (left_id, sep_key) = parse_interior_cell(sep_cell)?;
            let (moved_child, moved_key) =
                parse_interior_cell(left.get_cell(last).expect("slot bounds checked"))?;
            let old_left_right = left.right_child.ok_or(DatabaseError::CorruptedPage {
                page_id: left.page_id,
                reason: "interior page missing right child".to_string(),
            })?;
            left.remove_cell(last)?;
            left.right_child = Some(moved_child);
            child.insert_cell_at(0, &interior_cell(old_left_right, &sep_key))?;
            parent.replace_cell(sep_index, &interior_cell(left_id, &moved_key))?;
        }
        Ok(())
    }

    /// Move the right sibling's first entry into `child` (the left page of
    /// the pair), adjusting the separator at `branch`.
    fn rotate_left(
        &self,
        _io: &mut dyn PageIo,
        parent: &mut Page,
        branch: usize,
        child: &mut Page,
        right: &mut Page,
    ) -> Result<()> {
        let child_id = child.page_id;
        if child.is_leaf() {
            let moved = right.get_cell(0).expect("slot bounds checked").to_vec();
            right.remove_cell(0)?;
            child.insert_cell_at(child.cell_count(), &moved)?;
            let new_sep = cell_key(right, 0)?;
            parent.replace_cell(branch, &interior_cell(child_id, &new_sep))?;
        } else {
            let sep_cell = parent.get_cell(branch).expect("slot bounds checked");
            let (_, sep_key) = parse_interior_cell(sep_cell)?;
            let (moved_child, moved_key) =
                parse_interior_cell(right.get_cell(0).expect("slot bounds checked"))?;
            let old_child_right = child.right_child.ok_or(DatabaseError::CorruptedPage {
                page_id: child.page_id,
                reason: "interior page missing right child".to_string(),
            })?;
            right.remove_cell(0)?;
            child.insert_cell_at(
                child.cell_count(),
                &interior_cell(old_child_right, &sep_key),
            )?;
            child.right_child = Some(moved_child);
            parent.replace_cell(branch, &interior_cell(child_id, &moved_key))?;
        }
        Ok(())
    }

    /// Merge children `left_branch` and `left_branch + 1` into the left
    /// page, removing their separator from the parent.
    fn merge_children(
        &self,
        io: &mut dyn PageIo,
        parent: &mut Page,
        left_branch: usize,
    ) -> Result<()> {
        let left_id = child_at(parent, left_branch)?;
        let right_id = child_at(parent, left_branch + 1)?;
        let mut left = io.read_page(left_id)?;
        let right = io.read_page(right_id)?;

        if !left.is_leaf() {
            // The separator descends between the two halves.
            let sep_cell = parent.get_cell(left_branch).expect("slot bounds checked");
            let (_, sep_key) = parse_interior_cell(sep_cell)?;
            let old_right_child = left.right_child.ok_or(DatabaseError::CorruptedPage {
                page_id: left.page_id,
                reason: "interior page missing right child".to_string(),
            })?;
            left.insert_cell_at(left.cell_count(), &interior_cell(old_right_child, &sep_key))?;
            left.right_child = right.right_child;
        }
        for i in 0..right.cell_count() {
            let cell = right.get_cell(i).expect("slot bounds checked").to_vec();
            left.insert_cell_at(left.cell_count(), &cell)?;
        }

        parent.remove_cell(left_branch)?;
        // The slot that referenced the right page now routes to the merged
        // left page.
        if left_branch < parent.cell_count() {
            set_cell_child(parent, left_branch, left_id)?;
        } else {
            parent.right_child = Some(left_id);
        }

        io.free_page(right_id)?;
        io.write_page(left)?;
        Ok(())
    }

    /// Cursor positioned at the first entry >= `key`.
    pub fn seek(&self, io: &mut dyn PageIo, key: &Value, epoch: u64) -> Result<Cursor> {
        let mut path = Vec::new();
        let mut page = io.read_page(self.def.root)?;
        loop {
            if page.is_leaf() {
                let slot = match leaf_search(&page, key)? {
                    Ok(slot) | Err(slot) => slot,
                };
                path.push(PathEntry {
                    page_id: page.page_id,
                    index: slot,
                });
                let mut cursor = Cursor {
                    path,
                    exhausted: false,
                    epoch,
                };
                if slot >= page.cell_count() {
                    // Past the end of this leaf: the successor lives in
                    // the next one.
                    self.step_forward(io, &mut cursor)?;
                }
                return Ok(cursor);
            }
            let branch = interior_branch(&page, key)?;
            path.push(PathEntry {
                page_id: page.page_id,
                index: branch,
            });
            page = io.read_page(child_at(&page, branch)?)?;
        }
    }

    pub fn first(&self, io: &mut dyn PageIo, epoch: u64) -> Result<Cursor> {
        let mut path = Vec::new();
        self.descend_edge(io, self.def.root, &mut path, false)?;
        let leaf = io.read_page(path.last().expect("path has leaf").page_id)?;
        if leaf.cell_count() == 0 {
            return Ok(Cursor::exhausted_cursor(epoch));
        }
        Ok(Cursor {
            path,
            exhausted: false,
            epoch,
        })
    }

    pub fn last(&self, io: &mut dyn PageIo, epoch: u64) -> Result<Cursor> {
        let mut path = Vec::new();
        self.descend_edge(io, self.def.root, &mut path, true)?;
        let leaf_entry = path.last_mut().expect("path has leaf");
        let leaf = io.read_page(leaf_entry.page_id)?;
        if leaf.cell_count() == 0 {
            return Ok(Cursor::exhausted_cursor(epoch));
        }
        leaf_entry.index = leaf.cell_count() - 1;
        Ok(Cursor {
            path,
            exhausted: false,
            epoch,
        })
    }

    // Extend `path` from `page_id` down to the leftmost (or rightmost)
    // leaf. Leaf index is left at 0.
    fn descend_edge(
        &self,
        io: &mut dyn PageIo,
        page_id: PageId,
        path: &mut Vec<PathEntry>,
        rightmost: bool,
    ) -> Result<()> {
        let mut page = io.read_page(page_id)?;
        loop {
            if page.is_leaf() {
                path.push(PathEntry {
                    page_id: page.page_id,
                    index: 0,
                });
                return Ok(());
            }
            let branch = if rightmost { page.cell_count() } else { 0 };
            path.push(PathEntry {
                page_id: page.page_id,
                index: branch,
            });
            page = io.read_page(child_at(&page, branch)?)?;
        }
    }

    /// Entry under the cursor, if any.
    pub fn cursor_current(
        &self,
        io: &mut dyn PageIo,
        cursor: &Cursor,
    ) -> Result<Option<(Value, Record)>> {
        if cursor.exhausted {
            return Ok(None);
        }
        let leaf_entry = cursor.path.last().ok_or(DatabaseError::Misuse {
            reason: "cursor has no position".to_string(),
        })?;
        let leaf = io.read_page(leaf_entry.page_id)?;
        match leaf.get_cell(leaf_entry.index) {
            Some(cell) => parse_leaf_cell(cell).map(Some),
            None => Ok(None),
        }
    }

    /// Advance to the next entry in key order. Returns false once
    /// exhausted; further calls keep returning false.
    pub fn cursor_next(&self, io: &mut dyn PageIo, cursor: &mut Cursor) -> Result<bool> {
        if cursor.exhausted {
            return Ok(false);
        }
        let leaf_entry = cursor.path.last_mut().ok_or(DatabaseError::Misuse {
            reason: "cursor has no position".to_string(),
        })?;
        leaf_entry.index += 1;
        let leaf = io.read_page(leaf_entry.page_id)?;
        if leaf_entry.index < leaf.cell_count() {
            return Ok(true);
        }
        self.step_forward(io, cursor)?;
        Ok(!cursor.exhausted)
    }

    /// Step back to the previous entry in key order.
    pub fn cursor_previous(&self, io: &mut dyn PageIo, cursor: &mut Cursor) -> Result<bool> {
        if cursor.exhausted {
            return Ok(false);
        }
        let leaf_entry = cursor.path.last_mut().ok_or(DatabaseError::Misuse {
            reason: "cursor has no position".to_string(),
        })?;
        if leaf_entry.index > 0 {
            leaf_entry.index -= 1;
            return Ok(true);
        }
        // Climb to the nearest ancestor with a branch to our left, then
        // descend its right edge.
        cursor.path.pop();
        while let Some(entry) = cursor.path.last_mut() {
            if entry.index > 0 {
                entry.index -= 1;
                let page = io.read_page(entry.page_id)?;
                let child = child_at(&page, entry.index)?;
                self.descend_edge(io, child, &mut cursor.path, true)?;
                let leaf_entry = cursor.path.last_mut().expect("path has leaf");
                let leaf = io.read_page(leaf_entry.page_id)?;
                if leaf.cell_count() == 0 {
                    cursor.exhausted = true;
                    cursor.path.clear();
                    return Ok(false);
                }
                leaf_entry.index = leaf.cell_count() - 1;
                return Ok(true);
            }
            cursor.path.pop();
        }
        cursor.exhausted = true;
        Ok(false)
    }

    // The cursor's leaf index ran off the end: climb to the nearest
    // ancestor with a branch to our right, then descend its left edge.
    fn step_forward(&self, io: &mut dyn PageIo, cursor: &mut Cursor) -> Result<()> {
        cursor.path.pop();
        while let Some(entry) = cursor.path.last_mut() {
            let page = io.read_page(entry.page_id)?;
            if entry.index < page.cell_count() {
                entry.index += 1;
                let child = child_at(&page, entry.index)?;
                self.descend_edge(io, child, &mut cursor.path, false)?;
                let leaf = io.read_page(cursor.path.last().expect("path has leaf").page_id)?;
                if leaf.cell_count() == 0 {
                    break;
                }
                return Ok(());
            }
            cursor.path.pop();
        }
        cursor.exhausted = true;
        cursor.path.clear();
        Ok(())
    }

    /// Structural self-check used by tests: keys strictly ordered in every
    /// node, every leaf at the same depth, no node left below the fill
    /// floor while a sibling borrow or merge could repair it. Returns the
    /// tree depth.
    pub fn check_invariants(&self, io: &mut dyn PageIo) -> Result<usize> {
        self.check_node(io, self.def.root, None, None)
    }

    fn check_node(
        &self,
        io: &mut dyn PageIo,
        page_id: PageId,
        lower: Option<&Value>,
        upper: Option<&Value>,
    ) -> Result<usize> {
        let page = io.read_page(page_id)?;
        let corrupted = |reason: String| DatabaseError::CorruptedPage { page_id, reason };

        let mut previous: Option<Value> = None;
        for slot in 0..page.cell_count() {
            let key = cell_key(&page, slot)?;
            if let Some(prev) = &previous {
                if prev.key_cmp(&key) != std::cmp::Ordering::Less {
                    return Err(corrupted(format!("keys out of order at slot {}", slot)));
                }
            }
            if let Some(low) = lower {
                if key.key_cmp(low) == std::cmp::Ordering::Less {
                    return Err(corrupted("key below subtree lower bound".to_string()));
                }
            }
            if let Some(high) = upper {
                if key.key_cmp(high) != std::cmp::Ordering::Less {
                    return Err(corrupted("key at or above subtree upper bound".to_string()));
                }
            }
            previous = Some(key);
        }

        if page.is_leaf() {
            return Ok(1);
        }
        let mut depth = None;
        for branch in 0..=page.cell_count() {
            let child = child_at(&page, branch)?;
            let branch_lower: Option<Value> = if branch == 0 {
                lower.cloned()
            } else {
                Some(cell_key(&page, branch - 1)?)
            };
            let branch_upper: Option<Value> = if branch == page.cell_count() {
                upper.cloned()
            } else {
                Some(cell_key(&page, branch)?)
            };
            let child_page = io.read_page(child)?;
            if is_underfull(&child_page)
                && child_page.cell_count() > 0
                && self.rebalance_possible(io, &page, branch)?
            {
                return Err(DatabaseError::CorruptedPage {
                    page_id: child,
                    reason: format!(
                        "node below fill floor with a viable rebalance: {} of {} bytes",
                        child_page.used_cell_bytes(),
                        child_page.usable_size()
                    ),
                });
            }
            let child_depth =
                self.check_node(io, child, branch_lower.as_ref(), branch_upper.as_ref())?;
            match depth {
                None => depth = Some(child_depth),
                Some(expected) if expected != child_depth => {
                    return Err(corrupted("leaves at unequal depth".to_string()));
                }
                _ => {}
            }
        }
        Ok(depth.unwrap_or(1) + 1)
    }
}
