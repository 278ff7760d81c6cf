use serde::{Deserialize, Serialize};

use crate::types::error::{DatabaseError, Result};
use crate::types::{PAGE_HEADER_SIZE, PageId, SLOT_DIRECTORY_ENTRY_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageType {
    Interior = 2,
    Leaf = 10,
}

impl PageType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            2 => Ok(PageType::Interior),
            10 => Ok(PageType::Leaf),
            _ => Err(DatabaseError::InvalidPageType(value)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlotEntry {
    pub offset: u16, // Offset from beginning of page
    pub length: u16, // Length of the cell
}

/*
 * Page Layout on Disk (Slotted Page Structure)
 * ┌─────────────────────────────────────────────────────────────────┐
 * │                    PAGE HEADER (32 bytes)                       │
 * │  page_id(8) | page_type(1) | pad(1) | cell_count(2) |           │
 * │  free_space_offset(2) | right_child(8) | reserved(10)           │
 * ├─────────────────────────────────────────────────────────────────┤
 * │                  SLOT DIRECTORY                                 │
 * │  [slot0: offset(2)|len(2)] [slot1: offset(2)|len(2)] ...        │
 * ├─────────────────────────────────────────────────────────────────┤
 * │                    FREE SPACE                                   │
 * ├─────────────────────────────────────────────────────────────────┤
 * │                   CELL DATA                                     │
 * │  [...cell N...] [...cell 2...] [...cell 1...] [...cell 0...]    │
 * └─────────────────────────────────────────────────────────────────┘
 *
 * Slots are kept in key order; the B-tree inserts cells at their sorted
 * position. The buffer covers the usable page area only: an encrypted
 * database reserves the page tail for the cipher IV and tag, so the
 * usable size is smaller than the raw page size.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub page_id: PageId,
    pub page_type: PageType,
    /// Interior pages: child holding keys >= every separator in this page.
    pub right_child: Option<PageId>,
    pub slots: Vec<SlotEntry>,
    pub free_space_offset: u16,
    pub data: Vec<u8>,
}

impl Page {
    pub fn new(page_id: PageId, page_type: PageType, usable_size: usize) -> Self {
        Self {
            page_id,
            page_type,
            right_child: None,
            slots: Vec::new(),
            free_space_offset: usable_size as u16,
            data: vec![0; usable_size],
        }
    }

    pub fn usable_size(&self) -> usize {
        self.data.len()
    }

    pub fn cell_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_leaf(&self) -> bool {
        self.page_type == PageType::Leaf
    }

    /// Serialize the page into its usable-size buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let usable = self.usable_size();
        let mut buffer = vec![0u8; usable];

        buffer[0..8].copy_from_slice(&self.page_id.to_le_bytes());
        buffer[8] = self.page_type.as_u8();
        buffer[10..12].copy_from_slice(&(self.slots.len() as u16).to_le_bytes());
        buffer[12..14].copy_from_slice(&self.free_space_offset.to_le_bytes());
        let right_child = self.right_child.unwrap_or(u64::MAX);
        buffer[14..22].copy_from_slice(&right_child.to_le_bytes());

        let mut offset = PAGE_HEADER_SIZE;
        for slot in &self.slots {
            buffer[offset..offset + 2].copy_from_slice(&slot.offset.to_le_bytes());
            buffer[offset + 2..offset + 4].copy_from_slice(&slot.length.to_le_bytes());
            offset += SLOT_DIRECTORY_ENTRY_SIZE;
        }

        let cells_start = self.free_space_offset as usize;
        buffer[cells_start..].copy_from_slice(&self.data[cells_start..]);
        buffer
    }

    /// Deserialize a page, cross-checking the stored page id against the
    /// position it was read from.
    pub fn from_bytes(expected_page_id: PageId, bytes: &[u8]) -> Result<Self> {
        let usable = bytes.len();
        if usable < PAGE_HEADER_SIZE {
            return Err(DatabaseError::InvalidPageSize {
                expected: PAGE_HEADER_SIZE,
                actual: usable,
            });
        }

        let page_id = u64::from_le_bytes(bytes[0..8].try_into().expect("8-byte slice"));
        if page_id != expected_page_id {
            return Err(DatabaseError::CorruptedPage {
                page_id: expected_page_id,
                reason: format!("stored page id {} does not match position", page_id),
            });
        }

        let page_type = PageType::from_u8(bytes[8])?;
        let cell_count = u16::from_le_bytes([bytes[10], bytes[11]]) as usize;
        let free_space_offset = u16::from_le_bytes([bytes[12], bytes[13]]);
        let right_child_raw = u64::from_le_bytes(bytes[14..22].try_into().expect("8-byte slice"));
        let right_child = if right_child_raw == u64::MAX {
            None
        } else {
            Some(right_child_raw)
        };

        if free_space_offset as usize > usable {
            return Err(DatabaseError::CorruptedPage {
                page_id,
                reason: format!("invalid free_space_offset: {}", free_space_offset),
            });
        }

        let mut offset = PAGE_HEADER_SIZE;
        let mut slots = Vec::with_capacity(cell_count);
        for _ in 0..cell_count {
            if offset + SLOT_DIRECTORY_ENTRY_SIZE > usable {
                return Err(DatabaseError::CorruptedPage {
                    page_id,
                    reason: "slot directory extends beyond page boundary".to_string(),
                });
            }
            let slot_offset = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
            let length = u16::from_le_bytes([bytes[offset + 2], bytes[offset + 3]]);
            offset += SLOT_DIRECTORY_ENTRY_SIZE;

            if slot_offset as usize + length as usize > usable
                || (slot_offset as usize) < PAGE_HEADER_SIZE
            {
                return Err(DatabaseError::CorruptedPage {
                    page_id,
                    reason: format!(
                        "slot at offset {} with length {} exceeds page boundary",
                        slot_offset, length
                    ),
                });
            }
            slots.push(SlotEntry {
                offset: slot_offset,
                length,
            });
        }

        Ok(Page {
            page_id,
            page_type,
            right_child,
            slots,
            free_space_offset,
            data: bytes.to_vec(),
        })
    }

    pub fn available_space(&self) -> usize {
        let directory_end = PAGE_HEADER_SIZE + self.slots.len() * SLOT_DIRECTORY_ENTRY_SIZE;
        (self.free_space_offset as usize).saturating_sub(directory_end)
    }

    pub fn can_fit(&self, data_size: usize) -> bool {
        self.available_space() >= data_size + SLOT_DIRECTORY_ENTRY_SIZE
    }

    /// Bytes consumed by cell payloads, used by the B-tree fill policy.
    pub fn used_cell_bytes(&self) -> usize {
        self.slots.iter().map(|s| s.length as usize).sum()
    }

    /// Insert a cell at `index` within the slot order.
    pub fn insert_cell_at(&mut self, index: usize, data: &[u8]) -> Result<()> {
        if index > self.slots.len() {
            return Err(DatabaseError::InvalidSlotIndex {
                index,
                max: self.slots.len(),
            });
        }
        if !self.can_fit(data.len()) {
            return Err(DatabaseError::PageFull {
                page_id: self.page_id,
            });
        }

        // Cells grow downward from the end of the usable area
        let new_offset = self.free_space_offset - data.len() as u16;
        let start = new_offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);

        self.slots.insert(
            index,
            SlotEntry {
                offset: new_offset,
                length: data.len() as u16,
            },
        );
        self.free_space_offset = new_offset;
        Ok(())
    }

    pub fn get_cell(&self, slot_index: usize) -> Option<&[u8]> {
        self.slots.get(slot_index).map(|slot| {
            let start = slot.offset as usize;
            &self.data[start..start + slot.length as usize]
        })
    }

    pub fn remove_cell(&mut self, slot_index: usize) -> Result<()> {
        if slot_index >= self.slots.len() {
            return Err(DatabaseError::InvalidSlotIndex {
                index: slot_index,
                max: self.slots.len(),
            });
        }
        self.slots.remove(slot_index);
        self.compact();
        Ok(())
    }

    /// Replace the cell at `slot_index`, keeping its slot position.
    pub fn replace_cell(&mut self, slot_index: usize, data: &[u8]) -> Result<()> {
        self.remove_cell(slot_index)?;
        if !self.can_fit(data.len()) {
            return Err(DatabaseError::PageFull {
                page_id: self.page_id,
            });
        }
        self.insert_cell_at(slot_index, data)
    }

    /// Remove every cell, leaving the page empty.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free_space_offset = self.usable_size() as u16;
    }

    // Defragment by rewriting all cells contiguously at the tail
    fn compact(&mut self) {
        let usable = self.usable_size();
        if self.slots.is_empty() {
            self.free_space_offset = usable as u16;
            return;
        }

        let mut compacted: Vec<u8> = Vec::with_capacity(usable);
        let mut new_slots = Vec::with_capacity(self.slots.len());
        let mut current_offset = usable as u16;
        for slot in &self.slots {
            let start = slot.offset as usize;
            let cell = &self.data[start..start + slot.length as usize];
            current_offset -= slot.length;
            compacted.splice(0..0, cell.iter().copied());
            new_slots.push(SlotEntry {
                offset: current_offset,
                length: slot.length,
            });
        }

        let data_start = current_offset as usize;
        self.data[data_start..usable].copy_from_slice(&compacted);
        self.data[PAGE_HEADER_SIZE..data_start].fill(0);
        self.slots = new_slots;
        self.free_space_offset = current_offset;
    }
}
