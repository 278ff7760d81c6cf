use std::collections::HashMap;

use tracing::trace;

use crate::types::{PageId, TxnId};

pub const DEFAULT_CACHE_CAPACITY: usize = 256;

struct CachedPage {
    data: Vec<u8>,
    /// Commit version of this image. Readers at older snapshots bypass the
    /// entry and resolve through the WAL instead.
    version: TxnId,
    pins: u32,
    last_used: u64,
}

/// Bounded in-memory map of committed page images.
///
/// Only committed images live here; a write transaction keeps its
/// copy-on-write pages in its own write set, so eviction can never lose an
/// uncommitted write. Eviction is recency-based and skips pinned entries;
/// when every entry is pinned the insert is simply dropped, since a
/// committed image can always be re-read from WAL or store.
pub struct PageCache {
    capacity: usize,
    tick: u64,
    entries: HashMap<PageId, CachedPage>,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fetch the cached image if it is visible at `snapshot`.
    pub fn fetch(&mut self, page_id: PageId, snapshot: TxnId) -> Option<&[u8]> {
        self.tick += 1;
        let tick = self.tick;
        match self.entries.get_mut(&page_id) {
            Some(entry) if entry.version <= snapshot => {
                entry.last_used = tick;
                Some(&entry.data)
            }
            _ => None,
        }
    }

    /// Insert or replace the committed image for `page_id`.
    pub fn insert(&mut self, page_id: PageId, data: Vec<u8>, version: TxnId) {
        self.tick += 1;
        if let Some(entry) = self.entries.get_mut(&page_id) {
            entry.data = data;
            entry.version = version;
            entry.last_used = self.tick;
            return;
        }
        if self.entries.len() >= self.capacity && !self.evict_one() {
            trace!(page_id, "cache full of pinned pages, dropping insert");
            return;
        }
        self.entries.insert(
            page_id,
            CachedPage {
                data,
                version,
                pins: 0,
                last_used: self.tick,
            },
        );
    }

    pub fn pin(&mut self, page_id: PageId) {
        if let Some(entry) = self.entries.get_mut(&page_id) {
            entry.pins += 1;
        }
    }

    pub fn unpin(&mut self, page_id: PageId) {
        if let Some(entry) = self.entries.get_mut(&page_id) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    pub fn invalidate(&mut self, page_id: PageId) {
        self.entries.remove(&page_id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    // Evict the least recently used unpinned entry.
    fn evict_one(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.pins == 0)
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(page_id, _)| *page_id);
        match victim {
            Some(page_id) => {
                trace!(page_id, "evicting page from cache");
                self.entries.remove(&page_id);
                true
            }
            None => false,
        }
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
