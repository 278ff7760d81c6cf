use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::storage::header::JournalMode;
use crate::storage::pager::PageStore;
use crate::types::error::{DatabaseError, Result};
use crate::types::{PAGE_SIZE, PageId, TxnId};

pub const WAL_MAGIC: &[u8; 8] = b"LMBGWAL\0";
pub const WAL_FORMAT_VERSION: u32 = 1;
pub const WAL_HEADER_SIZE: usize = 32;
pub const WAL_FRAME_HEADER_SIZE: usize = 32;

const FLAG_COMMIT: u32 = 1;

/*
 * WAL file layout:
 *
 * [Header: 32 bytes]
 *   magic(8) | version(4) | page_size(4) | generation(8) | checksum(4) | pad(4)
 * [Frame 0: 32-byte header + PAGE_SIZE image]
 * [Frame 1: ...]
 * [Commit marker: 32-byte header only, FLAG_COMMIT set]
 * ...
 *
 * Frame header:
 *   page_id(8) | txn_id(8) | flags(4) | db_page_count(8) | checksum(4)
 *
 * Frame checksums chain from the header checksum, so a torn tail or a
 * frame from an older generation breaks the chain and ends the valid
 * prefix. Only frames at or before the last valid commit marker are ever
 * visible to readers or replayed by checkpoint/recovery.
 */

#[derive(Debug, Clone, Copy)]
struct FrameMeta {
    page_id: PageId,
    txn_id: TxnId,
    /// Byte offset of the page image within the log (0 for markers).
    image_offset: u64,
    checksum: u32,
    committed: bool,
    is_commit_marker: bool,
    db_page_count: u64,
}

enum WalBacking {
    File { file: File, path: PathBuf },
    Memory(Vec<u8>),
}

impl WalBacking {
    fn len(&self) -> Result<u64> {
        match self {
            WalBacking::File { file, .. } => Ok(file.metadata()?.len()),
            WalBacking::Memory(buf) => Ok(buf.len() as u64),
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            WalBacking::File { file, .. } => {
                file.seek(SeekFrom::Start(offset))?;
                let mut read = 0;
                while read < buf.len() {
                    let n = file.read(&mut buf[read..])?;
                    if n == 0 {
                        break;
                    }
                    read += n;
                }
                Ok(read)
            }
            WalBacking::Memory(data) => {
                let start = (offset as usize).min(data.len());
                let end = (start + buf.len()).min(data.len());
                buf[..end - start].copy_from_slice(&data[start..end]);
                Ok(end - start)
            }
        }
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            WalBacking::File { file, .. } => {
                file.seek(SeekFrom::End(0))?;
                file.write_all(bytes)?;
                Ok(())
            }
            WalBacking::Memory(data) => {
                data.extend_from_slice(bytes);
                Ok(())
            }
        }
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        match self {
            WalBacking::File { file, .. } => {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(bytes)?;
                Ok(())
            }
            WalBacking::Memory(data) => {
                let end = offset as usize + bytes.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[offset as usize..end].copy_from_slice(bytes);
                Ok(())
            }
        }
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        match self {
            WalBacking::File { file, .. } => {
                file.set_len(len)?;
                Ok(())
            }
            WalBacking::Memory(data) => {
                data.truncate(len as usize);
                Ok(())
            }
        }
    }

    fn sync(&mut self) -> Result<()> {
        match self {
            WalBacking::File { file, .. } => {
                file.sync_all()?;
                Ok(())
            }
            WalBacking::Memory(_) => Ok(()),
        }
    }
}

/// The write-ahead log: the engine's sole durability and atomicity
/// mechanism. Frames are appended per transaction and become visible only
/// once the commit marker lands; a crash between frame writes and the
/// marker leaves the main file and every existing reader unaffected.
pub struct Wal {
    backing: WalBacking,
    mode: JournalMode,
    generation: u64,
    header_checksum: u32,
    running_checksum: u32,
    frames: Vec<FrameMeta>,
    index: HashMap<PageId, Vec<usize>>,
    /// Frames covered by the last commit marker.
    committed_boundary: usize,
    last_committed_txn: TxnId,
    known_len: u64,
}

impl Wal {
    /// Open (or create) the log file next to the database and absorb any
    /// valid frames already present.
    pub fn open_file<P: AsRef<Path>>(path: P, mode: JournalMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let mut wal = Self {
            backing: WalBacking::File { file, path },
            mode,
            generation: 0,
            header_checksum: 0,
            running_checksum: 0,
            frames: Vec::new(),
            index: HashMap::new(),
            committed_boundary: 0,
            last_committed_txn: 0,
            known_len: 0,
        };
        wal.rescan()?;
        Ok(wal)
    }

    /// A purely in-memory log (journal_mode = memory): same commit
    /// protocol, no durability.
    pub fn new_memory() -> Result<Self> {
        let mut wal = Self {
            backing: WalBacking::Memory(Vec::new()),
            mode: JournalMode::Memory,
            generation: 0,
            header_checksum: 0,
            running_checksum: 0,
            frames: Vec::new(),
            index: HashMap::new(),
            committed_boundary: 0,
            last_committed_txn: 0,
            known_len: 0,
        };
        wal.write_fresh_header()?;
        Ok(wal)
    }

    pub fn set_mode(&mut self, mode: JournalMode) {
        self.mode = mode;
    }

    pub fn last_committed_txn(&self) -> TxnId {
        self.last_committed_txn
    }

    pub fn committed_frame_count(&self) -> usize {
        self.committed_boundary
    }

    fn header_bytes(generation: u64) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(WAL_HEADER_SIZE);
        buffer.extend_from_slice(WAL_MAGIC);
        buffer.extend_from_slice(&WAL_FORMAT_VERSION.to_le_bytes());
        buffer.extend_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
        buffer.extend_from_slice(&generation.to_le_bytes());
        let checksum = crc32fast::hash(&buffer);
        buffer.extend_from_slice(&checksum.to_le_bytes());
        buffer.resize(WAL_HEADER_SIZE, 0);
        buffer
    }

    fn write_fresh_header(&mut self) -> Result<()> {
        self.generation += 1;
        let header = Self::header_bytes(self.generation);
        self.header_checksum = crc32fast::hash(&header[..24]);
        self.backing.truncate(0)?;
        self.backing.append(&header)?;
        self.running_checksum = self.header_checksum;
        self.frames.clear();
        self.index.clear();
        self.committed_boundary = 0;
        self.last_committed_txn = 0;
        self.known_len = WAL_HEADER_SIZE as u64;
        Ok(())
    }

    fn frame_checksum(
        prev: u32,
        page_id: PageId,
        txn_id: TxnId,
        flags: u32,
        db_page_count: u64,
        image: &[u8],
    ) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&prev.to_le_bytes());
        hasher.update(&page_id.to_le_bytes());
        hasher.update(&txn_id.to_le_bytes());
        hasher.update(&flags.to_le_bytes());
        hasher.update(&db_page_count.to_le_bytes());
        hasher.update(image);
        hasher.finalize()
    }

    /// Rebuild the in-memory frame index from the backing file. Frames
    /// after the last valid commit marker stay invisible.
    fn rescan(&mut self) -> Result<()> {
        let len = self.backing.len()?;
        if len < WAL_HEADER_SIZE as u64 {
            // Empty or freshly created log
            return self.write_fresh_header();
        }

        let mut header = [0u8; WAL_HEADER_SIZE];
        if self.backing.read_at(0, &mut header)? < WAL_HEADER_SIZE {
            return self.write_fresh_header();
        }
        if &header[0..8] != WAL_MAGIC {
            // A persisted-but-invalidated log (journal_mode=persist) or
            // foreign junk: start a fresh generation.
            return self.write_fresh_header();
        }
        let version = u32::from_le_bytes(header[8..12].try_into().expect("4-byte slice"));
        let page_size = u32::from_le_bytes(header[12..16].try_into().expect("4-byte slice"));
        if version != WAL_FORMAT_VERSION || page_size != PAGE_SIZE as u32 {
            return Err(DatabaseError::CorruptedDatabase {
                reason: format!(
                    "WAL header mismatch: version {}, page size {}",
                    version, page_size
                ),
            });
        }
        let generation = u64::from_le_bytes(header[16..24].try_into().expect("8-byte slice"));
        let stored_checksum = u32::from_le_bytes(header[24..28].try_into().expect("4-byte slice"));
        let expected_checksum = crc32fast::hash(&header[..24]);
        if stored_checksum != expected_checksum {
            warn!("WAL header checksum mismatch, resetting log");
            return self.write_fresh_header();
        }

        self.generation = generation;
        self.header_checksum = expected_checksum;
        self.frames.clear();
        self.index.clear();

        let mut offset = WAL_HEADER_SIZE as u64;
        let mut checksum = expected_checksum;
        let mut frames: Vec<FrameMeta> = Vec::new();
        let mut committed_boundary = 0;
        let mut last_committed_txn = 0;
        let mut frame_header = [0u8; WAL_FRAME_HEADER_SIZE];
        let mut image = vec![0u8; PAGE_SIZE];

        loop {
            if self.backing.read_at(offset, &mut frame_header)? < WAL_FRAME_HEADER_SIZE {
                break;
            }
            let page_id = u64::from_le_bytes(frame_header[0..8].try_into().expect("8-byte slice"));
            let txn_id = u64::from_le_bytes(frame_header[8..16].try_into().expect("8-byte slice"));
            let flags = u32::from_le_bytes(frame_header[16..20].try_into().expect("4-byte slice"));
            let db_page_count =
                u64::from_le_bytes(frame_header[20..28].try_into().expect("8-byte slice"));
            let stored =
                u32::from_le_bytes(frame_header[28..32].try_into().expect("4-byte slice"));

            let is_commit_marker = flags & FLAG_COMMIT != 0;
            let image_offset = offset + WAL_FRAME_HEADER_SIZE as u64;
            let image_slice: &[u8] = if is_commit_marker {
                &[]
            } else {
                if self.backing.read_at(image_offset, &mut image)? < PAGE_SIZE {
                    break; // Torn tail frame; keep the prior valid prefix.
                }
                &image
            };

            let expected =
                Self::frame_checksum(checksum, page_id, txn_id, flags, db_page_count, image_slice);
            if expected != stored {
                break; // End of the valid chain.
            }
            checksum = expected;

            frames.push(FrameMeta {
                page_id,
                txn_id,
                image_offset,
                checksum,
                committed: false,
                is_commit_marker,
                db_page_count,
            });
            offset = image_offset + image_slice.len() as u64;

            if is_commit_marker {
                committed_boundary = frames.len();
                last_committed_txn = last_committed_txn.max(txn_id);
            }
        }

        // Everything after the last commit marker is an incomplete
        // transaction: discard it.
        frames.truncate(committed_boundary);
        for frame in &mut frames {
            frame.committed = true;
        }
        let valid_len = frames
            .last()
            .map(|f| f.image_offset + if f.is_commit_marker { 0 } else { PAGE_SIZE as u64 })
            .unwrap_or(WAL_HEADER_SIZE as u64);
        if valid_len < self.backing.len()? {
            debug!(valid_len, "discarding WAL frames past last commit marker");
            self.backing.truncate(valid_len)?;
        }

        self.running_checksum = frames.last().map(|f| f.checksum).unwrap_or(expected_checksum);
        for (i, frame) in frames.iter().enumerate() {
            if !frame.is_commit_marker {
                self.index.entry(frame.page_id).or_default().push(i);
            }
        }
        self.committed_boundary = frames.len();
        self.last_committed_txn = last_committed_txn;
        self.frames = frames;
        self.known_len = valid_len;
        Ok(())
    }

    /// Absorb frames appended by another connection since we last looked.
    /// A checkpoint elsewhere starts a fresh generation, possibly at the
    /// same byte length, so the header is checked as well.
    pub fn refresh(&mut self) -> Result<()> {
        if self.backing.len()? != self.known_len {
            return self.rescan();
        }
        let mut header = [0u8; WAL_HEADER_SIZE];
        let read = self.backing.read_at(0, &mut header)?;
        if read < WAL_HEADER_SIZE
            || &header[0..8] != WAL_MAGIC
            || header[16..24] != self.generation.to_le_bytes()
            || header[24..28] != self.header_checksum.to_le_bytes()
        {
            return self.rescan();
        }
        Ok(())
    }

    /// Append one page frame for `txn_id`. Not visible until [`Wal::commit`].
    pub fn append_frame(&mut self, txn_id: TxnId, page_id: PageId, image: &[u8]) -> Result<()> {
        if image.len() != PAGE_SIZE {
            return Err(DatabaseError::InvalidPageSize {
                expected: PAGE_SIZE,
                actual: image.len(),
            });
        }
        self.append_raw(txn_id, page_id, 0, 0, image)
    }

    /// Write the commit marker and durably sync. This is the sole
    /// visibility-granting event for the transaction.
    pub fn commit(&mut self, txn_id: TxnId, db_page_count: u64) -> Result<()> {
        self.append_raw(txn_id, 0, FLAG_COMMIT, db_page_count, &[])?;
        self.backing.sync()?;

        for i in self.committed_boundary..self.frames.len() {
            let frame = &mut self.frames[i];
            frame.committed = true;
            if !frame.is_commit_marker {
                self.index.entry(frame.page_id).or_default().push(i);
            }
        }
        self.committed_boundary = self.frames.len();
        self.last_committed_txn = self.last_committed_txn.max(txn_id);
        debug!(txn_id, frames = self.frames.len(), "WAL commit marker written");
        Ok(())
    }

    fn append_raw(
        &mut self,
        txn_id: TxnId,
        page_id: PageId,
        flags: u32,
        db_page_count: u64,
        image: &[u8],
    ) -> Result<()> {
        let checksum = Self::frame_checksum(
            self.running_checksum,
            page_id,
            txn_id,
            flags,
            db_page_count,
            image,
        );
        let mut frame = Vec::with_capacity(WAL_FRAME_HEADER_SIZE + image.len());
        frame.extend_from_slice(&page_id.to_le_bytes());
        frame.extend_from_slice(&txn_id.to_le_bytes());
        frame.extend_from_slice(&flags.to_le_bytes());
        frame.extend_from_slice(&db_page_count.to_le_bytes());
        frame.extend_from_slice(&checksum.to_le_bytes());
        frame.extend_from_slice(image);

        let image_offset = self.known_len + WAL_FRAME_HEADER_SIZE as u64;
        self.backing.append(&frame)?;
        self.known_len += frame.len() as u64;
        self.running_checksum = checksum;
        self.frames.push(FrameMeta {
            page_id,
            txn_id,
            image_offset,
            checksum,
            committed: false,
            is_commit_marker: flags & FLAG_COMMIT != 0,
            db_page_count,
        });
        Ok(())
    }

    /// Drop frames appended after the last commit marker (failed or rolled
    /// back commit attempt).
    pub fn discard_uncommitted(&mut self) -> Result<()> {
        if self.frames.len() == self.committed_boundary {
            return Ok(());
        }
        self.frames.truncate(self.committed_boundary);
        let valid_len = self
            .frames
            .last()
            .map(|f| f.image_offset + if f.is_commit_marker { 0 } else { PAGE_SIZE as u64 })
            .unwrap_or(WAL_HEADER_SIZE as u64);
        self.backing.truncate(valid_len)?;
        self.known_len = valid_len;
        self.running_checksum = self
            .frames
            .last()
            .map(|f| f.checksum)
            .unwrap_or(self.header_checksum);
        Ok(())
    }

    /// Latest committed image of `page_id` visible at `snapshot`, if the
    /// WAL holds one.
    pub fn read_latest(&mut self, page_id: PageId, snapshot: TxnId) -> Result<Option<Vec<u8>>> {
        let Some(indices) = self.index.get(&page_id) else {
            return Ok(None);
        };
        let frame = indices
            .iter()
            .rev()
            .map(|&i| self.frames[i])
            .find(|f| f.committed && f.txn_id <= snapshot);
        let Some(frame) = frame else {
            return Ok(None);
        };
        let mut image = vec![0u8; PAGE_SIZE];
        if self.backing.read_at(frame.image_offset, &mut image)? < PAGE_SIZE {
            return Err(DatabaseError::CorruptedDatabase {
                reason: format!("WAL image for page {} truncated", page_id),
            });
        }
        Ok(Some(image))
    }

    /// Database page count recorded by the last commit marker, if any.
    pub fn committed_page_count(&self) -> Option<u64> {
        self.frames[..self.committed_boundary]
            .iter()
            .rev()
            .find(|f| f.is_commit_marker)
            .map(|f| f.db_page_count)
    }

    /// Replay every committed frame into the main file (latest frame per
    /// page, in page-number order), sync it, then reset the log per the
    /// journal mode. Returns the number of pages written back.
    pub fn checkpoint(&mut self, store: &mut PageStore) -> Result<usize> {
        self.refresh()?;
        let mut latest: std::collections::BTreeMap<PageId, FrameMeta> =
            std::collections::BTreeMap::new();
        for frame in &self.frames[..self.committed_boundary] {
            if !frame.is_commit_marker {
                latest.insert(frame.page_id, *frame);
            }
        }
        let page_count = latest.len();
        let mut image = vec![0u8; PAGE_SIZE];
        for (page_id, frame) in latest {
            if self.backing.read_at(frame.image_offset, &mut image)? < PAGE_SIZE {
                return Err(DatabaseError::CorruptedDatabase {
                    reason: format!("WAL image for page {} truncated", page_id),
                });
            }
            store.write_page(page_id, &image)?;
        }
        if let Some(committed_pages) = self.committed_page_count() {
            // Auto-vacuum may have shrunk the database below the file size.
            if committed_pages < store.page_count_on_disk()? {
                store.truncate(committed_pages)?;
            }
        }
        store.sync()?;
        self.reset_after_checkpoint()?;
        debug!(pages = page_count, "checkpoint complete");
        Ok(page_count)
    }

    fn reset_after_checkpoint(&mut self) -> Result<()> {
        match (&mut self.backing, self.mode) {
            (WalBacking::Memory(_), _) => self.write_fresh_header(),
            (_, JournalMode::Persist) => {
                // Keep the file at full length but invalidate its header;
                // the next scan starts a fresh generation over it.
                self.backing.write_at(0, &[0u8; 8])?;
                self.backing.sync()?;
                self.write_fresh_header()
            }
            (WalBacking::File { path, .. }, JournalMode::Delete) => {
                let path = path.clone();
                std::fs::remove_file(&path).ok();
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(&path)?;
                self.backing = WalBacking::File { file, path };
                self.write_fresh_header()
            }
            // Wal, Truncate and the remaining modes truncate in place.
            _ => self.write_fresh_header(),
        }
    }
}
