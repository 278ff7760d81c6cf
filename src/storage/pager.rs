use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::types::error::{DatabaseError, Result};
use crate::types::{PAGE_SIZE, PageId};

/// Raw whole-page I/O over the main database file.
///
/// Reads and writes are page-aligned and whole-page only; atomicity is
/// provided by the write-ahead log, never assumed from the OS. Allocation
/// policy (free list, extension) lives in the transaction layer — the
/// store only moves raw page images.
pub struct PageStore {
    file: File,
    path: PathBuf,
}

impl PageStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id * PAGE_SIZE as u64
    }

    /// Number of whole pages currently in the file.
    pub fn page_count_on_disk(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len() / PAGE_SIZE as u64)
    }

    pub fn read_page(&mut self, page_id: PageId) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; PAGE_SIZE];
        self.file.seek(SeekFrom::Start(Self::page_offset(page_id)))?;
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Write one raw page image, extending the file if the page lies past
    /// the current end.
    pub fn write_page(&mut self, page_id: PageId, bytes: &[u8]) -> Result<()> {
        if bytes.len() != PAGE_SIZE {
            return Err(DatabaseError::InvalidPageSize {
                expected: PAGE_SIZE,
                actual: bytes.len(),
            });
        }
        let offset = Self::page_offset(page_id);
        let file_len = self.file.metadata()?.len();
        if offset > file_len {
            self.file.set_len(offset)?;
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    /// Drop pages at and beyond `page_count` (auto-vacuum truncation).
    pub fn truncate(&mut self, page_count: u64) -> Result<()> {
        self.file.set_len(page_count * PAGE_SIZE as u64)?;
        Ok(())
    }

    /// Durability barrier. Failure here is fatal to the enclosing
    /// transaction.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
