use std::collections::HashMap;
use std::fs::{File, OpenOptions, TryLockError};
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::storage::header::DbHeader;
use crate::types::error::{DatabaseError, Result};
use crate::types::page::Page;
use crate::types::{PageId, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committing,
    Committed,
    Aborted,
}

/// One transaction of the single-writer model.
///
/// A reader only carries its snapshot. A writer additionally owns its
/// copy-on-write page set and a private copy of the database header, so
/// nothing it does is observable until the WAL commit marker lands.
pub struct Transaction {
    pub id: TxnId,
    /// Read version: the last committed transaction at `begin()`.
    pub snapshot: TxnId,
    pub mode: TxnMode,
    pub state: TxnState,
    /// Copy-on-write pages, keyed by page id (decoded, plaintext).
    pub pages: HashMap<PageId, Page>,
    /// Pages freed during this transaction; commit threads the survivors
    /// onto the freelist or gives trailing ones back to the file.
    pub freed: Vec<PageId>,
    /// Writer's private header copy (page count, freelist, versions).
    pub header: DbHeader,
    /// Raw plaintext images staged outside the typed write set, used for
    /// freelist trunk pages whose content is just a next pointer.
    pub raw_pages: HashMap<PageId, Vec<u8>>,
    /// Whether any split/merge/root move happened; foreign connections
    /// learn of it through the epoch bump their next refresh performs.
    pub structural_change: bool,
}

impl Transaction {
    pub fn new_read(snapshot: TxnId, header: DbHeader) -> Self {
        Self {
            id: snapshot,
            snapshot,
            mode: TxnMode::Read,
            state: TxnState::Active,
            pages: HashMap::new(),
            freed: Vec::new(),
            header,
            raw_pages: HashMap::new(),
            structural_change: false,
        }
    }

    pub fn new_write(snapshot: TxnId, header: DbHeader) -> Self {
        Self {
            id: snapshot + 1,
            snapshot,
            mode: TxnMode::Write,
            state: TxnState::Active,
            pages: HashMap::new(),
            freed: Vec::new(),
            header,
            raw_pages: HashMap::new(),
            structural_change: false,
        }
    }

    pub fn is_write(&self) -> bool {
        self.mode == TxnMode::Write
    }

    pub fn assert_writable(&self) -> Result<()> {
        if !self.is_write() || self.state != TxnState::Active {
            return Err(DatabaseError::Misuse {
                reason: "mutation outside an active write transaction".to_string(),
            });
        }
        Ok(())
    }

    /// Stage a copy-on-write page image.
    pub fn put_page(&mut self, page: Page) {
        self.pages.insert(page.page_id, page);
    }

    pub fn get_page(&self, page_id: PageId) -> Option<&Page> {
        self.pages.get(&page_id)
    }
}

// SQLite-style busy retry schedule, in milliseconds.
const BUSY_DELAYS_MS: [u64; 12] = [1, 2, 5, 10, 15, 20, 25, 25, 25, 50, 50, 100];

fn busy_delay(attempt: usize) -> Duration {
    let ms = BUSY_DELAYS_MS[attempt.min(BUSY_DELAYS_MS.len() - 1)];
    Duration::from_millis(ms)
}

/// Advisory file lock with a busy-timeout retry schedule.
///
/// The writer lock (`<db>.lock`) is exclusive among writers; the
/// checkpoint lock (`<db>.ckpt`) is held shared by readers and exclusive
/// by checkpoint/recovery, so log replay never races an active reader in
/// another connection.
pub struct LockFile {
    file: File,
    held: bool,
}

impl LockFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        Ok(Self { file, held: false })
    }

    pub fn acquire_exclusive(&mut self, timeout_ms: u64) -> Result<()> {
        self.acquire(timeout_ms, true)
    }

    pub fn acquire_shared(&mut self, timeout_ms: u64) -> Result<()> {
        self.acquire(timeout_ms, false)
    }

    fn acquire(&mut self, timeout_ms: u64, exclusive: bool) -> Result<()> {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            let outcome = if exclusive {
                self.file.try_lock()
            } else {
                self.file.try_lock_shared()
            };
            match outcome {
                Ok(()) => {
                    self.held = true;
                    return Ok(());
                }
                Err(TryLockError::WouldBlock) => {
                    let waited = started.elapsed().as_millis() as u64;
                    if waited >= timeout_ms {
                        trace!(waited, exclusive, "lock acquisition timed out");
                        return Err(DatabaseError::Busy { waited_ms: waited });
                    }
                    std::thread::sleep(busy_delay(attempt));
                    attempt += 1;
                }
                Err(TryLockError::Error(e)) => return Err(e.into()),
            }
        }
    }

    pub fn release(&mut self) -> Result<()> {
        if self.held {
            self.file.unlock()?;
            self.held = false;
        }
        Ok(())
    }

    pub fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
