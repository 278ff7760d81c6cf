pub mod config;
pub mod function;
pub mod observer;
pub mod statement;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::engine::config::{EngineConfig, parse_boolean_pragma, parse_integer_pragma};
use crate::engine::function::{AccumulatorFactory, FunctionRegistry, ScalarFn};
use crate::engine::observer::{EngineEvent, EngineObserver, NoopObserver};
use crate::storage::DB_HEADER_SIZE;
use crate::storage::btree::{BTree, DuplicatePolicy, PageIo, TreeDef, free_tree};
use crate::storage::cache::PageCache;
use crate::storage::cipher::{KeyProvider, PageCipher, generate_salt};
use crate::storage::header::{AutoVacuum, DbHeader, JournalMode};
use crate::storage::pager::PageStore;
use crate::storage::txn::{LockFile, Transaction, TxnState};
use crate::storage::wal::Wal;
use crate::types::error::{DatabaseError, Result};
use crate::types::page::{Page, PageType};
use crate::types::record::Record;
use crate::types::value::{DataType, Value};
use crate::types::{CATALOG_ROOT_PAGE_ID, CIPHER_RESERVED_BYTES, HEADER_PAGE_ID, PAGE_SIZE, PageId, TxnId};

const CATALOG_TREE_NAME: &str = "__catalog";

fn no_txn() -> DatabaseError {
    DatabaseError::Misuse {
        reason: "no active transaction".to_string(),
    }
}

fn salt_to_hex(salt: &[u8]) -> String {
    salt.iter().map(|b| format!("{:02x}", b)).collect()
}

fn salt_from_hex(text: &str) -> Result<[u8; 16]> {
    let text = text.trim();
    if text.len() != 32 || !text.is_ascii() {
        return Err(DatabaseError::Configuration {
            reason: "cipher_salt expects 32 hex digits".to_string(),
        });
    }
    let mut salt = [0u8; 16];
    for (i, byte) in salt.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&text[2 * i..2 * i + 2], 16).map_err(|_| {
            DatabaseError::Configuration {
                reason: "cipher_salt expects 32 hex digits".to_string(),
            }
        })?;
    }
    Ok(salt)
}

fn wal_path(db: &Path) -> PathBuf {
    sibling_path(db, "-wal")
}

fn lock_path(db: &Path) -> PathBuf {
    sibling_path(db, "-lock")
}

fn ckpt_path(db: &Path) -> PathBuf {
    sibling_path(db, "-ckpt")
}

fn sibling_path(db: &Path, suffix: &str) -> PathBuf {
    let mut name = db.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    db.with_file_name(name)
}

fn catalog_tree_def(root: PageId) -> TreeDef {
    TreeDef {
        name: CATALOG_TREE_NAME.to_string(),
        root,
        key_type: DataType::Text,
        on_duplicate: DuplicatePolicy::Overwrite,
    }
}

fn encode_tree_record(def: &TreeDef) -> Record {
    Record::new(vec![
        Value::Integer(def.root as i64),
        Value::Text(def.key_type.name().to_string()),
        Value::Text(def.on_duplicate.name().to_string()),
    ])
}

fn decode_tree_record(key: &Value, record: &Record) -> Result<TreeDef> {
    let malformed = || DatabaseError::CorruptedDatabase {
        reason: "malformed catalog record".to_string(),
    };
    let Value::Text(name) = key else {
        return Err(malformed());
    };
    let Some(Value::Integer(root)) = record.get_value(0) else {
        return Err(malformed());
    };
    let Some(Value::Text(key_type)) = record.get_value(1) else {
        return Err(malformed());
    };
    let Some(Value::Text(policy)) = record.get_value(2) else {
        return Err(malformed());
    };
    Ok(TreeDef {
        name: name.clone(),
        root: *root as PageId,
        key_type: DataType::from_name(key_type)?,
        on_duplicate: DuplicatePolicy::from_name(policy)?,
    })
}

/// Page 0 image: the database header followed by zero padding. Page 0 is
/// always stored plaintext.
fn header_page_image(header: &DbHeader) -> Vec<u8> {
    let mut image = header.to_bytes();
    image.resize(PAGE_SIZE, 0);
    image
}

fn decode_raw(cipher: Option<&PageCipher>, page_id: PageId, raw: Vec<u8>) -> Result<Vec<u8>> {
    match cipher {
        Some(cipher) if page_id != HEADER_PAGE_ID => cipher.decrypt_page(page_id, &raw),
        _ => Ok(raw),
    }
}

fn encode_plain(cipher: Option<&PageCipher>, page_id: PageId, mut plain: Vec<u8>) -> Result<Vec<u8>> {
    match cipher {
        Some(cipher) if page_id != HEADER_PAGE_ID => cipher.encrypt_page(page_id, &plain),
        _ => {
            plain.resize(PAGE_SIZE, 0);
            Ok(plain)
        }
    }
}

/// Resolve the committed plaintext image of a page at a snapshot:
/// WAL first, then the cache, then the main file.
fn resolve_plain(
    store: &mut PageStore,
    wal: &mut Wal,
    cache: &mut PageCache,
    cipher: Option<&PageCipher>,
    page_id: PageId,
    snapshot: TxnId,
) -> Result<Vec<u8>> {
    if let Some(raw) = wal.read_latest(page_id, snapshot)? {
        return decode_raw(cipher, page_id, raw);
    }
    if let Some(data) = cache.fetch(page_id, snapshot) {
        return Ok(data.to_vec());
    }
    let raw = store.read_page(page_id)?;
    let plain = decode_raw(cipher, page_id, raw)?;
    // Main-file images predate every snapshot still reachable here.
    cache.insert(page_id, plain.clone(), 0);
    Ok(plain)
}

/// Page access for one transaction: reads go write set → WAL → cache →
/// store, writes stage copy-on-write images in the transaction.
pub(crate) struct TxnPager<'a> {
    store: &'a mut PageStore,
    wal: &'a mut Wal,
    cache: &'a mut PageCache,
    cipher: Option<&'a PageCipher>,
    txn: &'a mut Transaction,
    usable: usize,
    epoch: &'a mut u64,
}

impl TxnPager<'_> {
    /// Raw plaintext image, bypassing the typed page codec. Used for
    /// freelist trunk pages.
    fn read_plain(&mut self, page_id: PageId) -> Result<Vec<u8>> {
        if let Some(raw) = self.txn.raw_pages.get(&page_id) {
            return Ok(raw.clone());
        }
        if let Some(page) = self.txn.get_page(page_id) {
            return Ok(page.to_bytes());
        }
        resolve_plain(
            self.store,
            self.wal,
            self.cache,
            self.cipher,
            page_id,
            self.txn.snapshot,
        )
    }
}

impl PageIo for TxnPager<'_> {
    fn read_page(&mut self, page_id: PageId) -> Result<Page> {
        if let Some(page) = self.txn.get_page(page_id) {
            return Ok(page.clone());
        }
        let plain = resolve_plain(
            self.store,
            self.wal,
            self.cache,
            self.cipher,
            page_id,
            self.txn.snapshot,
        )?;
        Page::from_bytes(page_id, &plain)
    }

    fn write_page(&mut self, page: Page) -> Result<()> {
        self.txn.assert_writable()?;
        self.txn.raw_pages.remove(&page.page_id);
        self.txn.put_page(page);
        Ok(())
    }

    fn allocate_page(&mut self, page_type: PageType) -> Result<Page> {
        self.txn.assert_writable()?;
        // Pages freed earlier in this transaction come back first.
        if let Some(page_id) = self.txn.freed.pop() {
            return Ok(Page::new(page_id, page_type, self.usable));
        }
        if self.txn.header.freelist_head != 0 {
            let page_id = self.txn.header.freelist_head;
            let plain = self.read_plain(page_id)?;
            if plain.len() < 8 {
                return Err(DatabaseError::CorruptedPage {
                    page_id,
                    reason: "freelist page too short".to_string(),
                });
            }
            let next = u64::from_le_bytes(plain[..8].try_into().expect("8-byte slice"));
            self.txn.raw_pages.remove(&page_id);
            self.txn.header.freelist_head = next;
            self.txn.header.freelist_count = self.txn.header.freelist_count.saturating_sub(1);
            return Ok(Page::new(page_id, page_type, self.usable));
        }
        let page_id = self.txn.header.page_count;
        self.txn.header.page_count += 1;
        Ok(Page::new(page_id, page_type, self.usable))
    }

    fn free_page(&mut self, page_id: PageId) -> Result<()> {
        self.txn.assert_writable()?;
        self.txn.pages.remove(&page_id);
        self.txn.raw_pages.remove(&page_id);
        self.txn.freed.push(page_id);
        Ok(())
    }

    fn usable_size(&self) -> usize {
        self.usable
    }

    fn mark_structural(&mut self) {
        // Pages moved or were freed: cursors opened earlier in this
        // transaction must not keep walking them.
        self.txn.structural_change = true;
        *self.epoch += 1;
    }
}

/// Handle for cancelling a running statement from another thread.
#[derive(Clone)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// One connection to a database file: the page store, log, cache, cipher
/// and catalog behind a transactional key-ordered tree API.
///
/// A connection runs at most one transaction at a time. Writers are
/// serialized across connections by an advisory lock; readers run against
/// their snapshot without blocking the writer.
pub struct Engine {
    pub(crate) store: PageStore,
    pub(crate) wal: Wal,
    pub(crate) cache: PageCache,
    pub(crate) cipher: Option<PageCipher>,
    key_material: Option<Zeroizing<Vec<u8>>>,
    pub(crate) header: DbHeader,
    /// Committed catalog: tree name → definition.
    pub(crate) catalog: HashMap<String, TreeDef>,
    /// Writer's uncommitted catalog view, swapped in at commit.
    pub(crate) txn_catalog: Option<HashMap<String, TreeDef>>,
    pub(crate) txn: Option<Transaction>,
    write_lock: LockFile,
    ckpt_lock: LockFile,
    pub(crate) busy_timeout_ms: u64,
    wal_autocheckpoint: usize,
    cache_capacity: usize,
    /// Bumped whenever a commit changed the tree shape; open cursors from
    /// earlier epochs refuse to advance.
    pub(crate) structural_epoch: u64,
    data_version: u64,
    interrupt: Arc<AtomicBool>,
    observer: Box<dyn EngineObserver + Send>,
    pub(crate) functions: FunctionRegistry,
    path: PathBuf,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open a database resolving key material through `provider`, keyed by
    /// the database file name. Overrides any key set in `config`.
    pub fn open_with_provider<P: AsRef<Path>>(
        path: P,
        mut config: EngineConfig,
        provider: &dyn KeyProvider,
    ) -> Result<Self> {
        let identifier = path
            .as_ref()
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        config.key = provider.get_key(&identifier)?;
        Self::open(path, config)
    }

    /// Open a database file, creating and initializing it when absent.
    pub fn open<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let mut store = PageStore::open(&path)?;
        let existing = store.page_count_on_disk()? > 0;

        let mut header;
        let cipher;
        if existing {
            header = DbHeader::from_bytes(&store.read_page(HEADER_PAGE_ID)?)?;
            cipher = match (&config.key, header.salt_present) {
                (Some(key), true) => Some(PageCipher::derive(key, header.cipher_salt)),
                (None, false) => None,
                (None, true) => {
                    return Err(DatabaseError::Configuration {
                        reason: "database is encrypted, a key is required".to_string(),
                    });
                }
                (Some(_), false) => {
                    return Err(DatabaseError::Configuration {
                        reason: "key given for an unencrypted database".to_string(),
                    });
                }
            };
        } else {
            header = DbHeader {
                journal_mode: config.journal_mode,
                auto_vacuum: config.auto_vacuum,
                foreign_keys: config.foreign_keys,
                plaintext_header_size: config.plaintext_header_size,
                ..DbHeader::default()
            };
            cipher = match &config.key {
                Some(key) => {
                    let salt = generate_salt();
                    header.reserved_bytes = CIPHER_RESERVED_BYTES as u8;
                    header.salt_present = true;
                    header.cipher_salt = salt;
                    Some(PageCipher::derive(key, salt))
                }
                None => None,
            };
            // Bootstrap: header page plus an empty catalog root.
            store.write_page(HEADER_PAGE_ID, &header_page_image(&header))?;
            let catalog_root = Page::new(
                CATALOG_ROOT_PAGE_ID,
                PageType::Leaf,
                header.usable_page_size(),
            );
            let image = encode_plain(cipher.as_ref(), CATALOG_ROOT_PAGE_ID, catalog_root.to_bytes())?;
            store.write_page(CATALOG_ROOT_PAGE_ID, &image)?;
            store.sync()?;
            debug!(path = %path.display(), "database created");
        }

        let mut wal = if header.journal_mode.uses_log_file() {
            Wal::open_file(wal_path(&path), header.journal_mode)?
        } else {
            let mut wal = Wal::new_memory()?;
            wal.set_mode(header.journal_mode);
            wal
        };

        // A crash may have left the committed header only in the log.
        let mut cipher = cipher;
        if existing {
            let snapshot = wal.last_committed_txn();
            if let Some(raw) = wal.read_latest(HEADER_PAGE_ID, snapshot)? {
                let committed = DbHeader::from_bytes(&raw)?;
                if committed.cipher_salt != header.cipher_salt {
                    // Interrupted rekey: the new salt reached the log but
                    // not the main file yet.
                    if let Some(key) = &config.key {
                        cipher = Some(PageCipher::derive(key, committed.cipher_salt));
                    }
                }
                header = committed;
                wal.set_mode(header.journal_mode);
            }
        }

        let mut engine = Self {
            store,
            wal,
            cache: PageCache::new(config.cache_capacity),
            cipher,
            key_material: config.key.map(Zeroizing::new),
            header,
            catalog: HashMap::new(),
            txn_catalog: None,
            txn: None,
            write_lock: LockFile::open(lock_path(&path))?,
            ckpt_lock: LockFile::open(ckpt_path(&path))?,
            busy_timeout_ms: config.busy_timeout_ms,
            wal_autocheckpoint: config.wal_autocheckpoint,
            cache_capacity: config.cache_capacity,
            structural_epoch: 0,
            data_version: 0,
            interrupt: Arc::new(AtomicBool::new(false)),
            observer: Box::new(NoopObserver),
            functions: FunctionRegistry::with_builtins(),
            path,
        };
        let snapshot = engine.wal.last_committed_txn();
        engine.catalog = engine.load_catalog(snapshot)?;
        Ok(engine)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_observer(&mut self, observer: Box<dyn EngineObserver + Send>) {
        self.observer = observer;
    }

    pub fn register_scalar(&mut self, name: &str, function: ScalarFn) {
        self.functions.register_scalar(name, function);
    }

    pub fn register_aggregate(&mut self, name: &str, factory: AccumulatorFactory) {
        self.functions.register_aggregate(name, factory);
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(Arc::clone(&self.interrupt))
    }

    pub(crate) fn check_interrupt(&self) -> Result<()> {
        if self.interrupt.swap(false, Ordering::SeqCst) {
            return Err(DatabaseError::Interrupted);
        }
        Ok(())
    }

    /// Counter that changes whenever another connection's commit becomes
    /// visible to this one.
    pub fn data_version(&self) -> u64 {
        self.data_version
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    pub fn tree_names(&self) -> Vec<String> {
        let map = self.txn_catalog.as_ref().unwrap_or(&self.catalog);
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn begin_read(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(DatabaseError::Misuse {
                reason: "transaction already active".to_string(),
            });
        }
        self.ckpt_lock.acquire_shared(self.busy_timeout_ms)?;
        if let Err(e) = self.refresh_snapshot() {
            let _ = self.ckpt_lock.release();
            return Err(e);
        }
        let snapshot = self.wal.last_committed_txn();
        self.txn = Some(Transaction::new_read(snapshot, self.header.clone()));
        Ok(())
    }

    pub fn begin_write(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(DatabaseError::Misuse {
                reason: "transaction already active".to_string(),
            });
        }
        self.ckpt_lock.acquire_shared(self.busy_timeout_ms)?;
        if let Err(e) = self
            .write_lock
            .acquire_exclusive(self.busy_timeout_ms)
            .and_then(|()| self.refresh_snapshot())
        {
            let _ = self.write_lock.release();
            let _ = self.ckpt_lock.release();
            return Err(e);
        }
        let snapshot = self.wal.last_committed_txn();
        self.txn = Some(Transaction::new_write(snapshot, self.header.clone()));
        self.txn_catalog = Some(self.catalog.clone());
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        let txn = self.txn.take().ok_or_else(no_txn)?;
        if !txn.is_write() {
            self.ckpt_lock.release()?;
            return Ok(());
        }
        let result = self.commit_write(txn);
        if result.is_err() {
            let _ = self.wal.discard_uncommitted();
            self.txn_catalog = None;
        }
        self.write_lock.release()?;
        self.ckpt_lock.release()?;
        result?;
        self.maybe_auto_checkpoint();
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        let txn = self.txn.take().ok_or_else(no_txn)?;
        self.txn_catalog = None;
        if txn.is_write() {
            // Nothing reaches the log before commit, but a failed commit
            // attempt may have left frames behind.
            let _ = self.wal.discard_uncommitted();
            self.write_lock.release()?;
            self.observer.on_event(&EngineEvent::RolledBack { txn_id: txn.id });
        }
        self.ckpt_lock.release()?;
        Ok(())
    }

    fn commit_write(&mut self, mut txn: Transaction) -> Result<()> {
        txn.state = TxnState::Committing;
        if txn.pages.is_empty()
            && txn.raw_pages.is_empty()
            && txn.freed.is_empty()
            && txn.header == self.header
        {
            // Write transaction that wrote nothing.
            self.txn_catalog = None;
            return Ok(());
        }

        let mut header = txn.header.clone();
        let mut freed = txn.freed.clone();
        freed.sort_unstable();
        freed.dedup();

        // Full auto-vacuum gives trailing freed pages back to the file.
        if header.auto_vacuum == AutoVacuum::Full {
            while let Some(pos) = freed.iter().position(|&p| p + 1 == header.page_count) {
                freed.remove(pos);
                header.page_count -= 1;
                txn.pages.remove(&header.page_count);
                txn.raw_pages.remove(&header.page_count);
            }
        }

        // The rest thread onto the freelist, newest first.
        let usable = header.usable_page_size();
        for page_id in freed {
            let mut image = vec![0u8; usable];
            image[..8].copy_from_slice(&header.freelist_head.to_le_bytes());
            header.freelist_head = page_id;
            header.freelist_count += 1;
            txn.raw_pages.insert(page_id, image);
        }
        header.change_counter += 1;

        let mut images: BTreeMap<PageId, Vec<u8>> = BTreeMap::new();
        for (page_id, page) in &txn.pages {
            images.insert(*page_id, page.to_bytes());
        }
        for (page_id, raw) in &txn.raw_pages {
            images.insert(*page_id, raw.clone());
        }

        let mut frames = 0;
        for (page_id, plain) in &images {
            if *page_id >= header.page_count {
                continue; // vacuumed off the end of the file
            }
            let image = encode_plain(self.cipher.as_ref(), *page_id, plain.clone())?;
            self.wal.append_frame(txn.id, *page_id, &image)?;
            frames += 1;
        }
        self.wal.append_frame(txn.id, HEADER_PAGE_ID, &header_page_image(&header))?;
        self.wal.commit(txn.id, header.page_count)?;

        for (page_id, plain) in images {
            if page_id < header.page_count {
                self.cache.insert(page_id, plain, txn.id);
            }
        }
        self.header = header;
        if let Some(catalog) = self.txn_catalog.take() {
            self.catalog = catalog;
        }
        if txn.structural_change {
            self.structural_epoch += 1;
        }
        self.observer.on_event(&EngineEvent::Committed {
            txn_id: txn.id,
            pages: frames + 1,
        });
        Ok(())
    }

    fn maybe_auto_checkpoint(&mut self) {
        let force = self.header.journal_mode == JournalMode::Off;
        let due = self.wal_autocheckpoint > 0
            && self.wal.committed_frame_count() >= self.wal_autocheckpoint;
        if !force && !due {
            return;
        }
        match self.checkpoint_with_timeout(0) {
            Ok(_) => {}
            Err(DatabaseError::Busy { .. }) => {
                trace!("auto-checkpoint skipped, database busy");
            }
            Err(e) => warn!(error = %e, "auto-checkpoint failed"),
        }
    }

    /// Replay the log into the main file and reset it. Fails with `Busy`
    /// while another connection holds a read snapshot.
    pub fn checkpoint(&mut self) -> Result<usize> {
        self.checkpoint_with_timeout(self.busy_timeout_ms)
    }

    fn checkpoint_with_timeout(&mut self, timeout_ms: u64) -> Result<usize> {
        if self.txn.is_some() {
            return Err(DatabaseError::Misuse {
                reason: "checkpoint inside a transaction".to_string(),
            });
        }
        self.ckpt_lock.acquire_exclusive(timeout_ms)?;
        if let Err(e) = self.write_lock.acquire_exclusive(timeout_ms) {
            let _ = self.ckpt_lock.release();
            return Err(e);
        }
        let result = self.wal.checkpoint(&mut self.store);
        self.write_lock.release()?;
        self.ckpt_lock.release()?;
        let pages = result?;
        self.observer.on_event(&EngineEvent::Checkpointed { pages });
        Ok(pages)
    }

    // Pull in commits made by other connections since our last look.
    fn refresh_snapshot(&mut self) -> Result<()> {
        let before = self.wal.last_committed_txn();
        self.wal.refresh()?;
        if self.wal.last_committed_txn() != before {
            self.cache.clear();
            self.data_version += 1;
            self.structural_epoch += 1;
            self.reload_committed_state()?;
        }
        Ok(())
    }

    fn reload_committed_state(&mut self) -> Result<()> {
        let snapshot = self.wal.last_committed_txn();
        let raw = match self.wal.read_latest(HEADER_PAGE_ID, snapshot)? {
            Some(raw) => raw,
            None => self.store.read_page(HEADER_PAGE_ID)?,
        };
        let header = DbHeader::from_bytes(&raw)?;
        if header.cipher_salt != self.header.cipher_salt
            || header.salt_present != self.header.salt_present
        {
            // Another connection rekeyed the database.
            self.cipher = match (&self.key_material, header.salt_present) {
                (Some(key), true) => Some(PageCipher::derive(key, header.cipher_salt)),
                (_, false) => None,
                (None, true) => {
                    return Err(DatabaseError::Configuration {
                        reason: "database is encrypted, a key is required".to_string(),
                    });
                }
            };
        }
        self.wal.set_mode(header.journal_mode);
        self.header = header;
        self.catalog = self.load_catalog(snapshot)?;
        Ok(())
    }

    fn load_catalog(&mut self, snapshot: TxnId) -> Result<HashMap<String, TreeDef>> {
        let catalog_root = self.header.catalog_root;
        let mut txn = Transaction::new_read(snapshot, self.header.clone());
        let mut pager = TxnPager {
            store: &mut self.store,
            wal: &mut self.wal,
            cache: &mut self.cache,
            cipher: self.cipher.as_ref(),
            txn: &mut txn,
            usable: self.header.usable_page_size(),
            epoch: &mut self.structural_epoch,
        };
        let tree = BTree::new(catalog_tree_def(catalog_root));
        let mut catalog = HashMap::new();
        let mut cursor = tree.first(&mut pager, 0)?;
        while let Some((key, record)) = tree.cursor_current(&mut pager, &cursor)? {
            let def = decode_tree_record(&key, &record)?;
            catalog.insert(def.name.clone(), def);
            if !tree.cursor_next(&mut pager, &mut cursor)? {
                break;
            }
        }
        Ok(catalog)
    }

    pub(crate) fn pager(&mut self) -> Result<TxnPager<'_>> {
        let usable = self.header.usable_page_size();
        let txn = self.txn.as_mut().ok_or_else(no_txn)?;
        Ok(TxnPager {
            store: &mut self.store,
            wal: &mut self.wal,
            cache: &mut self.cache,
            cipher: self.cipher.as_ref(),
            txn,
            usable,
            epoch: &mut self.structural_epoch,
        })
    }

    /// Run `f` inside a write transaction, opening and committing one if
    /// none is active.
    pub(crate) fn run_write<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let implicit = self.txn.is_none();
        if implicit {
            self.begin_write()?;
        } else if !self.txn.as_ref().map(Transaction::is_write).unwrap_or(false) {
            return Err(DatabaseError::Misuse {
                reason: "write operation inside a read transaction".to_string(),
            });
        }
        match f(self) {
            Ok(value) => {
                if implicit {
                    self.commit()?;
                }
                Ok(value)
            }
            Err(e) => {
                if implicit {
                    let _ = self.rollback();
                }
                Err(e)
            }
        }
    }

    /// Run `f` inside the active transaction, opening a read snapshot for
    /// the call when none is active.
    pub(crate) fn run_read<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let implicit = self.txn.is_none();
        if implicit {
            self.begin_read()?;
        }
        let result = f(self);
        if implicit {
            match &result {
                Ok(_) => self.commit()?,
                Err(_) => {
                    let _ = self.rollback();
                }
            }
        }
        result
    }

    pub(crate) fn txn_tree(&self, name: &str) -> Result<TreeDef> {
        let map = self.txn_catalog.as_ref().unwrap_or(&self.catalog);
        map.get(name)
            .cloned()
            .ok_or_else(|| DatabaseError::TreeNotFound {
                name: name.to_string(),
            })
    }

    fn catalog_put(&mut self, def: &TreeDef) -> Result<()> {
        let root = self.txn.as_ref().ok_or_else(no_txn)?.header.catalog_root;
        let mut tree = BTree::new(catalog_tree_def(root));
        let key = Value::Text(def.name.clone());
        let record = encode_tree_record(def);
        {
            let mut pager = self.pager()?;
            tree.insert(&mut pager, key, record)?;
        }
        if tree.def.root != root {
            self.txn.as_mut().ok_or_else(no_txn)?.header.catalog_root = tree.def.root;
        }
        Ok(())
    }

    fn catalog_delete(&mut self, name: &str) -> Result<()> {
        let root = self.txn.as_ref().ok_or_else(no_txn)?.header.catalog_root;
        let mut tree = BTree::new(catalog_tree_def(root));
        {
            let mut pager = self.pager()?;
            tree.delete(&mut pager, &Value::Text(name.to_string()))?;
        }
        if tree.def.root != root {
            self.txn.as_mut().ok_or_else(no_txn)?.header.catalog_root = tree.def.root;
        }
        Ok(())
    }

    /// Persist a moved tree root into the catalog and the transaction's
    /// catalog view.
    pub(crate) fn note_root_change(&mut self, def: TreeDef) -> Result<()> {
        self.catalog_put(&def)?;
        if let Some(catalog) = &mut self.txn_catalog {
            catalog.insert(def.name.clone(), def);
        }
        Ok(())
    }

    pub fn create_tree(
        &mut self,
        name: &str,
        key_type: DataType,
        on_duplicate: DuplicatePolicy,
    ) -> Result<()> {
        if name.is_empty() || name.starts_with("__") {
            return Err(DatabaseError::Configuration {
                reason: format!("invalid tree name: {:?}", name),
            });
        }
        let name = name.to_string();
        self.run_write(move |engine| {
            if engine.txn_tree(&name).is_ok() {
                return Err(DatabaseError::TreeExists { name });
            }
            let root = {
                let mut pager = engine.pager()?;
                BTree::create(&mut pager)?
            };
            let def = TreeDef {
                name: name.clone(),
                root,
                key_type,
                on_duplicate,
            };
            engine.catalog_put(&def)?;
            if let Some(catalog) = &mut engine.txn_catalog {
                catalog.insert(name.clone(), def);
            }
            engine.txn.as_mut().ok_or_else(no_txn)?.header.schema_version += 1;
            engine.observer.on_event(&EngineEvent::TreeCreated { name });
            Ok(())
        })
    }

    pub fn drop_tree(&mut self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.run_write(move |engine| {
            let def = engine.txn_tree(&name)?;
            {
                let mut pager = engine.pager()?;
                free_tree(&mut pager, def.root)?;
                pager.mark_structural();
            }
            engine.catalog_delete(&name)?;
            if let Some(catalog) = &mut engine.txn_catalog {
                catalog.remove(&name);
            }
            engine.txn.as_mut().ok_or_else(no_txn)?.header.schema_version += 1;
            engine.observer.on_event(&EngineEvent::TreeDropped { name });
            Ok(())
        })
    }

    /// Insert one entry. The key is coerced to the tree's declared key
    /// type; a null key is rejected.
    pub fn insert(&mut self, tree: &str, key: Value, record: Record) -> Result<()> {
        self.run_write(move |engine| {
            let def = engine.txn_tree(tree)?;
            let key = coerce_key(key, def.key_type)?;
            let mut btree = BTree::new(def.clone());
            {
                let mut pager = engine.pager()?;
                btree.insert(&mut pager, key, record)?;
            }
            if btree.def.root != def.root {
                engine.note_root_change(btree.def)?;
            }
            Ok(())
        })
    }

    /// Delete by key. Returns whether the key was present.
    pub fn delete(&mut self, tree: &str, key: &Value) -> Result<bool> {
        self.run_write(move |engine| {
            let def = engine.txn_tree(tree)?;
            let key = coerce_key(key.clone(), def.key_type)?;
            let mut btree = BTree::new(def.clone());
            let found = {
                let mut pager = engine.pager()?;
                btree.delete(&mut pager, &key)?
            };
            if btree.def.root != def.root {
                engine.note_root_change(btree.def)?;
            }
            Ok(found)
        })
    }

    pub fn lookup(&mut self, tree: &str, key: &Value) -> Result<Option<Record>> {
        self.run_read(move |engine| {
            let def = engine.txn_tree(tree)?;
            let key = coerce_key(key.clone(), def.key_type)?;
            let btree = BTree::new(def);
            let mut pager = engine.pager()?;
            btree.lookup(&mut pager, &key)
        })
    }

    pub fn pragma_get(&mut self, name: &str) -> Result<Value> {
        match name {
            "journal_mode" => Ok(Value::Text(self.header.journal_mode.name().to_string())),
            "auto_vacuum" => Ok(Value::Text(self.header.auto_vacuum.name().to_string())),
            "busy_timeout" => Ok(Value::Integer(self.busy_timeout_ms as i64)),
            "cache_size" => Ok(Value::Integer(self.cache_capacity as i64)),
            "wal_autocheckpoint" => Ok(Value::Integer(self.wal_autocheckpoint as i64)),
            "user_version" => Ok(Value::Integer(self.header.user_version as i64)),
            "schema_version" => Ok(Value::Integer(self.header.schema_version as i64)),
            "data_version" => Ok(Value::Integer(self.data_version as i64)),
            "page_count" => Ok(Value::Integer(self.header.page_count as i64)),
            "freelist_count" => Ok(Value::Integer(self.header.freelist_count as i64)),
            "foreign_keys" => Ok(Value::Integer(self.header.foreign_keys as i64)),
            "page_size" => Ok(Value::Integer(self.header.page_size as i64)),
            "plaintext_header_size" => {
                Ok(Value::Integer(self.header.plaintext_header_size as i64))
            }
            "cipher_salt" => Ok(if self.header.salt_present {
                Value::Text(salt_to_hex(&self.header.cipher_salt))
            } else {
                Value::Null
            }),
            _ => Err(DatabaseError::Configuration {
                reason: format!("unknown pragma: {}", name),
            }),
        }
    }

    /// Set a pragma by name. Returns the value now in effect.
    pub fn pragma_set(&mut self, name: &str, value: &str) -> Result<Value> {
        match name {
            "busy_timeout" => {
                self.busy_timeout_ms = parse_integer_pragma(value)?;
            }
            "cache_size" => {
                let capacity = parse_integer_pragma(value)? as usize;
                self.cache_capacity = capacity;
                self.cache = PageCache::new(capacity);
            }
            "wal_autocheckpoint" => {
                self.wal_autocheckpoint = parse_integer_pragma(value)? as usize;
            }
            "journal_mode" => {
                let mode = JournalMode::from_name(&value.to_ascii_lowercase())?;
                self.set_journal_mode(mode)?;
            }
            "auto_vacuum" => {
                let mode = AutoVacuum::from_name(&value.to_ascii_lowercase())?;
                self.run_write(|engine| {
                    engine.txn.as_mut().ok_or_else(no_txn)?.header.auto_vacuum = mode;
                    Ok(())
                })?;
            }
            "user_version" => {
                let version = parse_integer_pragma(value)? as u32;
                self.run_write(|engine| {
                    engine.txn.as_mut().ok_or_else(no_txn)?.header.user_version = version;
                    Ok(())
                })?;
            }
            "foreign_keys" => {
                let enabled = parse_boolean_pragma(value)?;
                self.run_write(|engine| {
                    engine.txn.as_mut().ok_or_else(no_txn)?.header.foreign_keys = enabled;
                    Ok(())
                })?;
            }
            "plaintext_header_size" => {
                let size = parse_integer_pragma(value)?;
                if size as usize > DB_HEADER_SIZE || size % 8 != 0 {
                    return Err(DatabaseError::Configuration {
                        reason: format!(
                            "plaintext header size must be a multiple of 8 up to {}",
                            DB_HEADER_SIZE
                        ),
                    });
                }
                self.run_write(move |engine| {
                    engine.txn.as_mut().ok_or_else(no_txn)?.header.plaintext_header_size =
                        size as u8;
                    Ok(())
                })?;
            }
            "cipher_salt" => {
                // Changing the salt changes the derived key, so every page
                // is re-encrypted under the current key material.
                let salt = salt_from_hex(value)?;
                let key = match &self.key_material {
                    Some(key) => key.clone(),
                    None => {
                        return Err(DatabaseError::Configuration {
                            reason: "cipher_salt requires an encrypted database".to_string(),
                        });
                    }
                };
                self.rekey_with_salt(&key, salt)?;
            }
            "schema_version" | "data_version" | "page_count" | "freelist_count" | "page_size" => {
                return Err(DatabaseError::Configuration {
                    reason: format!("pragma {} is read-only", name),
                });
            }
            _ => {
                return Err(DatabaseError::Configuration {
                    reason: format!("unknown pragma: {}", name),
                });
            }
        }
        self.pragma_get(name)
    }

    fn set_journal_mode(&mut self, mode: JournalMode) -> Result<()> {
        if self.txn.is_some() {
            return Err(DatabaseError::Misuse {
                reason: "journal mode change inside a transaction".to_string(),
            });
        }
        if mode == self.header.journal_mode {
            return Ok(());
        }
        // Flush pending frames under the old disposition first.
        self.checkpoint()?;
        if mode.uses_log_file() {
            self.wal = Wal::open_file(wal_path(&self.path), mode)?;
        } else {
            let mut wal = Wal::new_memory()?;
            wal.set_mode(mode);
            self.wal = wal;
        }
        self.cache.clear();
        self.run_write(|engine| {
            engine.txn.as_mut().ok_or_else(no_txn)?.header.journal_mode = mode;
            Ok(())
        })
    }

    /// Release up to `limit` freelist pages from the end of the file
    /// (incremental auto-vacuum); a limit of 0 releases as many as
    /// possible. Returns the number reclaimed.
    pub fn incremental_vacuum(&mut self, limit: u64) -> Result<u64> {
        let limit = if limit == 0 { u64::MAX } else { limit };
        self.run_write(move |engine| {
            // Walk the committed freelist chain.
            let mut chain = Vec::new();
            {
                let mut pager = engine.pager()?;
                let mut cursor = pager.txn.header.freelist_head;
                while cursor != 0 {
                    chain.push(cursor);
                    let plain = pager.read_plain(cursor)?;
                    cursor = u64::from_le_bytes(plain[..8].try_into().expect("8-byte slice"));
                }
            }
            let txn = engine.txn.as_mut().ok_or_else(no_txn)?;
            let mut reclaimed = 0;
            while reclaimed < limit {
                let tail = txn.header.page_count - 1;
                let Some(pos) = chain.iter().position(|&p| p == tail) else {
                    break;
                };
                chain.remove(pos);
                txn.raw_pages.remove(&tail);
                txn.header.page_count -= 1;
                reclaimed += 1;
            }
            if reclaimed > 0 {
                // Rebuild the chain over the surviving pages.
                let usable = txn.header.usable_page_size();
                let mut head = 0u64;
                let mut count = 0u64;
                for &page_id in chain.iter().rev() {
                    let mut image = vec![0u8; usable];
                    image[..8].copy_from_slice(&head.to_le_bytes());
                    txn.raw_pages.insert(page_id, image);
                    head = page_id;
                    count += 1;
                }
                txn.header.freelist_head = head;
                txn.header.freelist_count = count;
            }
            Ok(reclaimed)
        })
    }

    /// Re-encrypt every page under a key derived from `new_key` and a
    /// fresh salt, atomically: a crash mid-rekey leaves the database fully
    /// readable under the old key.
    pub fn rekey(&mut self, new_key: &[u8]) -> Result<usize> {
        self.rekey_with_salt(new_key, generate_salt())
    }

    fn rekey_with_salt(&mut self, new_key: &[u8], salt: [u8; 16]) -> Result<usize> {
        if self.txn.is_some() {
            return Err(DatabaseError::Misuse {
                reason: "rekey inside a transaction".to_string(),
            });
        }
        if self.cipher.is_none() {
            return Err(DatabaseError::Configuration {
                reason: "rekey requires an encrypted database".to_string(),
            });
        }
        if new_key.is_empty() {
            return Err(DatabaseError::Configuration {
                reason: "encryption key must not be empty".to_string(),
            });
        }
        self.ckpt_lock.acquire_exclusive(self.busy_timeout_ms)?;
        if let Err(e) = self.write_lock.acquire_exclusive(self.busy_timeout_ms) {
            let _ = self.ckpt_lock.release();
            return Err(e);
        }
        let result = self.rekey_locked(new_key, salt);
        if result.is_err() {
            let _ = self.wal.discard_uncommitted();
        }
        self.write_lock.release()?;
        self.ckpt_lock.release()?;
        let pages = result?;
        self.observer.on_event(&EngineEvent::Rekeyed { pages });
        Ok(pages)
    }

    fn rekey_locked(&mut self, new_key: &[u8], salt: [u8; 16]) -> Result<usize> {
        self.wal.refresh()?;
        let snapshot = self.wal.last_committed_txn();
        let txn_id = snapshot + 1;
        let new_cipher = PageCipher::derive(new_key, salt);
        let mut header = self.header.clone();

        for page_id in 1..header.page_count {
            let plain = resolve_plain(
                &mut self.store,
                &mut self.wal,
                &mut self.cache,
                self.cipher.as_ref(),
                page_id,
                snapshot,
            )?;
            let image = new_cipher.encrypt_page(page_id, &plain)?;
            self.wal.append_frame(txn_id, page_id, &image)?;
        }
        header.cipher_salt = salt;
        header.change_counter += 1;
        self.wal.append_frame(txn_id, HEADER_PAGE_ID, &header_page_image(&header))?;
        self.wal.commit(txn_id, header.page_count)?;

        // The new key is live; fold everything into the main file so no
        // old-key page survives anywhere.
        self.cipher = Some(new_cipher);
        self.key_material = Some(Zeroizing::new(new_key.to_vec()));
        self.header = header;
        self.cache.clear();
        self.wal.checkpoint(&mut self.store)
    }
}

pub(crate) fn coerce_key(key: Value, key_type: DataType) -> Result<Value> {
    if key.is_null() {
        return Err(DatabaseError::Misuse {
            reason: "tree keys must not be null".to_string(),
        });
    }
    key.coerce(key_type)
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Best-effort fold of the log into the main file on clean close.
        if self.txn.is_none() {
            if let Err(e) = self.checkpoint_with_timeout(0) {
                trace!(error = %e, "skipping checkpoint at close");
            }
        }
    }
}
