use crate::storage::DB_HEADER_SIZE;
use crate::storage::cache::DEFAULT_CACHE_CAPACITY;
use crate::storage::header::{AutoVacuum, JournalMode};
use crate::types::error::{DatabaseError, Result};

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Auto-checkpoint once the log holds this many committed frames.
pub const DEFAULT_WAL_AUTOCHECKPOINT: usize = 1_000;

/// Connection options, fixed at open time except where a pragma says
/// otherwise. Creation-only settings (journal mode, auto-vacuum, cipher
/// key, plaintext header size) are read back from the file header when
/// opening an existing database.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub journal_mode: JournalMode,
    pub auto_vacuum: AutoVacuum,
    pub cache_capacity: usize,
    pub busy_timeout_ms: u64,
    /// 0 disables automatic checkpoints.
    pub wal_autocheckpoint: usize,
    /// Enables the page cipher; pages are encrypted with a key derived
    /// from this material and the file's salt.
    pub key: Option<Vec<u8>>,
    /// Leading bytes of page 0 kept plaintext for file-type sniffing.
    pub plaintext_header_size: u8,
    pub foreign_keys: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::Wal,
            auto_vacuum: AutoVacuum::None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            wal_autocheckpoint: DEFAULT_WAL_AUTOCHECKPOINT,
            key: None,
            plaintext_header_size: 0,
            foreign_keys: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.plaintext_header_size as usize > DB_HEADER_SIZE {
            return Err(DatabaseError::Configuration {
                reason: format!(
                    "plaintext header size {} exceeds header size {}",
                    self.plaintext_header_size, DB_HEADER_SIZE
                ),
            });
        }
        if self.plaintext_header_size % 8 != 0 {
            return Err(DatabaseError::Configuration {
                reason: "plaintext header size must be a multiple of 8".to_string(),
            });
        }
        if let Some(key) = &self.key {
            if key.is_empty() {
                return Err(DatabaseError::Configuration {
                    reason: "encryption key must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

pub(crate) fn parse_boolean_pragma(text: &str) -> Result<bool> {
    match text.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => Err(DatabaseError::Configuration {
            reason: format!("expected a boolean, got {:?}", other),
        }),
    }
}

pub(crate) fn parse_integer_pragma(text: &str) -> Result<u64> {
    text.parse().map_err(|_| DatabaseError::Configuration {
        reason: format!("expected an integer, got {:?}", text),
    })
}
