use serde::{Deserialize, Serialize};

use crate::storage::{DB_HEADER_SIZE, LUMBUNG_MAGIC};
use crate::types::error::{DatabaseError, Result};
use crate::types::{CATALOG_ROOT_PAGE_ID, PAGE_SIZE, PageId};

/// Journal mode pragma. `Wal` is the native mode; the rollback-journal
/// modes select the log file's disposition after a checkpoint, `Memory`
/// keeps frames in memory only, and `Off` bypasses the log entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalMode {
    Delete,
    Truncate,
    Persist,
    Memory,
    Wal,
    Off,
}

impl JournalMode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(JournalMode::Delete),
            1 => Ok(JournalMode::Truncate),
            2 => Ok(JournalMode::Persist),
            3 => Ok(JournalMode::Memory),
            4 => Ok(JournalMode::Wal),
            5 => Ok(JournalMode::Off),
            _ => Err(DatabaseError::InvalidHeader {
                reason: format!("invalid journal mode: {}", value),
            }),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            JournalMode::Delete => 0,
            JournalMode::Truncate => 1,
            JournalMode::Persist => 2,
            JournalMode::Memory => 3,
            JournalMode::Wal => 4,
            JournalMode::Off => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JournalMode::Delete => "delete",
            JournalMode::Truncate => "truncate",
            JournalMode::Persist => "persist",
            JournalMode::Memory => "memory",
            JournalMode::Wal => "wal",
            JournalMode::Off => "off",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "delete" => Ok(JournalMode::Delete),
            "truncate" => Ok(JournalMode::Truncate),
            "persist" => Ok(JournalMode::Persist),
            "memory" => Ok(JournalMode::Memory),
            "wal" => Ok(JournalMode::Wal),
            "off" => Ok(JournalMode::Off),
            _ => Err(DatabaseError::Configuration {
                reason: format!("invalid journal mode: {}", name),
            }),
        }
    }

    /// Modes that keep a log file on disk.
    pub fn uses_log_file(&self) -> bool {
        !matches!(self, JournalMode::Memory | JournalMode::Off)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoVacuum {
    None,
    Full,
    Incremental,
}

impl AutoVacuum {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(AutoVacuum::None),
            1 => Ok(AutoVacuum::Full),
            2 => Ok(AutoVacuum::Incremental),
            _ => Err(DatabaseError::InvalidHeader {
                reason: format!("invalid auto-vacuum mode: {}", value),
            }),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            AutoVacuum::None => 0,
            AutoVacuum::Full => 1,
            AutoVacuum::Incremental => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AutoVacuum::None => "none",
            AutoVacuum::Full => "full",
            AutoVacuum::Incremental => "incremental",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "none" => Ok(AutoVacuum::None),
            "full" => Ok(AutoVacuum::Full),
            "incremental" => Ok(AutoVacuum::Incremental),
            _ => Err(DatabaseError::Configuration {
                reason: format!("invalid auto-vacuum mode: {}", name),
            }),
        }
    }
}

/// Database header, persisted in the first bytes of page 0. Page 0 is never
/// encrypted, so the header stays self-describing enough to locate the
/// cipher salt.
#[derive(Debug, Clone, PartialEq)]
pub struct DbHeader {
    pub magic: [u8; 16],
    pub page_size: u16,
    pub file_format_write_version: u8,
    pub file_format_read_version: u8,
    /// Per-page tail bytes reserved for the cipher (0 = plaintext database).
    pub reserved_bytes: u8,
    /// Bytes of page 0 left plaintext for file-type sniffing. Page 0 is
    /// stored plaintext in full; the setting is validated and persisted so
    /// reopening with any compatible value succeeds.
    pub plaintext_header_size: u8,
    pub journal_mode: JournalMode,
    pub auto_vacuum: AutoVacuum,
    pub foreign_keys: bool,
    pub salt_present: bool,
    pub change_counter: u32,
    pub page_count: u64,
    pub freelist_head: PageId,
    pub freelist_count: u64,
    pub catalog_root: PageId,
    pub schema_version: u32,
    pub user_version: u32,
    pub cipher_salt: [u8; 16],
}

impl Default for DbHeader {
    fn default() -> Self {
        Self {
            magic: *LUMBUNG_MAGIC,
            page_size: PAGE_SIZE as u16,
            file_format_write_version: 1,
            file_format_read_version: 1,
            reserved_bytes: 0,
            plaintext_header_size: 0,
            journal_mode: JournalMode::Wal,
            auto_vacuum: AutoVacuum::None,
            foreign_keys: false,
            salt_present: false,
            change_counter: 1,
            page_count: 2, // header page + catalog root
            freelist_head: 0,
            freelist_count: 0,
            catalog_root: CATALOG_ROOT_PAGE_ID,
            schema_version: 1,
            user_version: 0,
            cipher_salt: [0; 16],
        }
    }
}

impl DbHeader {
    pub fn usable_page_size(&self) -> usize {
        PAGE_SIZE - self.reserved_bytes as usize
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(DB_HEADER_SIZE);

        buffer.extend_from_slice(&self.magic);
        buffer.extend_from_slice(&self.page_size.to_be_bytes());
        buffer.push(self.file_format_write_version);
        buffer.push(self.file_format_read_version);
        buffer.push(self.reserved_bytes);
        buffer.push(self.plaintext_header_size);
        buffer.push(self.journal_mode.as_u8());
        buffer.push(self.auto_vacuum.as_u8());
        buffer.push(if self.foreign_keys { 1 } else { 0 });
        buffer.push(if self.salt_present { 1 } else { 0 });
        buffer.extend_from_slice(&self.change_counter.to_be_bytes());
        buffer.extend_from_slice(&self.page_count.to_be_bytes());
        buffer.extend_from_slice(&self.freelist_head.to_be_bytes());
        buffer.extend_from_slice(&self.freelist_count.to_be_bytes());
        buffer.extend_from_slice(&self.catalog_root.to_be_bytes());
        buffer.extend_from_slice(&self.schema_version.to_be_bytes());
        buffer.extend_from_slice(&self.user_version.to_be_bytes());
        buffer.extend_from_slice(&self.cipher_salt);

        buffer.resize(DB_HEADER_SIZE, 0);
        buffer
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DB_HEADER_SIZE {
            return Err(DatabaseError::InvalidHeader {
                reason: "header too short".to_string(),
            });
        }

        let mut magic = [0u8; 16];
        magic.copy_from_slice(&bytes[0..16]);
        if &magic != LUMBUNG_MAGIC {
            return Err(DatabaseError::InvalidHeader {
                reason: "invalid Lumbung magic number".to_string(),
            });
        }

        let page_size = u16::from_be_bytes([bytes[16], bytes[17]]);
        if page_size != PAGE_SIZE as u16 {
            return Err(DatabaseError::InvalidHeader {
                reason: format!("unsupported page size: {}", page_size),
            });
        }

        let file_format_write_version = bytes[18];
        let file_format_read_version = bytes[19];
        if file_format_write_version > 1 || file_format_read_version > 1 {
            return Err(DatabaseError::UnsupportedFileFormat {
                version: file_format_write_version,
            });
        }

        let reserved_bytes = bytes[20];
        let plaintext_header_size = bytes[21];
        let journal_mode = JournalMode::from_u8(bytes[22])?;
        let auto_vacuum = AutoVacuum::from_u8(bytes[23])?;
        let foreign_keys = bytes[24] != 0;
        let salt_present = bytes[25] != 0;

        let change_counter = u32::from_be_bytes(bytes[26..30].try_into().expect("4-byte slice"));
        let page_count = u64::from_be_bytes(bytes[30..38].try_into().expect("8-byte slice"));
        let freelist_head = u64::from_be_bytes(bytes[38..46].try_into().expect("8-byte slice"));
        let freelist_count = u64::from_be_bytes(bytes[46..54].try_into().expect("8-byte slice"));
        let catalog_root = u64::from_be_bytes(bytes[54..62].try_into().expect("8-byte slice"));
        let schema_version = u32::from_be_bytes(bytes[62..66].try_into().expect("4-byte slice"));
        let user_version = u32::from_be_bytes(bytes[66..70].try_into().expect("4-byte slice"));
        let mut cipher_salt = [0u8; 16];
        cipher_salt.copy_from_slice(&bytes[70..86]);

        Ok(Self {
            magic,
            page_size,
            file_format_write_version,
            file_format_read_version,
            reserved_bytes,
            plaintext_header_size,
            journal_mode,
            auto_vacuum,
            foreign_keys,
            salt_present,
            change_counter,
            page_count,
            freelist_head,
            freelist_count,
            catalog_root,
            schema_version,
            user_version,
            cipher_salt,
        })
    }
}
