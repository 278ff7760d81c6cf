use thiserror::Error;

use crate::types::PageId;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Page is full (page_id: {page_id})")]
    PageFull { page_id: PageId },

    #[error("Invalid slot index {index} (max: {max})")]
    InvalidSlotIndex { index: usize, max: usize },

    #[error("Serialization/deserialization error: {details}")]
    SerializationError { details: String },

    #[error("Tree '{name}' not found")]
    TreeNotFound { name: String },

    #[error("Tree '{name}' already exists")]
    TreeExists { name: String },

    #[error("Corrupted page: page_id={page_id}, reason={reason}")]
    CorruptedPage { page_id: PageId, reason: String },

    #[error("Corrupted database: {reason}")]
    CorruptedDatabase { reason: String },

    #[error("Checksum mismatch on page {page_id}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        page_id: PageId,
        expected: u32,
        actual: u32,
    },

    #[error("Invalid page type: {0}")]
    InvalidPageType(u8),

    #[error("Invalid page size: expected {expected} bytes, got {actual} bytes")]
    InvalidPageSize { expected: usize, actual: usize },

    #[error("Invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("Unsupported file format version: {version}")]
    UnsupportedFileFormat { version: u8 },

    #[error("Database is busy (waited {waited_ms} ms)")]
    Busy { waited_ms: u64 },

    #[error("Cursor invalidated by a concurrent structural change")]
    CursorInvalidated,

    #[error("Operation interrupted")]
    Interrupted,

    #[error("Constraint violation: duplicate key {key} in tree '{tree}'")]
    DuplicateKey { tree: String, key: String },

    #[error("Cannot coerce {from} value to {to}: {detail}")]
    TypeCoercion {
        from: &'static str,
        to: &'static str,
        detail: String,
    },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Cipher error: {reason}")]
    Cipher { reason: String },

    #[error("API misuse: {reason}")]
    Misuse { reason: String },

    #[error("Transaction aborted: {reason}")]
    TransactionAborted { reason: String },

    #[error("Function '{name}' failed: {reason}")]
    FunctionFailure { name: String, reason: String },
}

impl DatabaseError {
    /// Storage-level faults abort the enclosing transaction and are
    /// surfaced verbatim.
    pub fn is_transaction_fatal(&self) -> bool {
        matches!(
            self,
            DatabaseError::Io(_)
                | DatabaseError::CorruptedPage { .. }
                | DatabaseError::CorruptedDatabase { .. }
                | DatabaseError::ChecksumMismatch { .. }
                | DatabaseError::InvalidPageType(_)
                | DatabaseError::InvalidPageSize { .. }
                | DatabaseError::Cipher { .. }
        )
    }

    /// Statement-level faults fail only the offending statement, leaving
    /// the transaction open for the caller to decide commit/rollback.
    pub fn is_statement_level(&self) -> bool {
        matches!(
            self,
            DatabaseError::DuplicateKey { .. }
                | DatabaseError::TypeCoercion { .. }
                | DatabaseError::FunctionFailure { .. }
                | DatabaseError::Interrupted
        )
    }
}

pub type Result<T> = std::result::Result<T, DatabaseError>;
