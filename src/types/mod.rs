pub mod error;
pub mod page;
pub mod record;
pub mod value;

// Common type aliases
pub type PageId = u64;
pub type TxnId = u64;

// Page geometry
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_HEADER_SIZE: usize = 32; // Per-page header
pub const HEADER_PAGE_ID: PageId = 0; // Reserved database header page
pub const CATALOG_ROOT_PAGE_ID: PageId = 1; // Initial root of the catalog tree

pub const SLOT_DIRECTORY_ENTRY_SIZE: usize = 4; // offset (2 bytes) + length (2 bytes)

// Tail bytes reserved on every page of an encrypted database:
// a 12-byte IV followed by the 16-byte GCM tag.
pub const CIPHER_RESERVED_BYTES: usize = 28;
