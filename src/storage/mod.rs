pub mod btree;
pub mod cache;
pub mod cipher;
pub mod header;
pub mod pager;
pub mod txn;
pub mod wal;

pub const DB_HEADER_SIZE: usize = 100;
pub const LUMBUNG_MAGIC: &[u8; 16] = b"LUMBUNG DB v0.1\0";
