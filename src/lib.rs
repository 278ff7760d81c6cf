//! Embedded transactional storage engine: key-ordered trees over a
//! single database file, with write-ahead logging, snapshot-isolated
//! readers, an LRU page cache and optional authenticated page encryption.

pub mod engine;
pub mod storage;
pub mod types;
pub mod utils;

pub use engine::config::EngineConfig;
pub use engine::statement::{Bound, Operand, Operation, Statement, StepResult};
pub use engine::{Engine, InterruptHandle};
pub use storage::btree::DuplicatePolicy;
pub use types::error::{DatabaseError, Result};
pub use types::record::Record;
pub use types::value::{DataType, Value};
