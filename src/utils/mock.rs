//! Test helpers: throwaway database files with automatic cleanup.

use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use tempfile::env::temp_dir;

use crate::engine::Engine;
use crate::engine::config::EngineConfig;
use crate::types::record::Record;
use crate::types::value::Value;

pub fn get_unix_timestamp_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_nanos()
}

pub fn create_temp_db_path() -> PathBuf {
    create_temp_db_path_with_prefix("lumbung_test")
}

pub fn create_temp_db_path_with_prefix(prefix: &str) -> PathBuf {
    let mut temp_path = temp_dir();
    temp_path.push(format!("{}_{}.db", prefix, get_unix_timestamp_nanos()));
    temp_path
}

pub fn create_test_record(key: i64) -> Record {
    Record::new(vec![Value::Text(format!("v{}", key))])
}

/// A database file under a temporary path, removed (together with its
/// log and lock siblings) on drop.
pub struct TempDatabase {
    pub path: PathBuf,
    pub engine: Option<Engine>,
}

impl TempDatabase {
    pub fn new() -> Self {
        Self {
            path: create_temp_db_path(),
            engine: None,
        }
    }

    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            path: create_temp_db_path_with_prefix(prefix),
            engine: None,
        }
    }

    pub fn create_engine(
        &mut self,
    ) -> Result<&mut Engine, Box<dyn std::error::Error>> {
        self.create_engine_with(EngineConfig::default())
    }

    pub fn create_engine_with(
        &mut self,
        config: EngineConfig,
    ) -> Result<&mut Engine, Box<dyn std::error::Error>> {
        let engine = Engine::open(&self.path, config)?;
        self.engine = Some(engine);
        Ok(self.engine.as_mut().expect("engine just set"))
    }

    /// A second connection to the same file, for cross-connection tests.
    pub fn open_second(
        &self,
        config: EngineConfig,
    ) -> Result<Engine, Box<dyn std::error::Error>> {
        Ok(Engine::open(&self.path, config)?)
    }

    pub fn close_engine(&mut self) {
        self.engine = None;
    }

    pub fn get_engine(&mut self) -> Option<&mut Engine> {
        self.engine.as_mut()
    }
}

impl Default for TempDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TempDatabase {
    fn drop(&mut self) {
        self.engine = None;
        for suffix in ["", "-wal", "-lock", "-ckpt"] {
            let mut name = self
                .path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_default();
            name.push(suffix);
            let sibling = self.path.with_file_name(name);
            if sibling.exists() {
                let _ = fs::remove_file(&sibling);
            }
        }
    }
}
