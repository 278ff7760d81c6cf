use serde::{Deserialize, Serialize};

use crate::types::error::{DatabaseError, Result};
use crate::types::value::Value;

/// A stored record: the ordered values of one row, excluding the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub values: Vec<Value>,
}

impl Record {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn get_value(&self, column_index: usize) -> Option<&Value> {
        self.values.get(column_index)
    }

    pub fn serialized_size(&self) -> usize {
        4 + self.values.iter().map(Value::serialized_size).sum::<usize>()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.serialized_size());
        buffer.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for value in &self.values {
            buffer.extend_from_slice(&value.to_bytes());
        }
        buffer
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(DatabaseError::SerializationError {
                details: "record too short for value count".to_string(),
            });
        }
        let value_count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let mut cursor = 4;
        let mut values = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            let (value, consumed) = Value::from_bytes(&bytes[cursor..])?;
            values.push(value);
            cursor += consumed;
        }
        Ok(Record { values })
    }
}
