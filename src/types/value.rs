use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::error::{DatabaseError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Null,
    Integer,
    Real,
    Text,
    Blob,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Null => "null",
            DataType::Integer => "integer",
            DataType::Real => "real",
            DataType::Text => "text",
            DataType::Blob => "blob",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "null" => Ok(DataType::Null),
            "integer" => Ok(DataType::Integer),
            "real" => Ok(DataType::Real),
            "text" => Ok(DataType::Text),
            "blob" => Ok(DataType::Blob),
            _ => Err(DatabaseError::CorruptedDatabase {
                reason: format!("unknown data type name: {}", name),
            }),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The only types storable in a record. Numeric coercions follow the fixed
/// rules in [`Value::coerce`]; every source/target pair is enumerated there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null => DataType::Null,
            Value::Integer(_) => DataType::Integer,
            Value::Real(_) => DataType::Real,
            Value::Text(_) => DataType::Text,
            Value::Blob(_) => DataType::Blob,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Deterministic text rendering. Reals always carry a decimal point or
    /// an exponent so they survive a text round-trip as reals.
    pub fn render_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Integer(i) => i.to_string(),
            Value::Real(r) => format_real(*r),
            Value::Text(s) => s.clone(),
            Value::Blob(b) => b.iter().map(|byte| format!("{:02x}", byte)).collect(),
        }
    }

    /// Coerce this value to `target`. The full rule table:
    ///
    /// - Null -> anything: stays Null.
    /// - Integer -> Real: exact widening. Integer -> Text: decimal string.
    /// - Real -> Integer: truncates toward zero; fails if out of i64 range
    ///   or not finite. Real -> Text: deterministic formatting.
    /// - Text -> Integer/Real: parses a leading numeric prefix; fails when
    ///   no digits lead the string. Text -> Blob: the UTF-8 bytes.
    /// - Blob -> Text: fails unless valid UTF-8. Blob -> Integer/Real: fails.
    /// - Any type -> its own type: identity.
    pub fn coerce(&self, target: DataType) -> Result<Value> {
        if self.is_null() || target == DataType::Null || self.data_type() == target {
            return Ok(self.clone());
        }
        match (self, target) {
            (Value::Integer(i), DataType::Real) => Ok(Value::Real(*i as f64)),
            (Value::Integer(i), DataType::Text) => Ok(Value::Text(i.to_string())),
            (Value::Real(r), DataType::Integer) => {
                if !r.is_finite() || *r >= 9.223_372_036_854_776e18 || *r < -9.223_372_036_854_776e18
                {
                    return Err(self.coercion_error(target, "out of integer range"));
                }
                Ok(Value::Integer(r.trunc() as i64))
            }
            (Value::Real(r), DataType::Text) => Ok(Value::Text(format_real(*r))),
            (Value::Text(s), DataType::Integer) => parse_integer_prefix(s)
                .map(Value::Integer)
                .ok_or_else(|| self.coercion_error(target, "no leading integer")),
            (Value::Text(s), DataType::Real) => parse_real_prefix(s)
                .map(Value::Real)
                .ok_or_else(|| self.coercion_error(target, "no leading number")),
            (Value::Text(s), DataType::Blob) => Ok(Value::Blob(s.as_bytes().to_vec())),
            (Value::Blob(b), DataType::Text) => match String::from_utf8(b.clone()) {
                Ok(s) => Ok(Value::Text(s)),
                Err(_) => Err(self.coercion_error(target, "blob is not valid UTF-8")),
            },
            (_, target) => Err(self.coercion_error(target, "no conversion rule")),
        }
    }

    fn coercion_error(&self, target: DataType, detail: &str) -> DatabaseError {
        DatabaseError::TypeCoercion {
            from: self.data_type().name(),
            to: target.name(),
            detail: detail.to_string(),
        }
    }

    /// Total, stable key ordering: Null sorts first, then numerics compared
    /// numerically across Integer/Real, then Text by byte sequence, then
    /// Blob by byte sequence.
    pub fn key_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Integer(_) | Value::Real(_) => 1,
                Value::Text(_) => 2,
                Value::Blob(_) => 3,
            }
        }
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Integer(a), Value::Real(b)) => (*a as f64).total_cmp(b),
            (Value::Real(a), Value::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Value::Real(a), Value::Real(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            _ => rank(self).cmp(&rank(other)),
        }
    }

    pub fn serialized_size(&self) -> usize {
        match self {
            Value::Null => 1,
            Value::Integer(_) | Value::Real(_) => 1 + 8,
            Value::Text(s) => 1 + 4 + s.len(),
            Value::Blob(b) => 1 + 4 + b.len(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.serialized_size());
        match self {
            Value::Null => buffer.push(0),
            Value::Integer(i) => {
                buffer.push(1);
                buffer.extend_from_slice(&i.to_le_bytes());
            }
            Value::Real(r) => {
                buffer.push(2);
                buffer.extend_from_slice(&r.to_le_bytes());
            }
            Value::Text(s) => {
                buffer.push(3);
                buffer.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buffer.extend_from_slice(s.as_bytes());
            }
            Value::Blob(b) => {
                buffer.push(4);
                buffer.extend_from_slice(&(b.len() as u32).to_le_bytes());
                buffer.extend_from_slice(b);
            }
        }
        buffer
    }

    /// Deserialize one value, returning it together with the number of
    /// bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Value, usize)> {
        if bytes.is_empty() {
            return Err(DatabaseError::SerializationError {
                details: "empty value bytes".to_string(),
            });
        }
        match bytes[0] {
            0 => Ok((Value::Null, 1)),
            1 => {
                let raw = fixed8(bytes, 1)?;
                Ok((Value::Integer(i64::from_le_bytes(raw)), 9))
            }
            2 => {
                let raw = fixed8(bytes, 1)?;
                Ok((Value::Real(f64::from_le_bytes(raw)), 9))
            }
            3 => {
                let (payload, consumed) = length_prefixed(bytes)?;
                let text = String::from_utf8(payload.to_vec()).map_err(|_| {
                    DatabaseError::SerializationError {
                        details: "invalid UTF-8 in text value".to_string(),
                    }
                })?;
                Ok((Value::Text(text), consumed))
            }
            4 => {
                let (payload, consumed) = length_prefixed(bytes)?;
                Ok((Value::Blob(payload.to_vec()), consumed))
            }
            tag => Err(DatabaseError::SerializationError {
                details: format!("unknown value tag: {}", tag),
            }),
        }
    }
}

fn fixed8(bytes: &[u8], offset: usize) -> Result<[u8; 8]> {
    if bytes.len() < offset + 8 {
        return Err(DatabaseError::SerializationError {
            details: "truncated 8-byte value payload".to_string(),
        });
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    Ok(raw)
}

fn length_prefixed(bytes: &[u8]) -> Result<(&[u8], usize)> {
    if bytes.len() < 5 {
        return Err(DatabaseError::SerializationError {
            details: "truncated value length".to_string(),
        });
    }
    let len = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    if bytes.len() < 5 + len {
        return Err(DatabaseError::SerializationError {
            details: format!("value payload truncated: need {}, have {}", len, bytes.len() - 5),
        });
    }
    Ok((&bytes[5..5 + len], 5 + len))
}

/// Fixed real formatting: shortest round-trip rendering, forced to carry a
/// decimal point or exponent.
fn format_real(r: f64) -> String {
    if r.is_nan() {
        return "nan".to_string();
    }
    if r.is_infinite() {
        return if r > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let mut s = format!("{}", r);
    if !s.contains('.') && !s.contains('e') && !s.contains('E') {
        s.push_str(".0");
    }
    s
}

/// Parse the longest leading integer prefix, e.g. "42abc" -> 42.
/// Returns None when no digit follows the optional sign.
fn parse_integer_prefix(s: &str) -> Option<i64> {
    let trimmed = s.trim_start();
    let bytes = trimmed.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits_start {
        return None;
    }
    trimmed[..end].parse().ok()
}

/// Parse the longest leading numeric prefix as a real, accepting an
/// optional fraction and exponent.
fn parse_real_prefix(s: &str) -> Option<f64> {
    let trimmed = s.trim_start();
    let bytes = trimmed.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if end == digits_start || (end == digits_start + 1 && bytes[digits_start] == b'.') {
        return None;
    }
    // Optional exponent, only kept if complete
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && matches!(bytes[exp_end], b'+' | b'-') {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }
    trimmed[..end].parse().ok()
}
