//! Typed values over pool fields.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::{Access, Endianness, Format, RegisterConfig};
use crate::pool::{PoolError, RegisterPool};

/// A decoded register value as it appears in device state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Decimal(f64),
}

impl Value {
    /// Interpret a JSON command value. Numeric strings are accepted.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Value::Integer)
                .or_else(|| n.as_f64().map(Value::Decimal)),
            serde_json::Value::String(s) => {
                let s = s.trim();
                match s {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    _ => s
                        .parse::<i64>()
                        .map(Value::Integer)
                        .ok()
                        .or_else(|| s.parse::<f64>().ok().map(Value::Decimal)),
                }
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Integer(i) => *i as f64,
            Value::Decimal(d) => *d,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Decimal(d) => write!(f, "{}", d),
        }
    }
}

/// Peripheral errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PeripheralError {
    #[error("Register '{0}' is not readable")]
    NotReadable(String),
    #[error("Register '{0}' is not writable")]
    NotWritable(String),
    #[error("Invalid {format:?} value: {reason}")]
    InvalidValue { format: Format, reason: String },
    #[error("Value {value} is out of range for {format:?}")]
    OutOfRange { value: f64, format: Format },
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Register words as the big-endian byte stream they arrived as.
fn window_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

fn words_from_bytes(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]))
        .collect()
}

/// Decode `format.words()` registers. `None` if `words` is too short.
pub fn decode(format: Format, endianness: Endianness, words: &[u16]) -> Option<Value> {
    let words = words.get(..usize::from(format.words()))?;
    let bytes = window_bytes(words);
    let little = endianness == Endianness::Little;

    let two = |b: &[u8]| -> [u8; 2] { [b[0], b[1]] };
    let four = |b: &[u8]| -> [u8; 4] { [b[0], b[1], b[2], b[3]] };

    let value = match format {
        Format::Int8 => Value::Integer(i64::from(words[0] as u8 as i8)),
        Format::Uint8 => Value::Integer(i64::from(words[0] as u8)),
        Format::Int16 => Value::Integer(i64::from(if little {
            i16::from_le_bytes(two(&bytes))
        } else {
            i16::from_be_bytes(two(&bytes))
        })),
        Format::Uint16 => Value::Integer(i64::from(if little {
            u16::from_le_bytes(two(&bytes))
        } else {
            u16::from_be_bytes(two(&bytes))
        })),
        Format::Int32 => Value::Integer(i64::from(if little {
            i32::from_le_bytes(four(&bytes))
        } else {
            i32::from_be_bytes(four(&bytes))
        })),
        Format::Uint32 => Value::Integer(i64::from(if little {
            u32::from_le_bytes(four(&bytes))
        } else {
            u32::from_be_bytes(four(&bytes))
        })),
        Format::Bool => Value::Bool(words[0] != 0),
        Format::Decimal => {
            let raw = if little {
                i16::from_le_bytes(two(&bytes))
            } else {
                i16::from_be_bytes(two(&bytes))
            };
            Value::Decimal(f64::from(raw) / 10.0)
        }
    };

    Some(value)
}

/// Encode `value` into register words.
///
/// Integer formats truncate toward zero; decimals are rounded to one digit.
pub fn encode(format: Format, endianness: Endianness, value: Value) -> Result<Vec<u16>, PeripheralError> {
    if format == Format::Bool {
        let on = match value {
            Value::Bool(b) => b,
            other => other.as_f64() != 0.0,
        };
        return Ok(vec![u16::from(on)]);
    }

    let number = value.as_f64();
    if !number.is_finite() {
        return Err(PeripheralError::InvalidValue {
            format,
            reason: format!("{} is not a finite number", number),
        });
    }

    let scaled = match format {
        Format::Decimal => (number * 10.0).round(),
        _ => number.trunc(),
    };
    let (min, max) = match format {
        Format::Int8 => (f64::from(i8::MIN), f64::from(i8::MAX)),
        Format::Uint8 => (0.0, f64::from(u8::MAX)),
        Format::Int16 | Format::Decimal => (f64::from(i16::MIN), f64::from(i16::MAX)),
        Format::Uint16 => (0.0, f64::from(u16::MAX)),
        Format::Int32 => (f64::from(i32::MIN), f64::from(i32::MAX)),
        Format::Uint32 => (0.0, f64::from(u32::MAX)),
        Format::Bool => (0.0, 1.0),
    };
    if scaled < min || scaled > max {
        return Err(PeripheralError::OutOfRange { value: number, format });
    }

    let little = endianness == Endianness::Little;
    let bytes: Vec<u8> = match format {
        Format::Int8 => return Ok(vec![u16::from(scaled as i8 as u8)]),
        Format::Uint8 => return Ok(vec![u16::from(scaled as u8)]),
        Format::Int16 | Format::Decimal => {
            let raw = scaled as i16;
            if little { raw.to_le_bytes().to_vec() } else { raw.to_be_bytes().to_vec() }
        }
        Format::Uint16 | Format::Bool => {
            let raw = scaled as u16;
            if little { raw.to_le_bytes().to_vec() } else { raw.to_be_bytes().to_vec() }
        }
        Format::Int32 => {
            let raw = scaled as i32;
            if little { raw.to_le_bytes().to_vec() } else { raw.to_be_bytes().to_vec() }
        }
        Format::Uint32 => {
            let raw = scaled as u32;
            if little { raw.to_le_bytes().to_vec() } else { raw.to_be_bytes().to_vec() }
        }
    };

    Ok(words_from_bytes(&bytes))
}

/// One named, typed field of a [`RegisterPool`].
pub struct Peripheral {
    name: String,
    pool: Arc<RegisterPool>,
    field: u16,
    format: Format,
    endianness: Endianness,
    access: Access,
}

impl fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peripheral")
            .field("name", &self.name)
            .field("pool", &self.pool.name())
            .field("field", &self.field)
            .field("format", &self.format)
            .field("endianness", &self.endianness)
            .field("access", &self.access)
            .finish()
    }
}

impl Peripheral {
    /// Bind `register` to `field` of `pool`.
    pub fn new(register: &RegisterConfig, pool: Arc<RegisterPool>, field: u16) -> Self {
        Self {
            name: register.name.clone(),
            pool,
            field,
            format: register.format,
            endianness: register.endianness,
            access: register.access,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &Arc<RegisterPool> {
        &self.pool
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn readable(&self) -> bool {
        self.access.readable()
    }

    pub fn writable(&self) -> bool {
        self.access.writable()
    }

    pub fn available(&self) -> bool {
        self.pool.available()
    }

    /// Value decoded from the pool's last snapshot.
    pub fn get_current_value(&self) -> Option<Value> {
        let values = self.pool.values()?;
        let start = usize::from(self.field);
        decode(self.format, self.endianness, values.get(start..)?)
    }

    /// Refresh the pool and decode this field.
    pub async fn read(&self, priority: u32) -> Result<Option<Value>, PeripheralError> {
        if !self.readable() {
            return Err(PeripheralError::NotReadable(self.name.clone()));
        }

        trace!(register = %self.name, pool = %self.pool.name(), "Read");
        self.pool.refresh(priority).await?;
        Ok(self.get_current_value())
    }

    /// Encode and write `value`. Returns the value as stored, after truncation or rounding.
    pub async fn write(&self, value: Value, priority: u32) -> Result<Value, PeripheralError> {
        if !self.writable() {
            return Err(PeripheralError::NotWritable(self.name.clone()));
        }

        let words = encode(self.format, self.endianness, value)?;
        let stored = decode(self.format, self.endianness, &words).unwrap_or(value);
        self.pool.set(self.field, &words, priority).await?;
        debug!(register = %self.name, value = %stored, "Written");

        Ok(stored)
    }
}
