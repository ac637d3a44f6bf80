//! Versioned, self-describing byte format of the intermediate aggregation states
//!
//! Every encoded state starts with a [`WireTag`] byte. Fixed width payloads are big
//! endian, sketches carry a version byte followed by their parameters and a length
//! prefixed body. The format is stable across nodes: decoders of future versions must
//! keep reading [`WIRE_VERSION`] `1`.
//!
//! | Tag                  | Payload                                              |
//! |----------------------|------------------------------------------------------|
//! | `NULL` 0x00          | empty                                                |
//! | `LONG` 0x01          | i64                                                  |
//! | `FLOAT` 0x02         | f32                                                  |
//! | `DOUBLE` 0x03        | f64                                                  |
//! | `DECIMAL` 0x04       | 16 bytes of the decimal                              |
//! | `STRING` 0x05        | u32 length + utf8                                    |
//! | `HYPER_UNIQUE` 0x10  | version + log2m + registers                          |
//! | `HISTOGRAM` 0x11     | version + resolution + count + min + max + bins      |
//! | `COUNT_MIN` 0x12     | version + width + depth + total + counters           |
//! | `RANGE` 0x13         | f64 min + f64 max                                    |
//! | `LONG_PAIR` 0x14     | i64 timestamp + presence byte + i64                  |
//! | `DOUBLE_PAIR` 0x15   | i64 timestamp + presence byte + f64                  |

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rust_decimal::Decimal;
use snafu::{ResultExt, Snafu, ensure};

use crate::sketch::count_min::CountMinSketch;
use crate::sketch::histogram::ApproximateHistogram;
use crate::sketch::hll::HyperLogLog;
use crate::value::{ComplexValue, RangeState, TimestampedValue, Value, ValueType};

/// Version of the sketch payloads
pub const WIRE_VERSION: u8 = 1;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum WireError {
    #[snafu(display(
        "Truncated wire bytes: need `{needed}` bytes at offset `{offset}`, only `{remaining}` remaining"
    ))]
    Truncated {
        needed: usize,
        offset: usize,
        remaining: usize,
    },
    #[snafu(display("Unknown wire tag `{tag:#04x}`"))]
    UnknownTag { tag: u8 },
    #[snafu(display("Unsupported wire version `{version}`, expect `{WIRE_VERSION}`"))]
    UnsupportedVersion { version: u8 },
    #[snafu(display("Value of type `{value_type}` has no wire representation"))]
    Unsupported { value_type: ValueType },
    #[snafu(display("Found `{trailing}` trailing bytes after the encoded value"))]
    TrailingBytes { trailing: usize },
    #[snafu(display("Corrupted wire bytes: {reason}"))]
    Corrupted { reason: String },
    #[snafu(display("Invalid base64 string"))]
    Base64 { source: base64::DecodeError },
}

type Result<T> = std::result::Result<T, WireError>;

/// Tag that leads the encoded value
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireTag {
    Null = 0x00,
    Long = 0x01,
    Float = 0x02,
    Double = 0x03,
    Decimal = 0x04,
    String = 0x05,
    HyperUnique = 0x10,
    Histogram = 0x11,
    CountMin = 0x12,
    Range = 0x13,
    LongPair = 0x14,
    DoublePair = 0x15,
}

impl TryFrom<u8> for WireTag {
    type Error = WireError;

    fn try_from(tag: u8) -> Result<Self> {
        Ok(match tag {
            0x00 => Self::Null,
            0x01 => Self::Long,
            0x02 => Self::Float,
            0x03 => Self::Double,
            0x04 => Self::Decimal,
            0x05 => Self::String,
            0x10 => Self::HyperUnique,
            0x11 => Self::Histogram,
            0x12 => Self::CountMin,
            0x13 => Self::Range,
            0x14 => Self::LongPair,
            0x15 => Self::DoublePair,
            _ => return UnknownTagSnafu { tag }.fail(),
        })
    }
}

/// Append only big endian writer
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Create a writer with the capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Write a byte
    #[inline]
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Write the u32
    #[inline]
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Write the u64
    #[inline]
    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Write the i64
    #[inline]
    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Write the f32
    #[inline]
    pub fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Write the f64
    #[inline]
    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Write raw bytes without length prefix
    #[inline]
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write bytes with the u32 length prefix
    #[inline]
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.put_slice(bytes);
    }

    /// Consume the writer
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds checked big endian reader
#[derive(Debug)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

macro_rules! impl_get {
    ($($func:ident => $ty:ty),+) => {
        $(
            #[doc = concat!("Read the `", stringify!($ty), "`")]
            #[inline]
            pub fn $func(&mut self) -> Result<$ty> {
                let bytes = self.take(std::mem::size_of::<$ty>())?;
                let mut array = [0; std::mem::size_of::<$ty>()];
                array.copy_from_slice(bytes);
                Ok(<$ty>::from_be_bytes(array))
            }
        )+
    };
}

impl<'a> ByteReader<'a> {
    /// Create a reader over the bytes
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// Take next `len` bytes
    #[inline]
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let remaining = self.remaining();
        ensure!(
            len <= remaining,
            TruncatedSnafu {
                needed: len,
                offset: self.offset,
                remaining
            }
        );
        let bytes = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    /// Read bytes with the u32 length prefix
    #[inline]
    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    impl_get!(get_u8 => u8, get_u32 => u32, get_u64 => u64, get_i64 => i64, get_f32 => f32, get_f64 => f64);

    /// Read the version byte and check it
    pub fn expect_version(&mut self) -> Result<()> {
        let version = self.get_u8()?;
        ensure!(
            version == WIRE_VERSION,
            UnsupportedVersionSnafu { version }
        );
        Ok(())
    }

    /// Number of the unread bytes
    #[inline]
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    /// Check all of the bytes are consumed
    pub fn finish(&self) -> Result<()> {
        let trailing = self.remaining();
        ensure!(trailing == 0, TrailingBytesSnafu { trailing });
        Ok(())
    }
}

/// Encode the value into its wire representation
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut writer = ByteWriter::with_capacity(17);
    match value {
        Value::Null => writer.put_u8(WireTag::Null as u8),
        Value::Long(v) => {
            writer.put_u8(WireTag::Long as u8);
            writer.put_i64(*v);
        }
        Value::Float(v) => {
            writer.put_u8(WireTag::Float as u8);
            writer.put_f32(*v);
        }
        Value::Double(v) => {
            writer.put_u8(WireTag::Double as u8);
            writer.put_f64(*v);
        }
        Value::Decimal(v) => {
            writer.put_u8(WireTag::Decimal as u8);
            writer.put_slice(&v.serialize());
        }
        Value::String(v) => {
            writer.put_u8(WireTag::String as u8);
            writer.put_bytes(v.as_bytes());
        }
        Value::Complex(complex) => match complex {
            ComplexValue::HyperUnique(hll) => {
                writer.put_u8(WireTag::HyperUnique as u8);
                hll.write_to(&mut writer);
            }
            ComplexValue::Histogram(histogram) => {
                writer.put_u8(WireTag::Histogram as u8);
                histogram.write_to(&mut writer);
            }
            ComplexValue::CountMin(sketch) => {
                writer.put_u8(WireTag::CountMin as u8);
                sketch.write_to(&mut writer);
            }
            ComplexValue::Range(range) => {
                writer.put_u8(WireTag::Range as u8);
                writer.put_f64(range.min);
                writer.put_f64(range.max);
            }
            ComplexValue::LongPair(pair) => {
                writer.put_u8(WireTag::LongPair as u8);
                writer.put_i64(pair.timestamp);
                writer.put_u8(pair.value.is_some() as u8);
                writer.put_i64(pair.value.unwrap_or_default());
            }
            ComplexValue::DoublePair(pair) => {
                writer.put_u8(WireTag::DoublePair as u8);
                writer.put_i64(pair.timestamp);
                writer.put_u8(pair.value.is_some() as u8);
                writer.put_f64(pair.value.unwrap_or_default());
            }
        },
        Value::Bytes(_) | Value::Array(_) => {
            return UnsupportedSnafu {
                value_type: value.value_type().unwrap_or(ValueType::Bytes),
            }
            .fail();
        }
    }
    Ok(writer.finish())
}

/// Decode the value from its wire representation
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let mut reader = ByteReader::new(bytes);
    let tag = WireTag::try_from(reader.get_u8()?)?;
    let value = match tag {
        WireTag::Null => Value::Null,
        WireTag::Long => Value::Long(reader.get_i64()?),
        WireTag::Float => Value::Float(reader.get_f32()?),
        WireTag::Double => Value::Double(reader.get_f64()?),
        WireTag::Decimal => {
            let mut array = [0; 16];
            array.copy_from_slice(reader.take(16)?);
            Value::Decimal(Decimal::deserialize(array))
        }
        WireTag::String => {
            let bytes = reader.get_bytes()?;
            let s = std::str::from_utf8(bytes).map_err(|e| WireError::Corrupted {
                reason: e.to_string(),
            })?;
            Value::String(s.to_string())
        }
        WireTag::HyperUnique => Value::Complex(ComplexValue::HyperUnique(Box::new(
            HyperLogLog::read_from(&mut reader)?,
        ))),
        WireTag::Histogram => Value::Complex(ComplexValue::Histogram(Box::new(
            ApproximateHistogram::read_from(&mut reader)?,
        ))),
        WireTag::CountMin => Value::Complex(ComplexValue::CountMin(Box::new(
            CountMinSketch::read_from(&mut reader)?,
        ))),
        WireTag::Range => Value::Complex(ComplexValue::Range(RangeState {
            min: reader.get_f64()?,
            max: reader.get_f64()?,
        })),
        WireTag::LongPair => {
            let timestamp = reader.get_i64()?;
            let present = reader.get_u8()? != 0;
            let value = reader.get_i64()?;
            Value::Complex(ComplexValue::LongPair(TimestampedValue {
                timestamp,
                value: present.then_some(value),
            }))
        }
        WireTag::DoublePair => {
            let timestamp = reader.get_i64()?;
            let present = reader.get_u8()? != 0;
            let value = reader.get_f64()?;
            Value::Complex(ComplexValue::DoublePair(TimestampedValue {
                timestamp,
                value: present.then_some(value),
            }))
        }
    };
    reader.finish()?;
    Ok(value)
}

/// Base64 encode the bytes
#[inline]
pub fn base64_encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode the base64 string into bytes
#[inline]
pub fn base64_decode(s: &str) -> Result<Vec<u8>> {
    STANDARD.decode(s.trim()).context(Base64Snafu)
}

/// Decode the base64 string of the wire bytes into value
pub fn decode_base64(s: &str) -> Result<Value> {
    decode(&base64_decode(s)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_layout() {
        expect_test::expect![[r#"
            [
                1,
                0,
                0,
                0,
                0,
                0,
                0,
                1,
                2,
            ]
        "#]]
        .assert_debug_eq(&encode(&Value::Long(258)).unwrap());
    }

    #[test]
    fn test_pair_and_range() {
        let values = [
            Value::Complex(ComplexValue::LongPair(TimestampedValue {
                timestamp: 10,
                value: None,
            })),
            Value::Complex(ComplexValue::DoublePair(TimestampedValue {
                timestamp: -3,
                value: Some(1.5),
            })),
            Value::Complex(ComplexValue::Range(RangeState::EMPTY)),
            Value::Decimal(Decimal::new(-12345, 3)),
            Value::from("héllo"),
        ];
        for value in values {
            let bytes = encode(&value).unwrap();
            assert_eq!(decode(&bytes).unwrap(), value);
            assert_eq!(decode_base64(&base64_encode(&bytes)).unwrap(), value);
        }
    }

    #[test]
    fn test_decode_errors() {
        expect_test::expect!["Unknown wire tag `0x7f`"]
            .assert_eq(&decode(&[0x7f]).unwrap_err().to_string());
        expect_test::expect![
            "Truncated wire bytes: need `8` bytes at offset `1`, only `3` remaining"
        ]
        .assert_eq(&decode(&[0x01, 0, 0, 0]).unwrap_err().to_string());
        expect_test::expect!["Found `1` trailing bytes after the encoded value"]
            .assert_eq(&decode(&[0x00, 0]).unwrap_err().to_string());
        assert!(decode_base64("not base64!").is_err());
        assert!(encode(&Value::Bytes(vec![1])).is_err());
    }
}
