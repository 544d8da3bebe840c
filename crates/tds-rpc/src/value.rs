//! SQL value representation.

use bytes::{BufMut, Bytes, BytesMut};

/// A SQL value that can represent any SQL Server data type.
///
/// This enum provides a type-safe way to handle parameter and return values
/// that may be of various types, including NULL. Temporal and decimal values
/// are carried structurally so the crate stays free of calendar/decimal
/// library choices made by higher layers.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL value.
    Null,
    /// Boolean value (BIT).
    Bit(bool),
    /// 8-bit unsigned integer (TINYINT).
    TinyInt(u8),
    /// 16-bit signed integer (SMALLINT).
    SmallInt(i16),
    /// 32-bit signed integer (INT).
    Int(i32),
    /// 64-bit signed integer (BIGINT).
    BigInt(i64),
    /// 32-bit floating point (REAL).
    Real(f32),
    /// 64-bit floating point (FLOAT).
    Float(f64),
    /// Decimal value (DECIMAL, NUMERIC, MONEY, SMALLMONEY).
    Decimal {
        /// Unscaled integer value; the logical value is `unscaled * 10^-scale`.
        unscaled: i128,
        /// Total number of significant digits.
        precision: u8,
        /// Digits to the right of the decimal point.
        scale: u8,
    },
    /// String value (CHAR, VARCHAR, NCHAR, NVARCHAR, TEXT, NTEXT).
    String(String),
    /// Binary value (BINARY, VARBINARY, IMAGE).
    Binary(Bytes),
    /// Date value (DATE): days since 0001-01-01.
    Date(i32),
    /// Time value (TIME): 100-nanosecond ticks since midnight plus scale.
    Time {
        /// 100ns ticks since midnight.
        ticks: u64,
        /// Fractional-second scale (0..=7).
        scale: u8,
    },
    /// DateTime2 value (DATETIME, DATETIME2, SMALLDATETIME).
    DateTime2 {
        /// Days since 0001-01-01.
        days: i32,
        /// 100ns ticks since midnight.
        ticks: u64,
        /// Fractional-second scale (0..=7).
        scale: u8,
    },
    /// UUID value (UNIQUEIDENTIFIER).
    Guid([u8; 16]),
    /// XML document (XML type).
    Xml(String),
    /// CLR user-defined type payload (UDT).
    ///
    /// The serialized representation stays opaque until a connection's UDT
    /// factory materializes it.
    Udt {
        /// Fully qualified user-defined type name, when known.
        type_name: String,
        /// The type's serialized representation.
        payload: Bytes,
    },
}

impl SqlValue {
    /// Check if the value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the value as a bool, if it is one.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bit(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the value as an i32, widening smaller integers.
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            Self::SmallInt(v) => Some(i32::from(*v)),
            Self::TinyInt(v) => Some(i32::from(*v)),
            _ => None,
        }
    }

    /// Get the value as an i64, widening smaller integers.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::BigInt(v) => Some(*v),
            Self::Int(v) => Some(i64::from(*v)),
            Self::SmallInt(v) => Some(i64::from(*v)),
            Self::TinyInt(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Get the value as a string slice, if it is character data.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            Self::Xml(v) => Some(v),
            _ => None,
        }
    }

    /// Get the value as bytes, if it is binary or an opaque UDT payload.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(v) => Some(v),
            Self::Udt { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Get the SQL type name as a string.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bit(_) => "BIT",
            Self::TinyInt(_) => "TINYINT",
            Self::SmallInt(_) => "SMALLINT",
            Self::Int(_) => "INT",
            Self::BigInt(_) => "BIGINT",
            Self::Real(_) => "REAL",
            Self::Float(_) => "FLOAT",
            Self::Decimal { .. } => "DECIMAL",
            Self::String(_) => "NVARCHAR",
            Self::Binary(_) => "VARBINARY",
            Self::Date(_) => "DATE",
            Self::Time { .. } => "TIME",
            Self::DateTime2 { .. } => "DATETIME2",
            Self::Guid(_) => "UNIQUEIDENTIFIER",
            Self::Xml(_) => "XML",
            Self::Udt { .. } => "UDT",
        }
    }

    /// Length of the value in its wire encoding, in bytes.
    ///
    /// Character data counts UTF-16 code units times two for Unicode types;
    /// callers dealing with ANSI types should use [`SqlValue::ansi_byte_len`].
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Null => 0,
            Self::Bit(_) | Self::TinyInt(_) => 1,
            Self::SmallInt(_) => 2,
            Self::Int(_) | Self::Real(_) | Self::Date(_) => 4,
            Self::BigInt(_) | Self::Float(_) | Self::Time { .. } => 8,
            Self::DateTime2 { .. } => 12,
            Self::Decimal { .. } => 17,
            Self::Guid(_) => 16,
            Self::String(s) | Self::Xml(s) => s.encode_utf16().count() * 2,
            Self::Binary(b) => b.len(),
            Self::Udt { payload, .. } => payload.len(),
        }
    }

    /// Length of the value when encoded as single-byte character data.
    ///
    /// Returns `None` for non-character values.
    #[must_use]
    pub fn ansi_byte_len(&self) -> Option<usize> {
        match self {
            Self::String(s) | Self::Xml(s) => Some(s.len()),
            _ => None,
        }
    }

    /// Normalized little-endian binary form of the value.
    ///
    /// This is the byte layout cell encryption operates on: fixed-size values
    /// little-endian, character data UTF-16LE, decimals as sign byte plus
    /// 16-byte magnitude.
    #[must_use]
    pub fn normalized_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len().max(1));
        match self {
            Self::Null => {}
            Self::Bit(v) => buf.put_u8(u8::from(*v)),
            Self::TinyInt(v) => buf.put_u8(*v),
            Self::SmallInt(v) => buf.put_i16_le(*v),
            Self::Int(v) => buf.put_i32_le(*v),
            Self::BigInt(v) => buf.put_i64_le(*v),
            Self::Real(v) => buf.put_f32_le(*v),
            Self::Float(v) => buf.put_f64_le(*v),
            Self::Decimal { unscaled, .. } => {
                buf.put_u8(u8::from(*unscaled >= 0));
                buf.put_slice(&unscaled.unsigned_abs().to_le_bytes());
            }
            Self::String(s) | Self::Xml(s) => {
                for unit in s.encode_utf16() {
                    buf.put_u16_le(unit);
                }
            }
            Self::Binary(b) => buf.put_slice(b),
            Self::Udt { payload, .. } => buf.put_slice(payload),
            Self::Date(days) => buf.put_i32_le(*days),
            Self::Time { ticks, .. } => buf.put_u64_le(*ticks),
            Self::DateTime2 { days, ticks, .. } => {
                buf.put_u64_le(*ticks);
                buf.put_i32_le(*days);
            }
            Self::Guid(g) => buf.put_slice(g),
        }
        buf.freeze()
    }
}

impl Default for SqlValue {
    fn default() -> Self {
        Self::Null
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bit(v)
    }
}

impl From<i16> for SqlValue {
    fn from(v: i16) -> Self {
        Self::SmallInt(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::BigInt(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<Bytes> for SqlValue {
    fn from(v: Bytes) -> Self {
        Self::Binary(v)
    }
}

impl<T> From<Option<T>> for SqlValue
where
    T: Into<SqlValue>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Self::Null,
        }
    }
}
