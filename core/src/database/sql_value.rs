//! Typed field values and their SQL literal rendering.
//!
//! Statements produced by this crate embed values as literal SQL text, there is no parameter
//! binding path. Text is escaped by doubling single quotes and nothing else, so field values must
//! come from a trusted source: anything beyond standard quoting is the caller's responsibility.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Timelike, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FormatError {
    #[error("{0} values have no SQL literal form")]
    UnsupportedType(&'static str),

    #[error("non-finite floating point value {0} has no SQL literal form")]
    NonFiniteFloat(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),

    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    I128(i128),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    U128(u128),
    F32(f32),
    F64(f64),
    Decimal(Decimal),

    String(String),
    Uuid(Uuid),

    DateTime(NaiveDateTime),
    /// Offset-aware timestamp. The offset is dropped when rendered, the wall-clock time is kept.
    DateTimeTz(DateTime<FixedOffset>),

    /// Binary payloads, rejected by the formatter.
    Bytes(Vec<u8>),

    /// Already rendered text emitted verbatim, the fallback for types the formatter does not
    /// know about. See [`SqlValue::display`].
    Raw(String),
}

impl SqlValue {
    /// Falls back to a type's `Display` output, written unquoted.
    pub fn display<T: fmt::Display + ?Sized>(value: &T) -> Self {
        SqlValue::Raw(value.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn raw_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "Null",
            SqlValue::Bool(_) => "Bool",
            SqlValue::I8(_) => "I8",
            SqlValue::I16(_) => "I16",
            SqlValue::I32(_) => "I32",
            SqlValue::I64(_) => "I64",
            SqlValue::I128(_) => "I128",
            SqlValue::U8(_) => "U8",
            SqlValue::U16(_) => "U16",
            SqlValue::U32(_) => "U32",
            SqlValue::U64(_) => "U64",
            SqlValue::U128(_) => "U128",
            SqlValue::F32(_) => "F32",
            SqlValue::F64(_) => "F64",
            SqlValue::Decimal(_) => "Decimal",
            SqlValue::String(_) => "String",
            SqlValue::Uuid(_) => "Uuid",
            SqlValue::DateTime(_) => "DateTime",
            SqlValue::DateTimeTz(_) => "DateTimeTz",
            SqlValue::Bytes(_) => "Bytes",
            SqlValue::Raw(_) => "Raw",
        }
    }

    /// Renders the value as a SQL literal.
    pub fn to_sql_literal(&self) -> Result<String, FormatError> {
        let literal = match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(value) => (if *value { "1" } else { "0" }).to_string(),

            SqlValue::I8(value) => value.to_string(),
            SqlValue::I16(value) => value.to_string(),
            SqlValue::I32(value) => value.to_string(),
            SqlValue::I64(value) => value.to_string(),
            SqlValue::I128(value) => value.to_string(),
            SqlValue::U8(value) => value.to_string(),
            SqlValue::U16(value) => value.to_string(),
            SqlValue::U32(value) => value.to_string(),
            SqlValue::U64(value) => value.to_string(),
            SqlValue::U128(value) => value.to_string(),
            SqlValue::F32(value) => format_float(f64::from(*value), value.to_string())?,
            SqlValue::F64(value) => format_float(*value, value.to_string())?,
            SqlValue::Decimal(value) => value.to_string(),

            SqlValue::String(value) => quote_text(value),
            SqlValue::Uuid(value) => format!("'{}'", value.hyphenated()),

            SqlValue::DateTime(value) => format_timestamp(value),
            SqlValue::DateTimeTz(value) => format_timestamp(&value.naive_local()),

            SqlValue::Bytes(_) => return Err(FormatError::UnsupportedType("Bytes")),
            SqlValue::Raw(value) => value.clone(),
        };

        Ok(literal)
    }
}

/// Formats a value for direct inclusion in a SQL statement.
pub fn format_value(value: &SqlValue) -> Result<String, FormatError> {
    value.to_sql_literal()
}

fn quote_text(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push('\'');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

fn format_float(value: f64, rendered: String) -> Result<String, FormatError> {
    if value.is_finite() {
        Ok(rendered)
    } else {
        Err(FormatError::NonFiniteFloat(value))
    }
}

fn format_timestamp(value: &NaiveDateTime) -> String {
    if value.nanosecond() == 0 {
        format!("'{}'", value.format("%Y-%m-%d %H:%M:%S"))
    } else {
        format!("'{}'", value.format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

macro_rules! impl_from_for_sql_value {
    ($($source:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$source> for SqlValue {
                fn from(value: $source) -> Self {
                    SqlValue::$variant(value)
                }
            }
        )*
    };
}

impl_from_for_sql_value!(
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    i128 => I128,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    u128 => U128,
    f32 => F32,
    f64 => F64,
    Decimal => Decimal,
    String => String,
    Uuid => Uuid,
    NaiveDateTime => DateTime,
    DateTime<FixedOffset> => DateTimeTz,
    Vec<u8> => Bytes,
);

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::String(value.to_string())
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        SqlValue::String(value.clone())
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::DateTimeTz(value.fixed_offset())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlValue::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use chrono::{NaiveDate, TimeZone};

    use super::*;

    fn literal(value: impl Into<SqlValue>) -> String {
        value.into().to_sql_literal().unwrap()
    }

    /// Reverses the quoting the way a SQL text parser reads a single-quoted literal.
    fn parse_quoted(literal: &str) -> String {
        let inner = &literal[1..literal.len() - 1];
        inner.replace("''", "'")
    }

    #[test]
    fn test_null_and_none_are_null_literal() {
        assert_eq!(literal(SqlValue::Null), "NULL");
        assert_eq!(literal(None::<String>), "NULL");
        assert_eq!(literal(None::<i32>), "NULL");
        assert_ne!(literal(None::<String>), "''");
    }

    #[test]
    fn test_booleans_are_numeric() {
        assert_eq!(literal(true), "1");
        assert_eq!(literal(false), "0");
    }

    #[test]
    fn test_text_doubles_single_quotes_only() {
        assert_eq!(literal("Entity1"), "'Entity1'");
        assert_eq!(literal("O'Brien"), "'O''Brien'");
        assert_eq!(literal("''"), "''''''");
        assert_eq!(literal("back\\slash \"dq\""), "'back\\slash \"dq\"'");
        assert_eq!(literal(""), "''");
    }

    #[test]
    fn test_text_escaping_round_trips() {
        for text in ["plain", "it's", "'leading", "trailing'", "a''b", "'; DROP TABLE x; --"] {
            assert_eq!(parse_quoted(&literal(text)), text);
        }
    }

    #[test]
    fn test_timestamps_drop_zero_fraction() {
        let value = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap().and_hms_opt(7, 5, 1).unwrap();
        assert_eq!(literal(value), "'2024-03-09 07:05:01'");

        let value =
            NaiveDate::from_ymd_opt(2024, 3, 9).unwrap().and_hms_milli_opt(7, 5, 1, 42).unwrap();
        assert_eq!(literal(value), "'2024-03-09 07:05:01.042'");
    }

    #[test]
    fn test_offset_timestamps_keep_wall_clock_time() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let value = offset.with_ymd_and_hms(2024, 12, 31, 23, 59, 58).unwrap();
        assert_eq!(literal(value), "'2024-12-31 23:59:58'");

        let utc = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(literal(utc), "'2024-01-02 03:04:05'");
    }

    #[test]
    fn test_uuid_is_quoted_hyphenated() {
        let id = Uuid::from_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        assert_eq!(literal(id), "'67e55044-10b1-426f-9247-bb680e5fe0c8'");
    }

    #[test]
    fn test_numbers_are_unquoted() {
        assert_eq!(literal(-12i32), "-12");
        assert_eq!(literal(u64::MAX), "18446744073709551615");
        assert_eq!(literal(i128::MIN), "-170141183460469231731687303715884105728");
        assert_eq!(literal(0.25f64), "0.25");
        assert_eq!(literal(1.5f32), "1.5");
        assert_eq!(literal(Decimal::from_str("12.50").unwrap()), "12.50");
    }

    #[test]
    fn test_non_finite_floats_are_rejected() {
        assert_eq!(
            SqlValue::F64(f64::NAN).to_sql_literal().unwrap_err().to_string(),
            "non-finite floating point value NaN has no SQL literal form"
        );
        assert!(SqlValue::F32(f32::INFINITY).to_sql_literal().is_err());
    }

    #[test]
    fn test_bytes_are_unsupported() {
        assert_eq!(
            SqlValue::Bytes(vec![1, 2]).to_sql_literal(),
            Err(FormatError::UnsupportedType("Bytes"))
        );
    }

    #[test]
    fn test_fallback_uses_display_unquoted() {
        struct Cents(u32);
        impl fmt::Display for Cents {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
            }
        }

        assert_eq!(literal(SqlValue::display(&Cents(1999))), "19.99");
        assert_eq!(literal(SqlValue::display("CURRENT_TIMESTAMP")), "CURRENT_TIMESTAMP");
    }
}
