//! MySQL type system and value conversion.
//!
//! This module provides:
//! - MySQL field type codes and column flags
//! - Decoding of text and binary protocol row values into [`Value`]
//! - Calendar helpers shared by the temporal encoders and decoders
//! - String literal escaping for client-side parameter substitution
//!
//! # MySQL Type System
//!
//! Result set columns carry a field type code. In the text protocol every
//! value is a length-encoded string; in the binary protocol the encoding is
//! type-specific and may be fixed-width.

#![allow(clippy::cast_possible_truncation)]

use sqlwire_core::{Result, Value};

use crate::protocol::PacketReader;
use crate::protocol::charset;

/// MySQL field type codes.
///
/// These are the `MYSQL_TYPE_*` constants from the MySQL C API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type from a byte. Unknown codes decode as strings.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    #[must_use]
    pub const fn is_decimal(self) -> bool {
        matches!(self, FieldType::Decimal | FieldType::NewDecimal)
    }

    #[must_use]
    pub const fn is_string(self) -> bool {
        matches!(
            self,
            FieldType::VarChar
                | FieldType::VarString
                | FieldType::String
                | FieldType::Enum
                | FieldType::Set
        )
    }

    #[must_use]
    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
        )
    }

    /// Types whose values may be too large to keep a read buffer sized for.
    #[must_use]
    pub const fn is_large(self) -> bool {
        matches!(
            self,
            FieldType::Blob | FieldType::MediumBlob | FieldType::LongBlob | FieldType::Json
        )
    }

    #[must_use]
    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::NewDate
                | FieldType::Timestamp2
                | FieldType::DateTime2
                | FieldType::Time2
        )
    }

    /// Width of a fixed-size binary protocol value, `None` when the value is
    /// length-prefixed.
    #[must_use]
    pub const fn binary_fixed_size(self) -> Option<usize> {
        match self {
            FieldType::Tiny => Some(1),
            FieldType::Short | FieldType::Year => Some(2),
            FieldType::Long | FieldType::Int24 | FieldType::Float => Some(4),
            FieldType::LongLong | FieldType::Double => Some(8),
            FieldType::Null => Some(0),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal | FieldType::NewDecimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp | FieldType::Timestamp2 => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date | FieldType::NewDate => "DATE",
            FieldType::Time | FieldType::Time2 => "TIME",
            FieldType::DateTime | FieldType::DateTime2 => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::VarChar | FieldType::VarString => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::Json => "JSON",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
        }
    }
}

/// Column flags in result set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NO_DEFAULT_VALUE: u16 = 4096;
    pub const ON_UPDATE_NOW: u16 = 8192;
    pub const NUM: u16 = 32768;
}

/// How a column's raw bytes should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeHint {
    pub field_type: FieldType,
    pub unsigned: bool,
    /// Collation id; 63 marks binary data.
    pub charset: u16,
}

impl DecodeHint {
    fn is_binary(self) -> bool {
        self.charset == u16::from(charset::BINARY)
    }
}

pub const MICROS_PER_SECOND: i64 = 1_000_000;
pub const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SECOND;

/// Convert days since Unix epoch to (year, month, day).
///
/// Civil calendar algorithm from Howard Hinnant; day 0 is 1970-01-01.
pub fn days_to_ymd(days: i32) -> (i32, u32, u32) {
    let z = days + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i32 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Convert (year, month, day) to days since Unix epoch.
pub fn ymd_to_days(year: i32, month: u32, day: u32) -> i32 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = (y - era * 400) as u32;
    let mp = if month > 2 { month - 3 } else { month + 9 };
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i32 - 719_468
}

/// Split microseconds since epoch into days and microseconds of the day.
pub fn split_timestamp(micros: i64) -> (i32, i64) {
    let days = micros.div_euclid(MICROS_PER_DAY);
    (days as i32, micros.rem_euclid(MICROS_PER_DAY))
}

pub fn format_date(days: i32) -> String {
    let (y, m, d) = days_to_ymd(days);
    format!("{y:04}-{m:02}-{d:02}")
}

/// Format a signed duration as `[-]HH:MM:SS[.ffffff]`.
pub fn format_time(micros: i64, fractional: bool) -> String {
    let sign = if micros < 0 { "-" } else { "" };
    let abs = micros.unsigned_abs();
    let secs = abs / 1_000_000;
    let frac = abs % 1_000_000;
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if fractional && frac != 0 {
        format!("{sign}{h:02}:{m:02}:{s:02}.{frac:06}")
    } else {
        format!("{sign}{h:02}:{m:02}:{s:02}")
    }
}

pub fn format_datetime(micros: i64, fractional: bool) -> String {
    let (days, of_day) = split_timestamp(micros);
    format!("{} {}", format_date(days), format_time(of_day, fractional))
}

fn parse_fraction(text: &str) -> Option<i64> {
    if text.is_empty() || text.len() > 6 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let digits: i64 = text.parse().ok()?;
    Some(digits * 10_i64.pow(6 - text.len() as u32))
}

/// Parse `YYYY-MM-DD`. Zero dates are rejected.
pub fn parse_date(text: &str) -> Option<i32> {
    let mut parts = text.splitn(3, '-');
    let y: i32 = parts.next()?.parse().ok()?;
    let m: u32 = parts.next()?.parse().ok()?;
    let d: u32 = parts.next()?.parse().ok()?;
    if !(1..=12).contains(&m) || !(1..=31).contains(&d) {
        return None;
    }
    Some(ymd_to_days(y, m, d))
}

/// Parse `[-]H+:MM:SS[.ffffff]` into signed microseconds.
pub fn parse_time(text: &str) -> Option<i64> {
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (clock, frac) = match body.split_once('.') {
        Some((clock, frac)) => (clock, parse_fraction(frac)?),
        None => (body, 0),
    };
    let mut parts = clock.splitn(3, ':');
    let h: i64 = parts.next()?.parse().ok()?;
    let m: i64 = parts.next()?.parse().ok()?;
    let s: i64 = parts.next()?.parse().ok()?;
    if m > 59 || s > 59 {
        return None;
    }
    let micros = ((h * 60 + m) * 60 + s) * MICROS_PER_SECOND + frac;
    Some(if negative { -micros } else { micros })
}

/// Parse `YYYY-MM-DD[ HH:MM:SS[.ffffff]]` into microseconds since epoch.
pub fn parse_datetime(text: &str) -> Option<i64> {
    let (date, time) = match text.split_once([' ', 'T']) {
        Some((date, time)) => (date, Some(time)),
        None => (text, None),
    };
    let days = i64::from(parse_date(date)?);
    let of_day = match time {
        Some(t) => parse_time(t).filter(|v| (0..MICROS_PER_DAY).contains(v))?,
        None => 0,
    };
    Some(days * MICROS_PER_DAY + of_day)
}

fn or_text<T>(parsed: Option<T>, text: &str, wrap: impl FnOnce(T) -> Value) -> Value {
    parsed.map_or_else(|| Value::Text(text.to_string()), wrap)
}

/// Decode one text protocol value.
///
/// Values that fail to parse for their declared type come back as text so
/// no information is lost (zero dates, for example).
pub fn decode_text_value(hint: DecodeHint, data: &[u8]) -> Value {
    if hint.field_type.is_blob() || hint.field_type == FieldType::Bit {
        return if hint.is_binary() || hint.field_type == FieldType::Bit {
            Value::Bytes(data.to_vec())
        } else {
            Value::Text(String::from_utf8_lossy(data).into_owned())
        };
    }
    if hint.field_type.is_string() && hint.is_binary() {
        return Value::Bytes(data.to_vec());
    }

    let text = String::from_utf8_lossy(data);
    let text = text.as_ref();
    match (hint.field_type, hint.unsigned) {
        (FieldType::Tiny, false) => or_text(text.parse::<i8>().ok(), text, Value::TinyInt),
        (FieldType::Tiny, true) => or_text(text.parse::<u8>().ok(), text, Value::from),
        (FieldType::Short | FieldType::Year, false) => {
            or_text(text.parse::<i16>().ok(), text, Value::SmallInt)
        }
        (FieldType::Short | FieldType::Year, true) => {
            or_text(text.parse::<u16>().ok(), text, Value::from)
        }
        (FieldType::Long | FieldType::Int24, false) => {
            or_text(text.parse::<i32>().ok(), text, Value::Int)
        }
        (FieldType::Long | FieldType::Int24, true) => {
            or_text(text.parse::<u32>().ok(), text, Value::from)
        }
        (FieldType::LongLong, false) => or_text(text.parse::<i64>().ok(), text, Value::BigInt),
        (FieldType::LongLong, true) => {
            or_text(text.parse::<u64>().ok(), text, Value::UnsignedBigInt)
        }
        (FieldType::Float, _) => or_text(text.parse::<f32>().ok(), text, Value::Float),
        (FieldType::Double, _) => or_text(text.parse::<f64>().ok(), text, Value::Double),
        (FieldType::Decimal | FieldType::NewDecimal, _) => Value::Decimal(text.to_string()),
        (FieldType::Json, _) => or_text(serde_json::from_str(text).ok(), text, Value::Json),
        (FieldType::Date | FieldType::NewDate, _) => or_text(parse_date(text), text, Value::Date),
        (FieldType::Time | FieldType::Time2, _) => or_text(parse_time(text), text, Value::Time),
        (
            FieldType::DateTime
            | FieldType::DateTime2
            | FieldType::Timestamp
            | FieldType::Timestamp2,
            _,
        ) => or_text(parse_datetime(text), text, Value::Timestamp),
        (FieldType::Null, _) => Value::Null,
        _ => Value::Text(text.to_string()),
    }
}

/// Decode one binary protocol value at the reader's position.
pub fn decode_binary_value(hint: DecodeHint, reader: &mut PacketReader<'_>) -> Result<Value> {
    let value = match (hint.field_type, hint.unsigned) {
        (FieldType::Null, _) => Value::Null,
        (FieldType::Tiny, false) => Value::TinyInt(reader.read_u8()? as i8),
        (FieldType::Tiny, true) => Value::from(reader.read_u8()?),
        (FieldType::Short | FieldType::Year, false) => {
            Value::SmallInt(reader.read_u16_le()? as i16)
        }
        (FieldType::Short | FieldType::Year, true) => Value::from(reader.read_u16_le()?),
        (FieldType::Long | FieldType::Int24, false) => Value::Int(reader.read_u32_le()? as i32),
        (FieldType::Long | FieldType::Int24, true) => Value::from(reader.read_u32_le()?),
        (FieldType::LongLong, false) => Value::BigInt(reader.read_u64_le()? as i64),
        (FieldType::LongLong, true) => Value::UnsignedBigInt(reader.read_u64_le()?),
        (FieldType::Float, _) => Value::Float(reader.read_f32_le()?),
        (FieldType::Double, _) => Value::Double(reader.read_f64_le()?),
        (FieldType::Date | FieldType::NewDate, _) => decode_binary_date(reader)?,
        (
            FieldType::DateTime
            | FieldType::DateTime2
            | FieldType::Timestamp
            | FieldType::Timestamp2,
            _,
        ) => decode_binary_datetime(reader)?,
        (FieldType::Time | FieldType::Time2, _) => decode_binary_time(reader)?,
        _ => {
            let data = reader.read_lenenc_bytes()?;
            decode_text_value(hint, data)
        }
    };
    Ok(value)
}

fn decode_binary_date(reader: &mut PacketReader<'_>) -> Result<Value> {
    let len = reader.read_u8()? as usize;
    let mut body = PacketReader::new(reader.read_bytes(len)?);
    if len < 4 {
        return Ok(Value::Text("0000-00-00".to_string()));
    }
    let year = body.read_u16_le()?;
    let month = body.read_u8()?;
    let day = body.read_u8()?;
    Ok(match (month, day) {
        (1..=12, 1..=31) => Value::Date(ymd_to_days(
            i32::from(year),
            u32::from(month),
            u32::from(day),
        )),
        _ => Value::Text(format!("{year:04}-{month:02}-{day:02}")),
    })
}

fn decode_binary_datetime(reader: &mut PacketReader<'_>) -> Result<Value> {
    let len = reader.read_u8()? as usize;
    let mut body = PacketReader::new(reader.read_bytes(len)?);
    if len < 4 {
        return Ok(Value::Text("0000-00-00 00:00:00".to_string()));
    }
    let year = body.read_u16_le()?;
    let month = body.read_u8()?;
    let day = body.read_u8()?;
    let (hour, minute, second) = if len >= 7 {
        (body.read_u8()?, body.read_u8()?, body.read_u8()?)
    } else {
        (0, 0, 0)
    };
    let micros = if len >= 11 { body.read_u32_le()? } else { 0 };

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Ok(Value::Text(format!(
            "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
        )));
    }
    let days = i64::from(ymd_to_days(
        i32::from(year),
        u32::from(month),
        u32::from(day),
    ));
    let of_day = ((i64::from(hour) * 60 + i64::from(minute)) * 60 + i64::from(second))
        * MICROS_PER_SECOND
        + i64::from(micros);
    Ok(Value::Timestamp(days * MICROS_PER_DAY + of_day))
}

fn decode_binary_time(reader: &mut PacketReader<'_>) -> Result<Value> {
    let len = reader.read_u8()? as usize;
    let mut body = PacketReader::new(reader.read_bytes(len)?);
    if len < 8 {
        return Ok(Value::Time(0));
    }
    let negative = body.read_u8()? != 0;
    let days = i64::from(body.read_u32_le()?);
    let hours = i64::from(body.read_u8()?);
    let minutes = i64::from(body.read_u8()?);
    let seconds = i64::from(body.read_u8()?);
    let micros = if len >= 12 {
        i64::from(body.read_u32_le()?)
    } else {
        0
    };
    let total = (((days * 24 + hours) * 60 + minutes) * 60 + seconds) * MICROS_PER_SECOND + micros;
    Ok(Value::Time(if negative { -total } else { total }))
}

/// Escape a string for inclusion in a single-quoted SQL literal.
///
/// With `no_backslash_escapes` (server status `NO_BACKSLASH_ESCAPES`) only
/// quotes are doubled; otherwise backslash escapes are used.
pub fn escape_string(s: &str, no_backslash_escapes: bool) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    push_escaped(&mut out, s, no_backslash_escapes);
    out
}

/// Append `s` to `out` as the body of a single-quoted literal.
pub fn push_escaped(out: &mut String, s: &str, no_backslash_escapes: bool) {
    for c in s.chars() {
        match c {
            '\'' => out.push_str("''"),
            _ if no_backslash_escapes => out.push(c),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            _ => out.push(c),
        }
    }
}

/// Append `data` to `out` as a hex literal (`X'..'`).
pub fn push_hex_literal(out: &mut String, data: &[u8]) {
    use std::fmt::Write;
    out.push_str("X'");
    for b in data {
        let _ = write!(out, "{b:02X}");
    }
    out.push('\'');
}
