//! Value encoders for statement parameters.
//!
//! An encoder turns one [`Value`] into either the binary protocol form used
//! by `COM_STMT_EXECUTE` or a SQL literal for client-side substitution. The
//! [`EncoderRegistry`] picks the encoder from the value's runtime kind.

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use sqlwire_core::error::{TypeError, UsageErrorKind};
use sqlwire_core::{Error, PropertyKey, PropertySet, Result, Value, ValueKind};

use crate::protocol::PacketWriter;
use crate::server_session::ServerSession;
use crate::types::{
    FieldType, MICROS_PER_SECOND, days_to_ymd, format_date, format_datetime, format_time,
    push_escaped, push_hex_literal, split_timestamp,
};

/// Connection-wide settings that affect how values are encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingOptions {
    /// Send microseconds of temporal values (`sendFractionalSeconds`)
    pub send_fractional_seconds: bool,
    /// Largest single parameter the server accepts
    pub max_allowed_packet: usize,
    /// Server runs with `NO_BACKSLASH_ESCAPES`
    pub no_backslash_escapes: bool,
}

impl Default for EncodingOptions {
    fn default() -> Self {
        Self::from_properties(&PropertySet::new())
    }
}

impl EncodingOptions {
    pub fn from_properties(properties: &PropertySet) -> Self {
        Self {
            send_fractional_seconds: properties.get_bool(PropertyKey::SendFractionalSeconds),
            max_allowed_packet: usize::try_from(properties.get_int(PropertyKey::MaxAllowedPacket))
                .unwrap_or(usize::MAX),
            no_backslash_escapes: false,
        }
    }

    /// Refine with what the server reported.
    pub fn with_server(mut self, session: &ServerSession) -> Self {
        if let Some(max) = session
            .max_allowed_packet()
            .and_then(|v| usize::try_from(v).ok())
        {
            self.max_allowed_packet = max;
        }
        self.no_backslash_escapes = session.no_backslash_escapes();
        self
    }
}

/// Everything an encoder may look at for one parameter.
#[derive(Debug, Clone, Copy)]
pub struct EncodeContext<'a> {
    pub value: &'a Value,
    /// Declared SQL type, if the caller gave one
    pub target_type: Option<FieldType>,
    /// Decimal scale, text length in chars, or byte length
    pub scale_or_length: Option<u32>,
    pub options: &'a EncodingOptions,
}

/// Serializes values of one or more kinds.
pub trait ValueEncoder: fmt::Debug + Send + Sync {
    /// Wire type announced in the execute packet.
    fn field_type(&self, ctx: &EncodeContext<'_>) -> FieldType;

    fn is_unsigned(&self, _ctx: &EncodeContext<'_>) -> bool {
        false
    }

    /// Append the binary protocol form.
    fn encode_bytes(&self, ctx: &EncodeContext<'_>, out: &mut PacketWriter) -> Result<()>;

    /// Append the SQL literal form.
    fn encode_text(&self, ctx: &EncodeContext<'_>, out: &mut String) -> Result<()>;

    /// Length in bytes of the SQL literal form.
    fn text_length(&self, ctx: &EncodeContext<'_>) -> Result<usize> {
        let mut text = String::new();
        self.encode_text(ctx, &mut text)?;
        Ok(text.len())
    }
}

/// Maps value kinds to encoders.
#[derive(Clone)]
pub struct EncoderRegistry {
    encoders: HashMap<ValueKind, Arc<dyn ValueEncoder>>,
}

impl fmt::Debug for EncoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.encoders.keys().collect();
        kinds.sort();
        f.debug_struct("EncoderRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

impl Default for EncoderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl EncoderRegistry {
    /// A registry with no encoders.
    pub fn empty() -> Self {
        Self {
            encoders: HashMap::new(),
        }
    }

    /// A registry covering every [`ValueKind`].
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        let integer: Arc<dyn ValueEncoder> = Arc::new(IntegerEncoder);
        registry.register(ValueKind::Null, Arc::new(NullEncoder));
        registry.register(ValueKind::Bool, Arc::new(BoolEncoder));
        for kind in [
            ValueKind::TinyInt,
            ValueKind::SmallInt,
            ValueKind::Int,
            ValueKind::BigInt,
            ValueKind::UnsignedBigInt,
        ] {
            registry.register(kind, Arc::clone(&integer));
        }
        let float: Arc<dyn ValueEncoder> = Arc::new(FloatEncoder);
        registry.register(ValueKind::Float, Arc::clone(&float));
        registry.register(ValueKind::Double, float);
        registry.register(ValueKind::Decimal, Arc::new(DecimalEncoder));
        registry.register(ValueKind::Text, Arc::new(TextEncoder));
        registry.register(ValueKind::Bytes, Arc::new(BytesEncoder));
        let temporal: Arc<dyn ValueEncoder> = Arc::new(TemporalEncoder);
        registry.register(ValueKind::Date, Arc::clone(&temporal));
        registry.register(ValueKind::Time, Arc::clone(&temporal));
        registry.register(ValueKind::Timestamp, temporal);
        registry.register(ValueKind::Json, Arc::new(JsonEncoder));
        registry
    }

    /// Install `encoder` for `kind`, returning the one it replaces.
    pub fn register(
        &mut self,
        kind: ValueKind,
        encoder: Arc<dyn ValueEncoder>,
    ) -> Option<Arc<dyn ValueEncoder>> {
        self.encoders.insert(kind, encoder)
    }

    pub fn unregister(&mut self, kind: ValueKind) -> Option<Arc<dyn ValueEncoder>> {
        self.encoders.remove(&kind)
    }

    pub fn encoder_for(&self, kind: ValueKind) -> Option<Arc<dyn ValueEncoder>> {
        self.encoders.get(&kind).cloned()
    }

    /// Encoder for `value`, or a usage error when its kind is not registered.
    pub fn resolve(&self, value: &Value) -> Result<Arc<dyn ValueEncoder>> {
        self.encoder_for(value.kind()).ok_or_else(|| {
            Error::usage(
                UsageErrorKind::NoEncoder,
                format!(
                    "No encoder registered for values of type {}",
                    value.type_name()
                ),
            )
        })
    }
}

fn mismatch(expected: &'static str, value: &Value) -> Error {
    Error::Type(TypeError {
        expected,
        actual: value.type_name().to_string(),
        column: None,
    })
}

fn check_size(len: usize, options: &EncodingOptions) -> Result<()> {
    if len > options.max_allowed_packet {
        return Err(Error::usage(
            UsageErrorKind::PacketTooLarge,
            format!(
                "Parameter of {} bytes exceeds max_allowed_packet ({})",
                len, options.max_allowed_packet
            ),
        ));
    }
    Ok(())
}

#[derive(Debug)]
struct NullEncoder;

impl ValueEncoder for NullEncoder {
    fn field_type(&self, _ctx: &EncodeContext<'_>) -> FieldType {
        FieldType::Null
    }

    fn encode_bytes(&self, _ctx: &EncodeContext<'_>, _out: &mut PacketWriter) -> Result<()> {
        Ok(())
    }

    fn encode_text(&self, _ctx: &EncodeContext<'_>, out: &mut String) -> Result<()> {
        out.push_str("NULL");
        Ok(())
    }

    fn text_length(&self, _ctx: &EncodeContext<'_>) -> Result<usize> {
        Ok(4)
    }
}

#[derive(Debug)]
struct BoolEncoder;

impl ValueEncoder for BoolEncoder {
    fn field_type(&self, _ctx: &EncodeContext<'_>) -> FieldType {
        FieldType::Tiny
    }

    fn encode_bytes(&self, ctx: &EncodeContext<'_>, out: &mut PacketWriter) -> Result<()> {
        let Value::Bool(b) = ctx.value else {
            return Err(mismatch("BOOLEAN", ctx.value));
        };
        out.write_u8(u8::from(*b));
        Ok(())
    }

    fn encode_text(&self, ctx: &EncodeContext<'_>, out: &mut String) -> Result<()> {
        let Value::Bool(b) = ctx.value else {
            return Err(mismatch("BOOLEAN", ctx.value));
        };
        out.push(if *b { '1' } else { '0' });
        Ok(())
    }

    fn text_length(&self, _ctx: &EncodeContext<'_>) -> Result<usize> {
        Ok(1)
    }
}

#[derive(Debug)]
struct IntegerEncoder;

impl ValueEncoder for IntegerEncoder {
    fn field_type(&self, ctx: &EncodeContext<'_>) -> FieldType {
        match ctx.value {
            Value::TinyInt(_) => FieldType::Tiny,
            Value::SmallInt(_) => FieldType::Short,
            Value::Int(_) => FieldType::Long,
            _ => FieldType::LongLong,
        }
    }

    fn is_unsigned(&self, ctx: &EncodeContext<'_>) -> bool {
        matches!(ctx.value, Value::UnsignedBigInt(_))
    }

    fn encode_bytes(&self, ctx: &EncodeContext<'_>, out: &mut PacketWriter) -> Result<()> {
        match ctx.value {
            Value::TinyInt(v) => out.write_u8(*v as u8),
            Value::SmallInt(v) => out.write_u16_le(*v as u16),
            Value::Int(v) => out.write_u32_le(*v as u32),
            Value::BigInt(v) => out.write_u64_le(*v as u64),
            Value::UnsignedBigInt(v) => out.write_u64_le(*v),
            other => return Err(mismatch("INTEGER", other)),
        }
        Ok(())
    }

    fn encode_text(&self, ctx: &EncodeContext<'_>, out: &mut String) -> Result<()> {
        let text = match ctx.value {
            Value::TinyInt(v) => v.to_string(),
            Value::SmallInt(v) => v.to_string(),
            Value::Int(v) => v.to_string(),
            Value::BigInt(v) => v.to_string(),
            Value::UnsignedBigInt(v) => v.to_string(),
            other => return Err(mismatch("INTEGER", other)),
        };
        out.push_str(&text);
        Ok(())
    }
}

#[derive(Debug)]
struct FloatEncoder;

impl FloatEncoder {
    fn finite(value: &Value) -> Result<f64> {
        let v = match value {
            Value::Float(v) => f64::from(*v),
            Value::Double(v) => *v,
            other => return Err(mismatch("FLOAT", other)),
        };
        if v.is_finite() {
            Ok(v)
        } else {
            Err(Error::usage(
                UsageErrorKind::InvalidArgument,
                format!("'{}' is not a valid numeric or approximate numeric value", v),
            ))
        }
    }
}

impl ValueEncoder for FloatEncoder {
    fn field_type(&self, ctx: &EncodeContext<'_>) -> FieldType {
        match ctx.value {
            Value::Float(_) => FieldType::Float,
            _ => FieldType::Double,
        }
    }

    fn encode_bytes(&self, ctx: &EncodeContext<'_>, out: &mut PacketWriter) -> Result<()> {
        match ctx.value {
            Value::Float(v) => out.write_bytes(&v.to_le_bytes()),
            Value::Double(v) => out.write_bytes(&v.to_le_bytes()),
            other => return Err(mismatch("FLOAT", other)),
        }
        Ok(())
    }

    fn encode_text(&self, ctx: &EncodeContext<'_>, out: &mut String) -> Result<()> {
        Self::finite(ctx.value)?;
        match ctx.value {
            Value::Float(v) => out.push_str(&v.to_string()),
            Value::Double(v) => out.push_str(&v.to_string()),
            other => return Err(mismatch("FLOAT", other)),
        }
        Ok(())
    }
}

/// Round a decimal literal half-up to `scale` fractional digits.
///
/// Returns `None` if `text` is not a plain decimal literal.
pub fn round_decimal(text: &str, scale: u32) -> Option<String> {
    let text = text.trim();
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty()) || !all_digits(int_part) || !all_digits(frac_part)
    {
        return None;
    }

    let scale = scale as usize;
    let mut kept: Vec<u8> = int_part.bytes().collect();
    if kept.is_empty() {
        kept.push(b'0');
    }
    let int_len = kept.len();
    kept.extend(frac_part.bytes().take(scale));
    kept.resize(int_len + scale, b'0');

    if frac_part.as_bytes().get(scale).is_some_and(|&b| b >= b'5') {
        let mut i = kept.len();
        loop {
            if i == 0 {
                kept.insert(0, b'1');
                break;
            }
            i -= 1;
            if kept[i] == b'9' {
                kept[i] = b'0';
            } else {
                kept[i] += 1;
                break;
            }
        }
    }

    let split = kept.len() - scale;
    let (int_digits, frac_digits) = kept.split_at(split);
    let int_digits = std::str::from_utf8(int_digits).ok()?;
    let int_digits = int_digits.trim_start_matches('0');
    let int_digits = if int_digits.is_empty() { "0" } else { int_digits };
    let frac_digits = std::str::from_utf8(frac_digits).ok()?;

    let is_zero = int_digits == "0" && frac_digits.bytes().all(|b| b == b'0');
    let mut out = String::with_capacity(kept.len() + 2);
    if negative && !is_zero {
        out.push('-');
    }
    out.push_str(int_digits);
    if scale > 0 {
        out.push('.');
        out.push_str(frac_digits);
    }
    Some(out)
}

#[derive(Debug)]
struct DecimalEncoder;

impl DecimalEncoder {
    fn literal(ctx: &EncodeContext<'_>) -> Result<String> {
        let Value::Decimal(text) = ctx.value else {
            return Err(mismatch("DECIMAL", ctx.value));
        };
        let scale = match ctx.scale_or_length {
            Some(scale) => scale,
            None => text
                .trim()
                .split_once('.')
                .map_or(0, |(_, frac)| frac.len() as u32),
        };
        round_decimal(text, scale).ok_or_else(|| {
            Error::usage(
                UsageErrorKind::InvalidArgument,
                format!("'{}' is not a valid DECIMAL value", text),
            )
        })
    }
}

impl ValueEncoder for DecimalEncoder {
    fn field_type(&self, _ctx: &EncodeContext<'_>) -> FieldType {
        FieldType::NewDecimal
    }

    fn encode_bytes(&self, ctx: &EncodeContext<'_>, out: &mut PacketWriter) -> Result<()> {
        out.write_lenenc_string(&Self::literal(ctx)?);
        Ok(())
    }

    fn encode_text(&self, ctx: &EncodeContext<'_>, out: &mut String) -> Result<()> {
        out.push_str(&Self::literal(ctx)?);
        Ok(())
    }
}

#[derive(Debug)]
struct TextEncoder;

impl TextEncoder {
    fn truncated<'v>(ctx: &EncodeContext<'v>) -> Result<&'v str> {
        let Value::Text(s) = ctx.value else {
            return Err(mismatch("VARCHAR", ctx.value));
        };
        let s = match ctx.scale_or_length {
            Some(max_chars) => s
                .char_indices()
                .nth(max_chars as usize)
                .map_or(s.as_str(), |(end, _)| &s[..end]),
            None => s.as_str(),
        };
        check_size(s.len(), ctx.options)?;
        Ok(s)
    }
}

impl ValueEncoder for TextEncoder {
    fn field_type(&self, _ctx: &EncodeContext<'_>) -> FieldType {
        FieldType::VarString
    }

    fn encode_bytes(&self, ctx: &EncodeContext<'_>, out: &mut PacketWriter) -> Result<()> {
        out.write_lenenc_string(Self::truncated(ctx)?);
        Ok(())
    }

    fn encode_text(&self, ctx: &EncodeContext<'_>, out: &mut String) -> Result<()> {
        let s = Self::truncated(ctx)?;
        out.push('\'');
        push_escaped(out, s, ctx.options.no_backslash_escapes);
        out.push('\'');
        Ok(())
    }
}

#[derive(Debug)]
struct BytesEncoder;

impl BytesEncoder {
    fn truncated<'v>(ctx: &EncodeContext<'v>) -> Result<&'v [u8]> {
        let Value::Bytes(b) = ctx.value else {
            return Err(mismatch("BLOB", ctx.value));
        };
        let b = match ctx.scale_or_length {
            Some(max) => &b[..b.len().min(max as usize)],
            None => b.as_slice(),
        };
        check_size(b.len(), ctx.options)?;
        Ok(b)
    }
}

impl ValueEncoder for BytesEncoder {
    fn field_type(&self, _ctx: &EncodeContext<'_>) -> FieldType {
        FieldType::Blob
    }

    fn encode_bytes(&self, ctx: &EncodeContext<'_>, out: &mut PacketWriter) -> Result<()> {
        out.write_lenenc_bytes(Self::truncated(ctx)?);
        Ok(())
    }

    fn encode_text(&self, ctx: &EncodeContext<'_>, out: &mut String) -> Result<()> {
        push_hex_literal(out, Self::truncated(ctx)?);
        Ok(())
    }

    fn text_length(&self, ctx: &EncodeContext<'_>) -> Result<usize> {
        Ok(Self::truncated(ctx)?.len() * 2 + 3)
    }
}

/// DATE, TIME and DATETIME values.
#[derive(Debug)]
struct TemporalEncoder;

impl TemporalEncoder {
    /// Microseconds to send, honouring `sendFractionalSeconds` and a scale of 0.
    fn fractional(ctx: &EncodeContext<'_>) -> bool {
        ctx.options.send_fractional_seconds && ctx.scale_or_length != Some(0)
    }

    fn write_time_of_day(out: &mut PacketWriter, of_day: i64, fractional: bool) -> bool {
        let secs = of_day / MICROS_PER_SECOND;
        let micros = if fractional { of_day % MICROS_PER_SECOND } else { 0 };
        out.write_u8((secs / 3600) as u8);
        out.write_u8(((secs % 3600) / 60) as u8);
        out.write_u8((secs % 60) as u8);
        if micros != 0 {
            out.write_u32_le(micros as u32);
        }
        micros != 0
    }
}

impl ValueEncoder for TemporalEncoder {
    fn field_type(&self, ctx: &EncodeContext<'_>) -> FieldType {
        match ctx.value {
            Value::Date(_) => FieldType::Date,
            Value::Time(_) => FieldType::Time,
            _ => FieldType::DateTime,
        }
    }

    fn encode_bytes(&self, ctx: &EncodeContext<'_>, out: &mut PacketWriter) -> Result<()> {
        let fractional = Self::fractional(ctx);
        match ctx.value {
            Value::Date(days) => {
                let (y, m, d) = days_to_ymd(*days);
                out.write_u8(4);
                out.write_u16_le(y as u16);
                out.write_u8(m as u8);
                out.write_u8(d as u8);
            }
            Value::Time(micros) => {
                let abs = micros.unsigned_abs() as i64;
                let days = abs / crate::types::MICROS_PER_DAY;
                let of_day = abs % crate::types::MICROS_PER_DAY;
                let has_micros = fractional && of_day % MICROS_PER_SECOND != 0;
                out.write_u8(if has_micros { 12 } else { 8 });
                out.write_u8(u8::from(*micros < 0));
                out.write_u32_le(days as u32);
                Self::write_time_of_day(out, of_day, fractional);
            }
            Value::Timestamp(micros) => {
                let (days, of_day) = split_timestamp(*micros);
                let (y, m, d) = days_to_ymd(days);
                let has_micros = fractional && of_day % MICROS_PER_SECOND != 0;
                out.write_u8(if has_micros { 11 } else { 7 });
                out.write_u16_le(y as u16);
                out.write_u8(m as u8);
                out.write_u8(d as u8);
                Self::write_time_of_day(out, of_day, fractional);
            }
            other => return Err(mismatch("DATETIME", other)),
        }
        Ok(())
    }

    fn encode_text(&self, ctx: &EncodeContext<'_>, out: &mut String) -> Result<()> {
        let fractional = Self::fractional(ctx);
        let text = match ctx.value {
            Value::Date(days) => format_date(*days),
            Value::Time(micros) => format_time(*micros, fractional),
            Value::Timestamp(micros) => format_datetime(*micros, fractional),
            other => return Err(mismatch("DATETIME", other)),
        };
        out.push('\'');
        out.push_str(&text);
        out.push('\'');
        Ok(())
    }
}

#[derive(Debug)]
struct JsonEncoder;

impl JsonEncoder {
    fn serialize(ctx: &EncodeContext<'_>) -> Result<String> {
        let Value::Json(json) = ctx.value else {
            return Err(mismatch("JSON", ctx.value));
        };
        let text = serde_json::to_string(json).map_err(|e| {
            Error::usage(
                UsageErrorKind::InvalidArgument,
                format!("Cannot serialize JSON parameter: {}", e),
            )
        })?;
        check_size(text.len(), ctx.options)?;
        Ok(text)
    }
}

impl ValueEncoder for JsonEncoder {
    fn field_type(&self, _ctx: &EncodeContext<'_>) -> FieldType {
        FieldType::Json
    }

    fn encode_bytes(&self, ctx: &EncodeContext<'_>, out: &mut PacketWriter) -> Result<()> {
        out.write_lenenc_string(&Self::serialize(ctx)?);
        Ok(())
    }

    fn encode_text(&self, ctx: &EncodeContext<'_>, out: &mut String) -> Result<()> {
        let text = Self::serialize(ctx)?;
        out.push('\'');
        push_escaped(out, &text, ctx.options.no_backslash_escapes);
        out.push('\'');
        Ok(())
    }
}
