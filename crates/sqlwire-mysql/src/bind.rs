//! Parameter slots for prepared and client-side bound statements.

use std::fmt;
use std::sync::Arc;

use sqlwire_core::error::UsageErrorKind;
use sqlwire_core::{Error, Result, Value};

use crate::column::Field;
use crate::encoder::{EncodeContext, EncoderRegistry, EncodingOptions, ValueEncoder};
use crate::protocol::PacketWriter;
use crate::types::FieldType;

/// One statement parameter.
///
/// The encoder is resolved from the value's runtime kind when the value is
/// bound, so an unsupported value fails at bind time rather than at execute
/// time. The registry and encoding options are shared with the connection.
#[derive(Clone)]
pub struct BindValue {
    /// 1-based parameter position
    index: usize,
    registry: Arc<EncoderRegistry>,
    options: Arc<EncodingOptions>,
    value: Value,
    target_type: Option<FieldType>,
    is_null: bool,
    is_set: bool,
    encoder: Option<Arc<dyn ValueEncoder>>,
    scale_or_length: Option<u32>,
    field: Option<Field>,
}

impl fmt::Debug for BindValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindValue")
            .field("index", &self.index)
            .field("value", &self.value)
            .field("target_type", &self.target_type)
            .field("is_null", &self.is_null)
            .field("is_set", &self.is_set)
            .field("scale_or_length", &self.scale_or_length)
            .finish_non_exhaustive()
    }
}

impl BindValue {
    pub fn new(index: usize, registry: Arc<EncoderRegistry>, options: Arc<EncodingOptions>) -> Self {
        Self {
            index,
            registry,
            options,
            value: Value::Null,
            target_type: None,
            is_null: false,
            is_set: false,
            encoder: None,
            scale_or_length: None,
            field: None,
        }
    }

    /// A slot using the default registry and options, for standalone use.
    pub fn standalone(index: usize) -> Self {
        Self::new(
            index,
            Arc::new(EncoderRegistry::with_defaults()),
            Arc::new(EncodingOptions::default()),
        )
    }

    /// Bind `value` with the declared SQL type.
    ///
    /// A declared type of [`FieldType::Null`] or a [`Value::Null`] marks the
    /// slot as NULL. Fails when no encoder handles the value's kind; the slot
    /// is left untouched in that case.
    pub fn set_binding(&mut self, value: Value, declared_type: FieldType) -> Result<()> {
        let encoder = self.registry.resolve(&value)?;
        self.is_null = declared_type == FieldType::Null || value.is_null();
        self.value = value;
        self.target_type = Some(declared_type);
        self.encoder = Some(encoder);
        self.is_set = true;
        Ok(())
    }

    /// Bind `value`, declaring the type its encoder would send.
    pub fn bind(&mut self, value: Value) -> Result<()> {
        let encoder = self.registry.resolve(&value)?;
        let declared = encoder.field_type(&EncodeContext {
            value: &value,
            target_type: None,
            scale_or_length: self.scale_or_length,
            options: &self.options,
        });
        self.set_binding(value, declared)
    }

    pub fn set_null(&mut self) -> Result<()> {
        self.set_binding(Value::Null, FieldType::Null)
    }

    /// Bind `value` using the metadata of a result column.
    ///
    /// Decimal columns carry their scale over.
    pub fn bind_from_field(&mut self, value: Value, field: &Field) -> Result<()> {
        self.set_binding(value, field.field_type)?;
        if field.field_type.is_decimal() {
            self.scale_or_length = Some(u32::from(field.decimals));
        }
        self.field = Some(field.clone());
        Ok(())
    }

    /// Decimal scale, or maximum length in chars (text) or bytes (binary).
    pub fn with_scale_or_length(&mut self, scale_or_length: u32) -> &mut Self {
        self.scale_or_length = Some(scale_or_length);
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Bound value, `Value::Null` when unset.
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn target_type(&self) -> Option<FieldType> {
        self.target_type
    }

    pub fn is_null(&self) -> bool {
        self.is_null
    }

    pub fn is_set(&self) -> bool {
        self.is_set
    }

    pub fn scale_or_length(&self) -> Option<u32> {
        self.scale_or_length
    }

    pub fn field(&self) -> Option<&Field> {
        self.field.as_ref()
    }

    pub fn options(&self) -> &EncodingOptions {
        &self.options
    }

    fn bound(&self) -> Result<(&dyn ValueEncoder, EncodeContext<'_>)> {
        let encoder = match (&self.encoder, self.is_set) {
            (Some(encoder), true) => &**encoder,
            _ => {
                return Err(Error::usage(
                    UsageErrorKind::ParameterNotSet,
                    format!("No value specified for parameter {}", self.index),
                ));
            }
        };
        let ctx = EncodeContext {
            value: &self.value,
            target_type: self.target_type,
            scale_or_length: self.scale_or_length,
            options: &self.options,
        };
        Ok((encoder, ctx))
    }

    /// Wire type and unsigned flag for the execute packet type block.
    pub fn wire_type(&self) -> Result<(FieldType, bool)> {
        if self.is_null {
            self.bound()?;
            return Ok((FieldType::Null, false));
        }
        let (encoder, ctx) = self.bound()?;
        Ok((encoder.field_type(&ctx), encoder.is_unsigned(&ctx)))
    }

    /// Append the binary protocol form to `out`. NULL writes nothing.
    pub fn write_bytes(&self, out: &mut PacketWriter) -> Result<()> {
        let (encoder, ctx) = self.bound()?;
        if self.is_null {
            return Ok(());
        }
        encoder.encode_bytes(&ctx, out)
    }

    /// The binary protocol form.
    pub fn get_byte_value(&self) -> Result<Vec<u8>> {
        let mut out = PacketWriter::with_capacity(16);
        self.write_bytes(&mut out)?;
        Ok(out.into_bytes())
    }

    /// Append the SQL literal form to `out`.
    pub fn write_as_text(&self, out: &mut String) -> Result<()> {
        let (encoder, ctx) = self.bound()?;
        if self.is_null {
            out.push_str("NULL");
            return Ok(());
        }
        encoder.encode_text(&ctx, out)
    }

    pub fn get_text_length(&self) -> Result<usize> {
        let (encoder, ctx) = self.bound()?;
        if self.is_null {
            return Ok(4);
        }
        encoder.text_length(&ctx)
    }

    /// Independent snapshot sharing the connection-scoped registry and options.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Return to the freshly constructed state.
    pub fn reset(&mut self) {
        self.value = Value::Null;
        self.target_type = None;
        self.is_null = false;
        self.is_set = false;
        self.encoder = None;
        self.scale_or_length = None;
        self.field = None;
    }
}

fn out_of_range(index: usize, count: usize) -> Error {
    Error::usage(
        UsageErrorKind::InvalidArgument,
        format!(
            "Parameter index out of range ({} > number of parameters, which is {}).",
            index, count
        ),
    )
}

/// Replace each `?` outside quotes and comments with the SQL literal of the
/// matching parameter.
///
/// Quoted sections (`'`, `"`, `` ` ``) honour doubled quotes and, unless
/// `no_backslash_escapes`, backslash escapes. Fails when the placeholder
/// count differs from `params.len()`.
pub fn interpolate(sql: &str, params: &[BindValue], no_backslash_escapes: bool) -> Result<String> {
    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut next = params.iter();
    let mut placeholders = 0usize;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' | '`' => {
                out.push(c);
                while let Some(q) = chars.next() {
                    out.push(q);
                    if q == '\\' && c != '`' && !no_backslash_escapes {
                        if let Some(escaped) = chars.next() {
                            out.push(escaped);
                        }
                    } else if q == c {
                        if chars.peek() == Some(&c) {
                            chars.next();
                            out.push(c);
                        } else {
                            break;
                        }
                    }
                }
            }
            '-' if starts_line_comment(chars.clone()) => {
                out.push(c);
                for ch in chars.by_ref() {
                    out.push(ch);
                    if ch == '\n' {
                        break;
                    }
                }
            }
            '#' => {
                out.push(c);
                for ch in chars.by_ref() {
                    out.push(ch);
                    if ch == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                out.push(c);
                // the opening '*' cannot also close the comment
                out.extend(chars.next());
                let mut prev = '\0';
                for ch in chars.by_ref() {
                    out.push(ch);
                    if prev == '*' && ch == '/' {
                        break;
                    }
                    prev = ch;
                }
            }
            '?' => {
                placeholders += 1;
                if let Some(param) = next.next() {
                    param.write_as_text(&mut out)?;
                }
            }
            _ => out.push(c),
        }
    }

    if placeholders != params.len() {
        return Err(Error::usage(
            UsageErrorKind::InvalidArgument,
            format!(
                "Statement has {} parameter markers but {} values were supplied",
                placeholders,
                params.len()
            ),
        ));
    }
    Ok(out)
}

/// `--` only starts a comment when followed by whitespace or the end of input.
fn starts_line_comment(mut rest: impl Iterator<Item = char>) -> bool {
    rest.next() == Some('-') && rest.next().is_none_or(char::is_whitespace)
}

/// The parameter slots of one statement, plus queued batch rows.
#[derive(Debug, Clone)]
pub struct ParameterBindings {
    values: Vec<BindValue>,
    batch: Vec<Vec<BindValue>>,
}

impl ParameterBindings {
    pub fn new(count: usize, registry: Arc<EncoderRegistry>, options: Arc<EncodingOptions>) -> Self {
        let values = (1..=count)
            .map(|i| BindValue::new(i, Arc::clone(&registry), Arc::clone(&options)))
            .collect();
        Self {
            values,
            batch: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[BindValue] {
        &self.values
    }

    /// Slot for the 1-based parameter `index`.
    pub fn get(&self, index: usize) -> Result<&BindValue> {
        index
            .checked_sub(1)
            .and_then(|i| self.values.get(i))
            .ok_or_else(|| out_of_range(index, self.values.len()))
    }

    pub fn get_mut(&mut self, index: usize) -> Result<&mut BindValue> {
        let count = self.values.len();
        index
            .checked_sub(1)
            .and_then(|i| self.values.get_mut(i))
            .ok_or_else(|| out_of_range(index, count))
    }

    /// Bind the 1-based parameter `index`.
    pub fn bind(&mut self, index: usize, value: Value) -> Result<()> {
        self.get_mut(index)?.bind(value)
    }

    /// Fail naming the first parameter that has no value.
    pub fn check_all_set(&self) -> Result<()> {
        match self.values.iter().find(|v| !v.is_set()) {
            Some(unset) => Err(Error::usage(
                UsageErrorKind::ParameterNotSet,
                format!("No value specified for parameter {}", unset.index()),
            )),
            None => Ok(()),
        }
    }

    /// Queue a snapshot of the current values as one batch row.
    pub fn add_batch(&mut self) -> Result<()> {
        self.check_all_set()?;
        self.batch
            .push(self.values.iter().map(BindValue::copy).collect());
        Ok(())
    }

    pub fn batch(&self) -> &[Vec<BindValue>] {
        &self.batch
    }

    pub fn take_batch(&mut self) -> Vec<Vec<BindValue>> {
        std::mem::take(&mut self.batch)
    }

    /// Reset every slot and drop queued batch rows.
    pub fn clear(&mut self) {
        for value in &mut self.values {
            value.reset();
        }
        self.batch.clear();
    }
}
