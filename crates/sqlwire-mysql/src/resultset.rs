//! Decoded results: rows, status results and multi-result chains.

use std::sync::Arc;

use sqlwire_core::{Error, Result, Value};

use crate::column::ColumnDefinition;
use crate::protocol::{OkPacket, PacketReader};
use crate::types::{decode_binary_value, decode_text_value};

/// A single row, sharing its column metadata with the result it came from.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<ColumnDefinition>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<ColumnDefinition>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &ColumnDefinition {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at the 0-based `ordinal`.
    pub fn get(&self, ordinal: usize) -> Option<&Value> {
        self.values.get(ordinal)
    }

    /// Value of the column called `name` (case-insensitive).
    pub fn get_by_name(&self, name: &str) -> Result<&Value> {
        let ordinal = self.columns.find_column(name, 0)?;
        self.values
            .get(ordinal)
            .ok_or_else(|| Error::protocol(format!("row has no value for column {}", ordinal)))
    }

    /// Convert the named column's value.
    pub fn get_as<T>(&self, name: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        T::try_from(self.get_by_name(name)?.clone())
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// One result of a command.
///
/// Either row-bearing (columns and rows) or a status result (affected rows,
/// last insert id and the server's info message).
#[derive(Debug, Clone, Default)]
pub struct Resultset {
    columns: Option<Arc<ColumnDefinition>>,
    rows: Vec<Row>,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub info: String,
    pub warnings: u16,
    pub status_flags: u16,
}

impl Resultset {
    /// A status result from an OK packet.
    pub fn from_ok(ok: OkPacket) -> Self {
        Self {
            columns: None,
            rows: Vec::new(),
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            info: ok.info,
            warnings: ok.warnings,
            status_flags: ok.status_flags,
        }
    }

    /// A row-bearing result.
    pub fn with_rows(columns: Arc<ColumnDefinition>, rows: Vec<Row>) -> Self {
        Self {
            columns: Some(columns),
            rows,
            ..Self::default()
        }
    }

    pub fn has_rows(&self) -> bool {
        self.columns.is_some()
    }

    pub fn columns(&self) -> Option<&Arc<ColumnDefinition>> {
        self.columns.as_ref()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Update count, `None` for row-bearing results.
    pub fn update_count(&self) -> Option<u64> {
        (!self.has_rows()).then_some(self.affected_rows)
    }
}

/// The results of one command, in server order.
///
/// Held as an ordered arena. Navigation is by position; the chain can be
/// traversed any number of times.
#[derive(Debug, Clone, Default)]
pub struct ResultsetChain {
    results: Vec<Resultset>,
}

impl ResultsetChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, result: Resultset) -> usize {
        self.results.push(result);
        self.results.len() - 1
    }

    pub fn first(&self) -> Option<&Resultset> {
        self.results.first()
    }

    pub fn get(&self, index: usize) -> Option<&Resultset> {
        self.results.get(index)
    }

    /// The result after the one at `index`.
    pub fn next_of(&self, index: usize) -> Option<&Resultset> {
        self.results.get(index.checked_add(1)?)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Resultset> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn into_vec(self) -> Vec<Resultset> {
        self.results
    }

    /// Rows of the first row-bearing result.
    pub fn rows(&self) -> &[Row] {
        self.results
            .iter()
            .find(|r| r.has_rows())
            .map_or(&[], Resultset::rows)
    }
}

impl IntoIterator for ResultsetChain {
    type Item = Resultset;
    type IntoIter = std::vec::IntoIter<Resultset>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResultsetChain {
    type Item = &'a Resultset;
    type IntoIter = std::slice::Iter<'a, Resultset>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}

/// Row decoding strategy for one protocol flavour.
pub trait ResultsetFactory {
    fn decode_row(&self, columns: &ColumnDefinition, payload: &[u8]) -> Result<Vec<Value>>;
}

/// Text protocol rows (`COM_QUERY`): one length-encoded string per column.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextResultsetFactory;

impl ResultsetFactory for TextResultsetFactory {
    fn decode_row(&self, columns: &ColumnDefinition, payload: &[u8]) -> Result<Vec<Value>> {
        let mut reader = PacketReader::new(payload);
        columns
            .fields()
            .iter()
            .map(|field| {
                Ok(match reader.read_lenenc_bytes_nullable()? {
                    None => Value::Null,
                    Some(data) => decode_text_value(field.decode_hint(), data),
                })
            })
            .collect()
    }
}

/// Binary protocol rows (`COM_STMT_EXECUTE`): header, NULL bitmap, values.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryResultsetFactory;

/// Bits before the first column in a binary row NULL bitmap.
const BINARY_NULL_BITMAP_OFFSET: usize = 2;

impl ResultsetFactory for BinaryResultsetFactory {
    fn decode_row(&self, columns: &ColumnDefinition, payload: &[u8]) -> Result<Vec<Value>> {
        let mut reader = PacketReader::new(payload);
        let header = reader.read_u8()?;
        if header != 0x00 {
            return Err(Error::protocol(format!(
                "Invalid binary row header: 0x{:02X}",
                header
            )));
        }

        let bitmap_len = (columns.len() + 7 + BINARY_NULL_BITMAP_OFFSET) / 8;
        let bitmap = reader.read_bytes(bitmap_len)?;

        columns
            .fields()
            .iter()
            .enumerate()
            .map(|(i, field)| {
                let bit = i + BINARY_NULL_BITMAP_OFFSET;
                if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
                    Ok(Value::Null)
                } else {
                    decode_binary_value(field.decode_hint(), &mut reader)
                }
            })
            .collect()
    }
}
