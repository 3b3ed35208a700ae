//! Result column metadata and name lookup.

use std::collections::HashMap;
use std::sync::OnceLock;

use sqlwire_core::error::UsageErrorKind;
use sqlwire_core::{Error, Result};

use crate::protocol::{PacketReader, PacketWriter, charset};
use crate::types::{DecodeHint, FieldType, column_flags};

/// One column descriptor from a column definition packet (protocol 4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub catalog: String,
    pub schema: String,
    /// Table alias
    pub table: String,
    /// Physical table name
    pub org_table: String,
    /// Column label (alias)
    pub name: String,
    /// Physical column name
    pub org_name: String,
    /// Collation id
    pub charset: u16,
    pub column_length: u32,
    pub field_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl Field {
    /// A field with the given label and type and otherwise empty metadata.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        Self {
            catalog: "def".to_string(),
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            org_name: name.clone(),
            name,
            charset: u16::from(charset::DEFAULT_CHARSET),
            column_length: 0,
            field_type,
            flags: 0,
            decimals: 0,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        let table = table.into();
        self.org_table = table.clone();
        self.table = table;
        self
    }

    pub fn with_org_name(mut self, org_name: impl Into<String>) -> Self {
        self.org_name = org_name.into();
        self
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_charset(mut self, charset: u16) -> Self {
        self.charset = charset;
        self
    }

    pub fn with_decimals(mut self, decimals: u8) -> Self {
        self.decimals = decimals;
        self
    }

    /// Parse a column definition payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);

        let catalog = reader.read_lenenc_string()?;
        let schema = reader.read_lenenc_string()?;
        let table = reader.read_lenenc_string()?;
        let org_table = reader.read_lenenc_string()?;
        let name = reader.read_lenenc_string()?;
        let org_name = reader.read_lenenc_string()?;

        // Length of the fixed-size block (always 0x0c)
        let _fixed_len = reader.read_lenenc_int()?;

        let charset = reader.read_u16_le()?;
        let column_length = reader.read_u32_le()?;
        let field_type = FieldType::from_u8(reader.read_u8()?);
        let flags = reader.read_u16_le()?;
        let decimals = reader.read_u8()?;

        Ok(Self {
            catalog,
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            field_type,
            flags,
            decimals,
        })
    }

    /// Encode as a column definition payload.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut writer = PacketWriter::with_capacity(64);
        writer.write_lenenc_string(&self.catalog);
        writer.write_lenenc_string(&self.schema);
        writer.write_lenenc_string(&self.table);
        writer.write_lenenc_string(&self.org_table);
        writer.write_lenenc_string(&self.name);
        writer.write_lenenc_string(&self.org_name);
        writer.write_lenenc_int(0x0c);
        writer.write_u16_le(self.charset);
        writer.write_u32_le(self.column_length);
        writer.write_u8(self.field_type as u8);
        writer.write_u16_le(self.flags);
        writer.write_u8(self.decimals);
        writer.write_zeros(2);
        writer.into_bytes()
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    pub fn is_nullable(&self) -> bool {
        self.flags & column_flags::NOT_NULL == 0
    }

    pub fn is_binary(&self) -> bool {
        self.charset == u16::from(charset::BINARY)
    }

    pub fn decode_hint(&self) -> DecodeHint {
        DecodeHint {
            field_type: self.field_type,
            unsigned: self.is_unsigned(),
            charset: self.charset,
        }
    }
}

#[derive(Debug, Default)]
struct ColumnIndex {
    by_label: HashMap<String, usize>,
    by_full_name: HashMap<String, usize>,
    by_org_name: HashMap<String, usize>,
}

/// The columns of one result, with lazily built name lookup.
///
/// The lookup maps are built at most once, on the first name-based lookup or
/// an explicit [`ColumnDefinition::build_index_mapping`]. Names are folded to
/// lower case on both sides. On duplicate names the first column wins.
#[derive(Debug, Default)]
pub struct ColumnDefinition {
    fields: Vec<Field>,
    index: OnceLock<ColumnIndex>,
    large_fields: OnceLock<bool>,
}

impl ColumnDefinition {
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            fields,
            index: OnceLock::new(),
            large_fields: OnceLock::new(),
        }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, ordinal: usize) -> Option<&Field> {
        self.fields.get(ordinal)
    }

    /// Build the name lookup maps. A no-op once built.
    pub fn build_index_mapping(&self) {
        self.index();
    }

    pub fn has_built_index_mapping(&self) -> bool {
        self.index.get().is_some()
    }

    fn index(&self) -> &ColumnIndex {
        self.index.get_or_init(|| {
            tracing::trace!(columns = self.fields.len(), "building column index");
            let mut index = ColumnIndex::default();
            for (i, field) in self.fields.iter().enumerate() {
                let label = field.name.to_lowercase();
                if !field.table.is_empty() {
                    index
                        .by_full_name
                        .entry(format!("{}.{}", field.table.to_lowercase(), label))
                        .or_insert(i);
                }
                index.by_label.entry(label).or_insert(i);
                if !field.org_name.is_empty() {
                    index
                        .by_org_name
                        .entry(field.org_name.to_lowercase())
                        .or_insert(i);
                }
            }
            index
        })
    }

    /// Position of the column called `name`, offset by `index_base`.
    ///
    /// Tries the label, then `table.label`, then the physical column name.
    /// An unknown name fails with a column-not-found error.
    pub fn find_column(&self, name: &str, index_base: usize) -> Result<usize> {
        let key = name.to_lowercase();
        let index = self.index();
        index
            .by_label
            .get(&key)
            .or_else(|| index.by_full_name.get(&key))
            .or_else(|| index.by_org_name.get(&key))
            .map(|&i| i + index_base)
            .ok_or_else(|| {
                Error::usage(
                    UsageErrorKind::ColumnNotFound,
                    format!("Column '{}' not found.", name),
                )
            })
    }

    /// Whether any column holds BLOB, MEDIUMBLOB, LONGBLOB or JSON data.
    pub fn has_large_fields(&self) -> bool {
        *self
            .large_fields
            .get_or_init(|| self.fields.iter().any(|f| f.field_type.is_large()))
    }
}

impl Clone for ColumnDefinition {
    fn clone(&self) -> Self {
        Self::new(self.fields.clone())
    }
}

impl From<Vec<Field>> for ColumnDefinition {
    fn from(fields: Vec<Field>) -> Self {
        Self::new(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ColumnDefinition {
        ColumnDefinition::new(vec![
            Field::new("id", FieldType::Long)
                .with_table("u")
                .with_org_name("user_id"),
            Field::new("Name", FieldType::VarString).with_table("u"),
            Field::new("name", FieldType::VarString).with_table("p"),
            Field::new("body", FieldType::Blob),
        ])
    }

    #[test]
    fn test_parse_field_roundtrip() {
        let field = Field::new("total", FieldType::NewDecimal)
            .with_table("orders")
            .with_flags(column_flags::NOT_NULL | column_flags::UNSIGNED)
            .with_decimals(2);
        let parsed = Field::parse(&field.to_payload()).unwrap();
        assert_eq!(parsed, field);
        assert!(parsed.is_unsigned());
        assert!(!parsed.is_nullable());
    }

    #[test]
    fn test_parse_truncated_field() {
        let payload = Field::new("x", FieldType::Long).to_payload();
        assert!(Field::parse(&payload[..payload.len() - 6]).is_err());
    }

    #[test]
    fn test_index_is_lazy_and_idempotent() {
        let cols = sample();
        assert!(!cols.has_built_index_mapping());
        cols.build_index_mapping();
        assert!(cols.has_built_index_mapping());
        let first = cols.find_column("NAME", 0).unwrap();
        cols.build_index_mapping();
        assert!(cols.has_built_index_mapping());
        assert_eq!(cols.find_column("name", 0).unwrap(), first);
    }

    #[test]
    fn test_find_column_lookup_order() {
        let cols = sample();
        assert_eq!(cols.find_column("name", 0).unwrap(), 1);
        assert_eq!(cols.find_column("p.name", 0).unwrap(), 2);
        assert_eq!(cols.find_column("U.ID", 1).unwrap(), 1);
        assert_eq!(cols.find_column("user_id", 1).unwrap(), 1);
        assert!(cols.has_built_index_mapping());
    }

    #[test]
    fn test_find_unknown_column() {
        let err = sample().find_column("missing", 1).unwrap_err();
        assert_eq!(err.sqlstate(), Some("S0022"));
        assert_eq!(err.to_string(), "Column 'missing' not found.");
    }

    #[test]
    fn test_has_large_fields() {
        assert!(sample().has_large_fields());
        let small = ColumnDefinition::new(vec![Field::new("a", FieldType::VarString)]);
        assert!(!small.has_large_fields());
        let json = ColumnDefinition::new(vec![Field::new("j", FieldType::Json)]);
        assert!(json.has_large_fields());
    }
}
