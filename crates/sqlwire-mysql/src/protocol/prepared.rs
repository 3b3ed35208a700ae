//! Server-side prepared statements (binary protocol).
//!
//! # Protocol Flow
//!
//! 1. **Prepare**: `COM_STMT_PREPARE` with the SQL text
//!    - Server answers with statement id, parameter and column counts
//!    - Followed by parameter definitions and result column definitions
//!
//! 2. **Execute**: `COM_STMT_EXECUTE` with statement id and binary parameters
//!    - Server answers with a binary result set or an OK packet
//!
//! 3. **Close**: `COM_STMT_CLOSE` with statement id
//!    - No server response

#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;

use sqlwire_core::{Error, Result};

use super::{Command, PacketReader, PacketWriter};
use crate::bind::BindValue;
use crate::column::ColumnDefinition;

/// Response to `COM_STMT_PREPARE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    /// Server-assigned statement id, used by execute and close
    pub statement_id: u32,
    /// Result columns, 0 for statements without rows
    pub num_columns: u16,
    /// `?` placeholders in the SQL
    pub num_params: u16,
    pub warnings: u16,
}

impl StmtPrepareOk {
    /// Parse the prepare response.
    ///
    /// Layout: `0x00`, statement id (4), columns (2), params (2), filler (1),
    /// warnings (2, may be absent).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        let status = reader.read_u8()?;
        if status != 0x00 {
            return Err(Error::protocol(format!(
                "Invalid prepare response status: 0x{:02X}",
                status
            )));
        }
        let statement_id = reader.read_u32_le()?;
        let num_columns = reader.read_u16_le()?;
        let num_params = reader.read_u16_le()?;
        let warnings = if reader.remaining() >= 3 {
            reader.skip(1)?;
            reader.read_u16_le()?
        } else {
            0
        };
        Ok(Self {
            statement_id,
            num_columns,
            num_params,
            warnings,
        })
    }
}

/// A statement prepared on the server, with its metadata.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub sql: String,
    pub statement_id: u32,
    /// Parameter definitions as reported by the server
    pub params: ColumnDefinition,
    /// Result columns, shared with the rows of each execution
    pub columns: Arc<ColumnDefinition>,
}

impl PreparedStatement {
    pub fn new(
        sql: impl Into<String>,
        statement_id: u32,
        params: ColumnDefinition,
        columns: ColumnDefinition,
    ) -> Self {
        Self {
            sql: sql.into(),
            statement_id,
            params,
            columns: Arc::new(columns),
        }
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

/// `COM_STMT_PREPARE` payload.
pub fn stmt_prepare_payload(sql: &str) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtPrepare, sql.len());
    writer.write_bytes(sql.as_bytes());
    writer.into_bytes()
}

/// `COM_STMT_EXECUTE` payload.
///
/// - Command byte, statement id (4), flags (1, no cursor), iteration count (4, always 1)
/// - NULL bitmap, `(n + 7) / 8` bytes, bit `i` set for NULL parameter `i`
/// - New-params-bound flag (1), then one type byte and one flag byte (`0x80`
///   for unsigned) per parameter
/// - Values of the non-NULL parameters in order
pub fn stmt_execute_payload(statement_id: u32, params: &[BindValue]) -> Result<Vec<u8>> {
    let mut writer = PacketWriter::command(Command::StmtExecute, 16 + params.len() * 16);
    writer.write_u32_le(statement_id);
    writer.write_u8(0x00);
    writer.write_u32_le(1);

    if params.is_empty() {
        return Ok(writer.into_bytes());
    }

    let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
    for (i, param) in params.iter().enumerate() {
        if param.is_null() {
            null_bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    writer.write_bytes(&null_bitmap);

    writer.write_u8(1);
    for param in params {
        let (field_type, unsigned) = param.wire_type()?;
        writer.write_u8(field_type as u8);
        writer.write_u8(if unsigned { 0x80 } else { 0x00 });
    }

    for param in params {
        param.write_bytes(&mut writer)?;
    }

    Ok(writer.into_bytes())
}

/// `COM_STMT_CLOSE` payload. The server sends no response.
pub fn stmt_close_payload(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtClose, 4);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

/// `COM_STMT_RESET` payload.
pub fn stmt_reset_payload(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtReset, 4);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;
    use sqlwire_core::Value;

    #[test]
    fn test_parse_prepare_ok() {
        let data = [0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x00, 0x02, 0x00, 0x00, 0x05, 0x00];
        let ok = StmtPrepareOk::parse(&data).unwrap();
        assert_eq!(ok.statement_id, 1);
        assert_eq!(ok.num_columns, 3);
        assert_eq!(ok.num_params, 2);
        assert_eq!(ok.warnings, 5);
    }

    #[test]
    fn test_parse_prepare_ok_rejects_error_status() {
        let data = [0xFF, 0x01, 0x00, 0x00, 0x00, 0x03, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00];
        assert!(StmtPrepareOk::parse(&data).is_err());
        assert!(StmtPrepareOk::parse(&[0x00, 0x01]).is_err());
    }

    #[test]
    fn test_execute_payload_without_params() {
        let payload = stmt_execute_payload(7, &[]).unwrap();
        assert_eq!(payload, [0x17, 7, 0, 0, 0, 0x00, 1, 0, 0, 0]);
    }

    #[test]
    fn test_execute_payload_with_params() {
        let mut a = BindValue::standalone(1);
        a.bind(Value::Int(42)).unwrap();
        let mut b = BindValue::standalone(2);
        b.set_null().unwrap();
        let mut c = BindValue::standalone(3);
        c.bind(Value::Text("hi".into())).unwrap();

        let payload = stmt_execute_payload(1, &[a, b, c]).unwrap();
        let mut r = PacketReader::new(&payload);
        assert_eq!(r.read_u8().unwrap(), Command::StmtExecute as u8);
        assert_eq!(r.read_u32_le().unwrap(), 1);
        r.skip(5).unwrap();
        assert_eq!(r.read_u8().unwrap(), 0b0000_0010);
        assert_eq!(r.read_u8().unwrap(), 1);
        assert_eq!(r.read_u8().unwrap(), FieldType::Long as u8);
        r.skip(1).unwrap();
        assert_eq!(r.read_u8().unwrap(), FieldType::Null as u8);
        r.skip(1).unwrap();
        assert_eq!(r.read_u8().unwrap(), FieldType::VarString as u8);
        r.skip(1).unwrap();
        assert_eq!(r.read_u32_le().unwrap(), 42);
        assert_eq!(r.read_lenenc_string().unwrap(), "hi");
        assert!(r.is_empty());
    }

    #[test]
    fn test_execute_payload_unset_param_fails() {
        let err = stmt_execute_payload(1, &[BindValue::standalone(1)]).unwrap_err();
        assert!(err.to_string().contains("No value specified for parameter 1"));
    }

    #[test]
    fn test_close_payload() {
        assert_eq!(stmt_close_payload(0x0102_0304), [0x19, 4, 3, 2, 1]);
        assert_eq!(stmt_reset_payload(1), [0x1a, 1, 0, 0, 0]);
    }
}
