//! MySQL packet reading utilities.
//!
//! Every read is bounds-checked; running off the end of a payload is a
//! protocol error, never a panic.

#![allow(clippy::cast_possible_truncation)]

use sqlwire_core::{Error, Result};

use crate::protocol::{EofPacket, ErrPacket, OkPacket};

/// A cursor over one message payload.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes left after the cursor.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Peek at the next byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn truncated(&self, needed: usize) -> Error {
        Error::protocol(format!(
            "packet truncated: needed {needed} bytes at offset {}, {} remaining",
            self.pos,
            self.remaining()
        ))
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(self.truncated(len));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    /// Read a u24 (little-endian, 3 bytes).
    pub fn read_u24_le(&mut self) -> Result<u32> {
        let [a, b, c] = self.read_array()?;
        Ok(u32::from(a) | (u32::from(b) << 8) | (u32::from(c) << 16))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    pub fn read_f32_le(&mut self) -> Result<f32> {
        self.read_array().map(f32::from_le_bytes)
    }

    pub fn read_f64_le(&mut self) -> Result<f64> {
        self.read_array().map(f64::from_le_bytes)
    }

    /// Read a length-encoded integer that may be the NULL marker.
    ///
    /// - 0x00-0xFA: 1-byte value
    /// - 0xFB: NULL
    /// - 0xFC: 2-byte value follows
    /// - 0xFD: 3-byte value follows
    /// - 0xFE: 8-byte value follows
    pub fn read_lenenc_int_nullable(&mut self) -> Result<Option<u64>> {
        let first = self.read_u8()?;
        match first {
            0x00..=0xFA => Ok(Some(u64::from(first))),
            0xFB => Ok(None),
            0xFC => self.read_u16_le().map(|v| Some(u64::from(v))),
            0xFD => self.read_u24_le().map(|v| Some(u64::from(v))),
            0xFE => self.read_u64_le().map(Some),
            0xFF => Err(Error::protocol(format!(
                "invalid length-encoded integer prefix 0xFF at offset {}",
                self.pos - 1
            ))),
        }
    }

    /// Read a length-encoded integer; NULL is a protocol error here.
    pub fn read_lenenc_int(&mut self) -> Result<u64> {
        self.read_lenenc_int_nullable()?.ok_or_else(|| {
            Error::protocol(format!(
                "unexpected NULL length marker at offset {}",
                self.pos - 1
            ))
        })
    }

    fn lenenc_len(&self, len: u64) -> Result<usize> {
        usize::try_from(len).map_err(|_| self.truncated(usize::MAX))
    }

    /// Read length-encoded bytes.
    pub fn read_lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_lenenc_int()?;
        let len = self.lenenc_len(len)?;
        self.read_bytes(len)
    }

    /// Read length-encoded bytes, `None` for the NULL marker (text rows).
    pub fn read_lenenc_bytes_nullable(&mut self) -> Result<Option<&'a [u8]>> {
        match self.read_lenenc_int_nullable()? {
            Some(len) => {
                let len = self.lenenc_len(len)?;
                self.read_bytes(len).map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn read_lenenc_string(&mut self) -> Result<String> {
        self.read_lenenc_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read a null-terminated byte string. A missing terminator consumes the
    /// rest of the payload.
    pub fn read_null_bytes(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                &rest[..end]
            }
            None => {
                self.pos = self.data.len();
                rest
            }
        }
    }

    pub fn read_null_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_null_bytes()).into_owned()
    }

    /// Read a fixed-length string.
    pub fn read_string(&mut self, len: usize) -> Result<String> {
        self.read_bytes(len)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read remaining bytes.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    /// Parse an OK packet (protocol 4.1). The leading 0x00 or 0xFE marker
    /// is skipped if present.
    pub fn parse_ok_packet(&mut self) -> Result<OkPacket> {
        if matches!(self.peek(), Some(0x00 | 0xFE)) {
            self.skip(1)?;
        }

        let affected_rows = self.read_lenenc_int()?;
        let last_insert_id = self.read_lenenc_int()?;
        let status_flags = self.read_u16_le()?;
        let warnings = self.read_u16_le()?;
        let info = self.read_rest_string();

        Ok(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }

    /// Parse an ERR packet (protocol 4.1): code, optional `#` + SQLSTATE,
    /// message.
    pub fn parse_err_packet(&mut self) -> Result<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.skip(1)?;
        }

        let error_code = self.read_u16_le()?;
        let sql_state = if self.peek() == Some(b'#') {
            self.skip(1)?;
            self.read_string(5)?
        } else {
            String::new()
        };
        let error_message = self.read_rest_string();

        Ok(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// Parse an EOF packet: warnings, status flags.
    pub fn parse_eof_packet(&mut self) -> Result<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.skip(1)?;
        }

        let warnings = self.read_u16_le()?;
        let status_flags = self.read_u16_le()?;

        Ok(EofPacket {
            warnings,
            status_flags,
        })
    }
}
