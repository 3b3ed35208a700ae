//! One reassembled logical message and its reusable buffer.

use std::io::{self, Read};

use sqlwire_core::Result;

use super::reader::PacketReader;
use super::{EofPacket, ErrPacket, MAX_PACKET_SIZE, OkPacket, PacketHeader, PacketType};

/// Initial capacity of a fresh read buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 16 * 1024;

/// A logical protocol message: the concatenated payload of one or more frames.
///
/// The payload buffer is reused between reads. Reading a larger message
/// grows it; [`Message::shrink`] gives memory back after large results.
#[derive(Debug, Clone, Default)]
pub struct Message {
    payload: Vec<u8>,
    first_sequence_id: u8,
    sequence_id: u8,
    frames: usize,
}

impl Message {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            payload: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// A message holding `payload` as if it had been read with `sequence_id`.
    pub fn from_payload(payload: Vec<u8>, sequence_id: u8) -> Self {
        Self {
            payload,
            first_sequence_id: sequence_id,
            sequence_id,
            frames: 1,
        }
    }

    /// Read one logical message from `src`, replacing the current payload.
    ///
    /// Continuation frames (payload length `0xFFFFFF`) are appended until a
    /// shorter frame arrives. Each continuation must carry the next sequence
    /// id, otherwise the read fails with `InvalidData`. A stream that ends
    /// mid-frame yields `UnexpectedEof`.
    pub fn read_from<R: Read + ?Sized>(&mut self, src: &mut R) -> io::Result<()> {
        self.payload.clear();
        self.frames = 0;

        loop {
            let mut header = [0u8; PacketHeader::SIZE];
            src.read_exact(&mut header)?;
            let header = PacketHeader::from_bytes(&header);
            if self.frames == 0 {
                self.first_sequence_id = header.sequence_id;
            } else if header.sequence_id != self.sequence_id.wrapping_add(1) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "Packets out of order: expected continuation sequence {}, received {}",
                        self.sequence_id.wrapping_add(1),
                        header.sequence_id
                    ),
                ));
            }
            self.sequence_id = header.sequence_id;
            self.frames += 1;

            let len = header.payload_length as usize;
            let start = self.payload.len();
            self.payload.resize(start + len, 0);
            src.read_exact(&mut self.payload[start..])?;

            if len < MAX_PACKET_SIZE {
                return Ok(());
            }
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Sequence id of the first frame of this message.
    pub fn first_sequence_id(&self) -> u8 {
        self.first_sequence_id
    }

    /// Sequence id of the last frame of this message.
    pub fn sequence_id(&self) -> u8 {
        self.sequence_id
    }

    /// Number of wire frames the message was reassembled from.
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn capacity(&self) -> usize {
        self.payload.capacity()
    }

    /// Release buffer memory above `capacity`.
    pub fn shrink(&mut self, capacity: usize) {
        self.payload.clear();
        self.payload.shrink_to(capacity);
    }

    pub fn packet_type(&self) -> PacketType {
        match self.payload.first() {
            Some(&first) => PacketType::from_first_byte(first, self.payload.len()),
            None => PacketType::Data,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.packet_type() == PacketType::Ok
    }

    pub fn is_err(&self) -> bool {
        self.packet_type() == PacketType::Error
    }

    pub fn is_eof(&self) -> bool {
        self.packet_type() == PacketType::Eof
    }

    pub fn reader(&self) -> PacketReader<'_> {
        PacketReader::new(&self.payload)
    }

    pub fn parse_ok(&self) -> Result<OkPacket> {
        self.reader().parse_ok_packet()
    }

    pub fn parse_err(&self) -> Result<ErrPacket> {
        self.reader().parse_err_packet()
    }

    pub fn parse_eof(&self) -> Result<EofPacket> {
        self.reader().parse_eof_packet()
    }

    /// Fail with the server error if this message is an ERR packet.
    pub fn check_error(&self) -> Result<()> {
        if self.is_err() {
            return Err(self.parse_err()?.into_error());
        }
        Ok(())
    }
}
