//! # BitTorrent Peer Wire Messages
//!
//! Framing and typed decoding of every message exchanged after the handshake.
//!
//! ## Message Structure
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length Prefix**: 4 bytes (big-endian u32) - Total length of message ID + payload
//! - **Message ID**: 1 byte - Identifies the message type
//! - **Payload**: Variable length - Message-specific data
//!
//! ## Message Types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | raw bitfield |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block |
//! | 8 | CANCEL | index, begin, length |
//!
//! A frame of length 0 is a keep-alive: [`Message::read`] returns `Ok(None)` for it.
//! Ids outside this table decode to [`Message::Unknown`] so that callers can skip them.

use std::io::Read;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use crate::error::{MalformedMessage, PeerError};

pub type MessageId = u8;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
pub const MESSAGE_CANCEL: MessageId = 8;

/// Serialized keep-alive frame.
pub const KEEP_ALIVE: [u8; 4] = [0; 4];

/// Largest frame accepted from a peer: a 1MB payload plus the piece header.
pub const MAX_FRAME_LEN: usize = (1 << 20) + 9;

/// One decoded peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    /// A message id this client does not implement
    Unknown { id: MessageId, payload: Vec<u8> },
}

impl Message {
    /// Numeric id written on the wire.
    pub fn id(&self) -> MessageId {
        match self {
            Message::Choke => MESSAGE_CHOKE,
            Message::Unchoke => MESSAGE_UNCHOKE,
            Message::Interested => MESSAGE_INTERESTED,
            Message::NotInterested => MESSAGE_NOT_INTERESTED,
            Message::Have(_) => MESSAGE_HAVE,
            Message::Bitfield(_) => MESSAGE_BITFIELD,
            Message::Request { .. } => MESSAGE_REQUEST,
            Message::Piece { .. } => MESSAGE_PIECE,
            Message::Cancel { .. } => MESSAGE_CANCEL,
            Message::Unknown { id, .. } => *id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Choke => "CHOKE",
            Message::Unchoke => "UNCHOKE",
            Message::Interested => "INTERESTED",
            Message::NotInterested => "NOT_INTERESTED",
            Message::Have(_) => "HAVE",
            Message::Bitfield(_) => "BITFIELD",
            Message::Request { .. } => "REQUEST",
            Message::Piece { .. } => "PIECE",
            Message::Cancel { .. } => "CANCEL",
            Message::Unknown { .. } => "UNKNOWN",
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                vec![]
            }
            Message::Have(index) => index.to_be_bytes().to_vec(),
            Message::Bitfield(bits) => bits.clone(),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                let mut payload = vec![0; 12];
                BigEndian::write_u32(&mut payload[0..4], *index);
                BigEndian::write_u32(&mut payload[4..8], *begin);
                BigEndian::write_u32(&mut payload[8..12], *length);
                payload
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                let mut payload = vec![0; 8 + block.len()];
                BigEndian::write_u32(&mut payload[0..4], *index);
                BigEndian::write_u32(&mut payload[4..8], *begin);
                payload[8..].copy_from_slice(block);
                payload
            }
            Message::Unknown { payload, .. } => payload.clone(),
        }
    }

    /// Serializes the message into a length-prefixed frame.
    pub fn serialize(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut serialized = vec![0; 5];
        BigEndian::write_u32(&mut serialized[0..4], 1 + payload.len() as u32);
        serialized[4] = self.id();
        serialized.extend_from_slice(&payload);
        serialized
    }

    /// Decodes a message body, validating the payload length of every known kind.
    pub fn decode(id: MessageId, payload: Vec<u8>) -> Result<Message, MalformedMessage> {
        let message = match id {
            MESSAGE_CHOKE | MESSAGE_UNCHOKE | MESSAGE_INTERESTED | MESSAGE_NOT_INTERESTED => {
                if !payload.is_empty() {
                    return Err(MalformedMessage::PayloadLength {
                        kind: kind_name(id),
                        expected: 0,
                        received: payload.len(),
                    });
                }
                match id {
                    MESSAGE_CHOKE => Message::Choke,
                    MESSAGE_UNCHOKE => Message::Unchoke,
                    MESSAGE_INTERESTED => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            MESSAGE_HAVE => {
                expect_len("HAVE", &payload, 4)?;
                Message::Have(BigEndian::read_u32(&payload))
            }
            MESSAGE_BITFIELD => Message::Bitfield(payload),
            MESSAGE_REQUEST | MESSAGE_CANCEL => {
                expect_len(kind_name(id), &payload, 12)?;
                let index = BigEndian::read_u32(&payload[0..4]);
                let begin = BigEndian::read_u32(&payload[4..8]);
                let length = BigEndian::read_u32(&payload[8..12]);
                if id == MESSAGE_REQUEST {
                    Message::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length,
                    }
                }
            }
            MESSAGE_PIECE => {
                if payload.len() < 8 {
                    return Err(MalformedMessage::PieceTooShort(payload.len()));
                }
                Message::Piece {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    block: payload[8..].to_vec(),
                }
            }
            _ => Message::Unknown { id, payload },
        };

        Ok(message)
    }

    /// Reads the next frame from a stream.
    ///
    /// Returns `Ok(None)` for a keep-alive.
    ///
    /// # Errors
    ///
    /// - [`PeerError::Io`] or [`PeerError::Timeout`] on a short read
    /// - [`PeerError::Protocol`] if the frame exceeds [`MAX_FRAME_LEN`]
    /// - [`PeerError::Malformed`] if the payload does not fit the message kind
    pub fn read<R: Read>(reader: &mut R) -> Result<Option<Message>, PeerError> {
        let message_len = reader
            .read_u32::<BigEndian>()
            .map_err(|e| PeerError::io(e, "reading message length"))?
            as usize;

        if message_len == 0 {
            return Ok(None);
        }
        if message_len > MAX_FRAME_LEN {
            return Err(PeerError::Protocol(format!(
                "frame of length {} is too large",
                message_len
            )));
        }

        let mut message_buf = vec![0; message_len];
        reader
            .read_exact(&mut message_buf)
            .map_err(|e| PeerError::io(e, "reading message"))?;

        let payload = message_buf.split_off(1);
        let message = Message::decode(message_buf[0], payload)?;

        Ok(Some(message))
    }
}

fn kind_name(id: MessageId) -> &'static str {
    match id {
        MESSAGE_CHOKE => "CHOKE",
        MESSAGE_UNCHOKE => "UNCHOKE",
        MESSAGE_INTERESTED => "INTERESTED",
        MESSAGE_NOT_INTERESTED => "NOT_INTERESTED",
        MESSAGE_REQUEST => "REQUEST",
        MESSAGE_CANCEL => "CANCEL",
        _ => "UNKNOWN",
    }
}

fn expect_len(kind: &'static str, payload: &[u8], expected: usize) -> Result<(), MalformedMessage> {
    if payload.len() != expected {
        return Err(MalformedMessage::PayloadLength {
            kind,
            expected,
            received: payload.len(),
        });
    }
    Ok(())
}

/// Checks that a block of `block_len` bytes at `begin` belongs to piece `expected_index`
/// and fits a piece of `piece_len` bytes.
///
/// # Errors
///
/// One [`MalformedMessage`] variant per check, in this order: piece index, begin
/// offset, block end.
pub fn check_block(
    expected_index: u32,
    piece_len: usize,
    index: u32,
    begin: u32,
    block_len: usize,
) -> Result<(), MalformedMessage> {
    if index != expected_index {
        return Err(MalformedMessage::IndexMismatch {
            expected: expected_index,
            received: index,
        });
    }

    let start = begin as usize;
    if start >= piece_len {
        return Err(MalformedMessage::BeginOutOfBounds {
            begin,
            length: piece_len,
        });
    }
    if block_len > piece_len - start {
        return Err(MalformedMessage::BlockOutOfBounds {
            begin,
            data_len: block_len,
            length: piece_len,
        });
    }

    Ok(())
}

/// Copies a received block into the buffer of the piece being downloaded.
///
/// Returns the number of bytes copied.
///
/// # Errors
///
/// Same checks as [`check_block`]. On error the buffer is left untouched.
pub fn copy_block(
    expected_index: u32,
    buf: &mut [u8],
    index: u32,
    begin: u32,
    block: &[u8],
) -> Result<usize, MalformedMessage> {
    check_block(expected_index, buf.len(), index, begin, block.len())?;

    let start = begin as usize;
    buf[start..start + block.len()].copy_from_slice(block);

    Ok(block.len())
}
