//! # Peer Bitfield
//!
//! Compact record of the pieces a remote peer has announced.
//!
//! - Each byte represents 8 pieces
//! - Bit 7 (MSB) = piece index 0, bit 0 (LSB) = piece index 7
//! - Pieces are only ever gained for the lifetime of a connection

/// Bit-packed set of piece indices owned by a peer.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
}

impl Bitfield {
    /// Creates an empty bitfield able to hold `piece_count` pieces.
    pub fn new(piece_count: usize) -> Self {
        Bitfield {
            bits: vec![0; piece_count.div_ceil(8)],
        }
    }

    /// Number of piece indices this bitfield can represent.
    pub fn capacity(&self) -> usize {
        self.bits.len() * 8
    }

    /// Returns `true` if the peer has the piece; any out of range index is absent.
    ///
    /// ```text
    /// Byte 0: [piece 0, 1, 2, 3, 4, 5, 6, 7]
    /// Byte 1: [piece 8, 9, 10, 11, 12, 13, 14, 15]
    /// ```
    pub fn has_piece(&self, index: u32) -> bool {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        match self.bits.get(byte_index) {
            Some(byte) => byte >> (7 - offset) & 1 != 0,
            None => false,
        }
    }

    /// Marks a piece as owned. Out of range indices are ignored.
    pub fn set_piece(&mut self, index: u32) {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        if let Some(byte) = self.bits.get_mut(byte_index) {
            *byte |= 1 << (7 - offset);
        }
    }

    /// Raw bytes, as sent in a bitfield message.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

impl From<Vec<u8>> for Bitfield {
    fn from(bits: Vec<u8>) -> Self {
        Bitfield { bits }
    }
}
