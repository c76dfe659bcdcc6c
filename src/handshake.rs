//! # BitTorrent Handshake Protocol
//!
//! The handshake is the first message sent on a connection, once in each direction.
//!
//! ## Message Format
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - Length of protocol string (19 for "BitTorrent protocol")
//! - **pstr**: Variable - Protocol identifier
//! - **reserved**: 8 bytes - All zeros, no extensions are negotiated
//! - **info_hash**: 20 bytes - SHA-1 hash of the torrent info dictionary
//! - **peer_id**: 20 bytes - Identifier of the sending peer
//!
//! Reserved bytes received from the remote side are read and discarded.

use std::io::Read;

use crate::error::PeerError;

pub const PROTOCOL_ID: &str = "BitTorrent protocol";

const RESERVED_LEN: usize = 8;
const HASH_LEN: usize = 20;

/// A decoded or outgoing handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol identifier bytes
    pub pstr: Vec<u8>,
    /// SHA-1 hash of the torrent's info dictionary
    pub info_hash: [u8; 20],
    /// Identifier of the peer sending this handshake
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Creates a handshake for the standard BitTorrent protocol.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake::with_protocol(PROTOCOL_ID, info_hash, peer_id)
    }

    /// Creates a handshake carrying an arbitrary protocol identifier.
    pub fn with_protocol(pstr: &str, info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake {
            pstr: pstr.as_bytes().to_vec(),
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake for network transmission.
    ///
    /// Total size is always 49 + pstrlen bytes (68 bytes for the standard protocol).
    pub fn serialize(&self) -> Result<Vec<u8>, PeerError> {
        let pstrlen = match u8::try_from(self.pstr.len()) {
            Ok(len) if len > 0 => len,
            _ => {
                return Err(PeerError::Protocol(format!(
                    "protocol identifier must be 1 to 255 bytes, got {}",
                    self.pstr.len()
                )))
            }
        };

        let mut serialized = Vec::with_capacity(1 + self.pstr.len() + RESERVED_LEN + 2 * HASH_LEN);
        serialized.push(pstrlen);
        serialized.extend_from_slice(&self.pstr);
        serialized.extend_from_slice(&[0; RESERVED_LEN]);
        serialized.extend_from_slice(&self.info_hash);
        serialized.extend_from_slice(&self.peer_id);

        Ok(serialized)
    }

    /// Reads a handshake from a stream.
    ///
    /// The length byte comes first; everything after it is read as one fixed block.
    ///
    /// # Errors
    ///
    /// - [`PeerError::Protocol`] if the protocol identifier length is 0
    /// - [`PeerError::Io`] or [`PeerError::Timeout`] on a short read
    pub fn read<R: Read>(reader: &mut R) -> Result<Handshake, PeerError> {
        let mut len_buf = [0; 1];
        reader
            .read_exact(&mut len_buf)
            .map_err(|e| PeerError::io(e, "reading handshake"))?;

        let pstrlen = len_buf[0] as usize;
        if pstrlen == 0 {
            return Err(PeerError::Protocol(
                "handshake protocol identifier length is 0".into(),
            ));
        }

        let mut buf = vec![0; pstrlen + RESERVED_LEN + 2 * HASH_LEN];
        reader
            .read_exact(&mut buf)
            .map_err(|e| PeerError::io(e, "reading handshake"))?;

        let hashes_at = pstrlen + RESERVED_LEN;
        let mut info_hash = [0; HASH_LEN];
        info_hash.copy_from_slice(&buf[hashes_at..hashes_at + HASH_LEN]);
        let mut peer_id = [0; HASH_LEN];
        peer_id.copy_from_slice(&buf[hashes_at + HASH_LEN..]);

        Ok(Handshake {
            pstr: buf[..pstrlen].to_vec(),
            info_hash,
            peer_id,
        })
    }
}
