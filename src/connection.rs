//! # BitTorrent Peer Connection
//!
//! One TCP session with one remote peer, owned by exactly one worker.
//!
//! ## Connection States
//!
//! ```text
//! Connecting -> Handshaking -> AwaitingBitfield -> Ready(choked) <-> Ready(unchoked) -> Closed
//! ```
//!
//! [`PeerConnection::connect`] walks the first three states, each under its own deadline,
//! and only returns a connection once it is ready. Ready connections start choked.
//! Dropping the connection closes the socket.

use std::io::{self, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::bitfield::Bitfield;
use crate::config::Config;
use crate::error::{hex, PeerError};
use crate::handshake::Handshake;
use crate::message::Message;
use crate::peer::Peer;

/// A ready connection to a remote peer.
pub struct PeerConnection {
    /// Remote peer address and log id
    peer: Peer,
    /// TCP stream connection to the peer
    conn: TcpStream,
    /// Whether the peer has choked us
    choked: bool,
    /// Pieces the peer has announced
    bitfield: Bitfield,
    /// Peer id the remote side sent in its handshake
    remote_peer_id: [u8; 20],
}

impl PeerConnection {
    /// Dials a peer, exchanges handshakes and waits for its bitfield.
    ///
    /// # Arguments
    ///
    /// * `peer` - Remote peer to dial
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent's info dictionary
    /// * `peer_id` - Our own 20-byte peer id
    /// * `config` - Source of the connect, handshake and bitfield deadlines
    ///
    /// # Returns
    ///
    /// A connection in the choked state, with the peer's bitfield recorded.
    ///
    /// # Errors
    ///
    /// - [`PeerError::Timeout`] if any step exceeds its deadline
    /// - [`PeerError::HandshakeMismatch`] if the peer serves another torrent
    /// - [`PeerError::UnexpectedMessage`] if the first message is not a bitfield
    pub fn connect(
        peer: Peer,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        config: &Config,
    ) -> Result<PeerConnection, PeerError> {
        let mut conn = TcpStream::connect_timeout(&peer.addr, config.connect_timeout)
            .map_err(|e| PeerError::io(e, "connecting to peer"))?;

        debug!("Connected to peer {}", peer);

        let handshake = shake_hands(&mut conn, info_hash, peer_id, config.handshake_timeout)?;

        debug!("Completed handshake with peer {}", peer);

        let bitfield = receive_bitfield(&mut conn, config.bitfield_timeout)?;

        info!("Peer {} is ready", peer);

        Ok(PeerConnection {
            peer,
            conn,
            choked: true,
            bitfield,
            remote_peer_id: handshake.peer_id,
        })
    }

    /// Remote peer this connection talks to.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Peer id received in the remote handshake.
    pub fn remote_peer_id(&self) -> &[u8; 20] {
        &self.remote_peer_id
    }

    /// Returns whether the peer currently chokes us.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Records a CHOKE (`true`) or UNCHOKE (`false`) from the peer.
    ///
    /// Requests already sent stay outstanding; new ones wait for the next UNCHOKE.
    pub fn set_choked(&mut self, choked: bool) {
        if choked {
            warn!("Peer {} choked us", self.peer);
        } else {
            debug!("Peer {} unchoked us", self.peer);
        }
        self.choked = choked;
    }

    /// Pieces the peer has announced so far.
    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// Checks if the peer has announced a piece.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index to check
    ///
    /// # Returns
    ///
    /// `true` if the peer has the piece, `false` otherwise or if index is out of bounds.
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has_piece(index)
    }

    /// Records a piece announced by a HAVE message.
    pub fn set_piece(&mut self, index: u32) {
        self.bitfield.set_piece(index);
    }

    /// Bounds every following read and write, or lifts the bound with `None`.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Io`] if the socket rejects the timeout, e.g. a zero duration.
    pub fn set_deadline(&self, timeout: Option<Duration>) -> Result<(), PeerError> {
        set_timeouts(&self.conn, timeout)
    }

    /// Reads the next message. Returns `Ok(None)` for a keep-alive.
    ///
    /// # Errors
    ///
    /// - [`PeerError::Timeout`] if the current deadline passes
    /// - [`PeerError::Malformed`] if the payload does not fit its message kind
    /// - [`PeerError::Io`] if the connection fails
    pub fn read_message(&mut self) -> Result<Option<Message>, PeerError> {
        let message = Message::read(&mut self.conn)?;

        match &message {
            Some(message) => debug!("Receive {} from peer {}", message.name(), self.peer),
            None => debug!("Receive KEEP_ALIVE from peer {}", self.peer),
        }

        Ok(message)
    }

    /// Waits up to `timeout` for incoming data without consuming any of it.
    ///
    /// # Returns
    ///
    /// `true` once at least one byte is ready to read, `false` if `timeout` passes first.
    /// Leaves the socket without a read deadline.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Io`] if the peer closed the connection or the socket fails.
    pub fn poll_readable(&self, timeout: Duration) -> Result<bool, PeerError> {
        // A zero read timeout is rejected by the socket.
        self.conn
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let mut byte = [0u8; 1];
        let readable = match self.conn.peek(&mut byte) {
            Ok(0) => Err(PeerError::Io(io::Error::from(io::ErrorKind::UnexpectedEof))),
            Ok(_) => Ok(true),
            Err(e) => match PeerError::io(e, "waiting for peer") {
                PeerError::Timeout(_) => Ok(false),
                e => Err(e),
            },
        };

        self.conn.set_read_timeout(None)?;
        readable
    }

    /// Tells the peer we want to download from it.
    pub fn send_interested(&mut self) -> Result<(), PeerError> {
        self.send(&Message::Interested)
    }

    /// Tells the peer we no longer want anything from it.
    pub fn send_not_interested(&mut self) -> Result<(), PeerError> {
        self.send(&Message::NotInterested)
    }

    /// Sends an UNCHOKE message. This client never uploads, so the peer gains nothing
    /// from it beyond protocol courtesy.
    pub fn send_unchoke(&mut self) -> Result<(), PeerError> {
        self.send(&Message::Unchoke)
    }

    /// Notifies the peer that a piece was downloaded and verified.
    pub fn send_have(&mut self, index: u32) -> Result<(), PeerError> {
        self.send(&Message::Have(index))
    }

    /// Requests the block `[begin, begin + length)` of a piece.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index
    /// * `begin` - Byte offset of the block within the piece
    /// * `length` - Block size in bytes, at most 16KB
    ///
    /// # Errors
    ///
    /// [`PeerError::Timeout`] or [`PeerError::Io`] if the write fails.
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        debug!(
            "Send REQUEST for piece {} [{}:{}] to peer {}",
            index,
            begin,
            begin + length,
            self.peer
        );

        self.send(&Message::Request {
            index,
            begin,
            length,
        })
    }

    fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        if !matches!(message, Message::Request { .. }) {
            debug!("Send {} to peer {}", message.name(), self.peer);
        }

        self.conn
            .write_all(&message.serialize())
            .map_err(|e| PeerError::io(e, "sending message"))
    }
}

fn set_timeouts(conn: &TcpStream, timeout: Option<Duration>) -> Result<(), PeerError> {
    conn.set_read_timeout(timeout)?;
    conn.set_write_timeout(timeout)?;
    Ok(())
}

/// Sends our handshake and checks that the peer answers for the same torrent.
fn shake_hands(
    conn: &mut TcpStream,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    timeout: Duration,
) -> Result<Handshake, PeerError> {
    set_timeouts(conn, Some(timeout))?;

    let ours = Handshake::new(info_hash, peer_id);
    conn.write_all(&ours.serialize()?)
        .map_err(|e| PeerError::io(e, "sending handshake"))?;

    let theirs = Handshake::read(conn)?;
    if theirs.info_hash != info_hash {
        return Err(PeerError::HandshakeMismatch {
            expected: hex(&info_hash),
            received: hex(&theirs.info_hash),
        });
    }

    set_timeouts(conn, None)?;

    Ok(theirs)
}

/// Reads the first message after the handshake, which must be a bitfield.
fn receive_bitfield(conn: &mut TcpStream, timeout: Duration) -> Result<Bitfield, PeerError> {
    set_timeouts(conn, Some(timeout))?;

    let bitfield = match Message::read(conn).map_err(|e| match e {
        PeerError::Timeout(_) => PeerError::Timeout("waiting for bitfield"),
        e => e,
    })? {
        Some(Message::Bitfield(bits)) => Bitfield::from(bits),
        Some(other) => {
            return Err(PeerError::UnexpectedMessage {
                expected: "BITFIELD",
                received: other.name().to_string(),
            })
        }
        None => {
            return Err(PeerError::UnexpectedMessage {
                expected: "BITFIELD",
                received: "KEEP_ALIVE".to_string(),
            })
        }
    };

    set_timeouts(conn, None)?;

    Ok(bitfield)
}
