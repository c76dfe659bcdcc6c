//! # Errors
//!
//! Error types raised by the peer wire engine.
//!
//! - [`PeerError`]: everything that can go wrong on one connection
//! - [`MalformedMessage`]: payload validation failures, one variant per offending field
//! - [`DownloadError`]: failures of the whole run, reported by the coordinator

use std::io;

use thiserror::Error;

/// Errors local to one peer connection.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error("handshake mismatch: expected info hash {expected}, got {received}")]
    HandshakeMismatch { expected: String, received: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("malformed message: {0}")]
    Malformed(#[from] MalformedMessage),

    #[error("unexpected message: expected {expected}, got {received}")]
    UnexpectedMessage {
        expected: &'static str,
        received: String,
    },

    #[error("piece {0} failed integrity check")]
    IntegrityFailure(u32),
}

impl PeerError {
    /// Classifies an I/O error raised while `context` was in progress.
    ///
    /// Socket reads and writes that exceed their deadline surface as `WouldBlock`
    /// (Unix) or `TimedOut` (Windows); both become [`PeerError::Timeout`].
    pub fn io(err: io::Error, context: &'static str) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => PeerError::Timeout(context),
            _ => PeerError::Io(err),
        }
    }

    /// Whether the connection must be abandoned after this error.
    ///
    /// Only a failed hash check leaves the connection usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PeerError::IntegrityFailure(_))
    }
}

impl From<io::Error> for PeerError {
    fn from(err: io::Error) -> Self {
        PeerError::io(err, "exchanging data with peer")
    }
}

/// A message whose payload does not fit its kind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedMessage {
    #[error("piece payload too short: {0} < 8")]
    PieceTooShort(usize),

    #[error("expected piece index {expected}, got {received}")]
    IndexMismatch { expected: u32, received: u32 },

    #[error("begin offset too high: {begin} >= {length}")]
    BeginOutOfBounds { begin: u32, length: usize },

    #[error("data too long [{data_len}] for offset {begin} with length {length}")]
    BlockOutOfBounds {
        begin: u32,
        data_len: usize,
        length: usize,
    },

    #[error("{kind} payload must be {expected} bytes, got {received}")]
    PayloadLength {
        kind: &'static str,
        expected: usize,
        received: usize,
    },
}

/// Failures of a whole download run.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("no peers to download from")]
    NoPeers,

    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    #[error("every peer disconnected with {remaining} pieces outstanding")]
    PeersExhausted { remaining: usize },

    #[error("no piece completed for {secs}s with {remaining} pieces outstanding")]
    Stalled { secs: u64, remaining: usize },
}

/// Lowercase hexadecimal rendering of a byte string.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
