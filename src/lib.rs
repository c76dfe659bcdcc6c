//! # Bitpipe BitTorrent Client
//!
//! A BitTorrent client library downloading a single file over the peer wire protocol.
//!
//! ## Architecture
//!
//! - **Coordinator** ([`download`]): seeds a work queue with every piece, spawns one worker
//!   thread per peer and assembles verified pieces into the final buffer
//! - **Workers** ([`worker`]): each one owns a [`connection::PeerConnection`] and pipelines
//!   block requests for the pieces its peer advertises
//! - **Channels**: crossbeam channels carry work items, results and the shutdown signal
//!
//! The [`torrent`] module supplies the inputs of a download (info hash, piece hashes,
//! lengths and peers) from a `.torrent` file and its tracker.

#[macro_use]
extern crate log;

pub mod bitfield;
pub mod config;
pub mod connection;
pub mod download;
pub mod error;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod piece;
pub mod torrent;
pub mod worker;

pub use config::Config;
pub use download::Download;
pub use error::{DownloadError, MalformedMessage, PeerError};
pub use torrent::Torrent;
