//! # Download Coordination
//!
//! The coordinator turns a piece layout and a peer list into the assembled file.
//!
//! 1. **Seed** a bounded work queue with one [`PieceWork`] per piece
//! 2. **Spawn** one [`Worker`] thread per peer
//! 3. **Collect** verified pieces in completion order and copy each one to its
//!    offset in the final buffer
//! 4. **Shut down** the workers once every piece is in
//!
//! The run fails instead of hanging when every worker has exited with pieces still
//! outstanding, or when the optional stall timeout passes without a new piece.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, unbounded, RecvTimeoutError};
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::Config;
use crate::error::DownloadError;
use crate::peer::Peer;
use crate::piece::{PieceResult, PieceWork};
use crate::worker::Worker;

/// One download run: what to fetch and whom to fetch it from.
#[derive(Debug, Clone)]
pub struct Download {
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    /// Expected SHA-1 hash of every piece, in index order
    piece_hashes: Vec<[u8; 20]>,
    /// Size of each piece in bytes (except possibly the last)
    piece_length: u32,
    /// Total size of the file in bytes
    length: usize,
    peers: Vec<Peer>,
    config: Config,
}

impl Download {
    /// Describes a download.
    ///
    /// # Arguments
    ///
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent's info dictionary
    /// * `peer_id` - Our own 20-byte peer id
    /// * `piece_hashes` - Expected SHA-1 hash of every piece, in index order
    /// * `piece_length` - Size of each piece in bytes (except possibly the last)
    /// * `length` - Total size of the file in bytes
    /// * `peers` - Peers to download from, one worker each
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidLayout`] if the number of piece hashes does not
    /// match the total length split into pieces of `piece_length` bytes.
    pub fn new(
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        piece_hashes: Vec<[u8; 20]>,
        piece_length: u32,
        length: u64,
        peers: Vec<Peer>,
    ) -> Result<Download, DownloadError> {
        let length = usize::try_from(length)
            .map_err(|_| DownloadError::InvalidLayout(format!("length {} is too large", length)))?;

        if piece_length == 0 && length > 0 {
            return Err(DownloadError::InvalidLayout("piece length is 0".into()));
        }
        let expected = if length == 0 {
            0
        } else {
            length.div_ceil(piece_length as usize)
        };
        if piece_hashes.len() != expected {
            return Err(DownloadError::InvalidLayout(format!(
                "{} bytes in pieces of {} bytes make {} pieces, got {} hashes",
                length,
                piece_length,
                expected,
                piece_hashes.len()
            )));
        }
        if u32::try_from(expected).is_err() {
            return Err(DownloadError::InvalidLayout(format!(
                "{} pieces exceed the protocol limit",
                expected
            )));
        }

        Ok(Download {
            info_hash,
            peer_id,
            piece_hashes,
            piece_length,
            length,
            peers,
            config: Config::default(),
        })
    }

    /// Replaces the default timeouts and limits.
    pub fn with_config(mut self, config: Config) -> Download {
        self.config = config;
        self
    }

    /// Number of pieces in the file.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte range `[begin, end)` of a piece within the file.
    pub fn piece_bounds(&self, index: u32) -> (usize, usize) {
        let begin = (index as usize).saturating_mul(self.piece_length as usize);
        let end = begin.saturating_add(self.piece_length as usize).min(self.length);
        (begin.min(self.length), end)
    }

    /// Builds the initial work items, one per piece.
    pub fn piece_works(&self) -> Vec<PieceWork> {
        self.piece_hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                let index = index as u32;
                let (begin, end) = self.piece_bounds(index);
                PieceWork::new(index, *hash, (end - begin) as u32)
            })
            .collect()
    }

    /// Downloads every piece and returns the assembled file.
    ///
    /// # Returns
    ///
    /// A buffer of exactly `length` bytes, each piece at its offset.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::NoPeers`] if there is no peer to download from
    /// - [`DownloadError::PeersExhausted`] once every worker has exited early, whether
    ///   its peer failed or had none of the remaining pieces
    /// - [`DownloadError::Stalled`] if a stall timeout is set and passes without a piece
    pub fn run(&self) -> Result<Vec<u8>, DownloadError> {
        let nb_pieces = self.piece_count();
        if nb_pieces == 0 {
            return Ok(vec![]);
        }
        if self.peers.is_empty() {
            return Err(DownloadError::NoPeers);
        }

        let work_chan = bounded::<PieceWork>(nb_pieces);
        let (result_tx, result_rx) = unbounded::<PieceResult>();
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        for piece_work in self.piece_works() {
            // Capacity equals the piece count, so seeding never blocks.
            if work_chan.0.try_send(piece_work).is_err() {
                return Err(DownloadError::InvalidLayout(
                    "work queue rejected a piece".into(),
                ));
            }
        }

        let config = Arc::new(self.config.clone());
        for peer in &self.peers {
            let worker = Worker::new(
                *peer,
                self.info_hash,
                self.peer_id,
                Arc::clone(&config),
                work_chan.clone(),
                result_tx.clone(),
                shutdown_rx.clone(),
            );

            thread::spawn(move || {
                worker.start_download();
            });
        }

        // Only workers hold senders from now on: their exit disconnects the channel.
        drop(result_tx);
        drop(work_chan);
        drop(shutdown_rx);

        let pb = self.progress_bar();

        let mut data: Vec<u8> = vec![0; self.length];
        let mut placed = vec![false; nb_pieces];
        let mut remaining = nb_pieces;

        while remaining > 0 {
            let piece_result = match self.config.stall_timeout {
                Some(timeout) => match result_rx.recv_timeout(timeout) {
                    Ok(piece_result) => piece_result,
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(DownloadError::Stalled {
                            secs: timeout.as_secs(),
                            remaining,
                        })
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(DownloadError::PeersExhausted { remaining })
                    }
                },
                None => result_rx
                    .recv()
                    .map_err(|_| DownloadError::PeersExhausted { remaining })?,
            };

            let index = piece_result.index as usize;
            let (begin, end) = self.piece_bounds(piece_result.index);
            if index >= nb_pieces || placed[index] || piece_result.data.len() != end - begin {
                warn!("Dropping unexpected result for piece {}", index);
                continue;
            }

            data[begin..end].copy_from_slice(&piece_result.data);
            placed[index] = true;
            remaining -= 1;

            pb.inc((end - begin) as u64);
            debug!(
                "Placed piece {} ({}/{} pieces)",
                index,
                nb_pieces - remaining,
                nb_pieces
            );
        }

        // Wake every worker still waiting on the queue.
        drop(shutdown_tx);
        pb.finish();

        Ok(data)
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(self.length as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}
