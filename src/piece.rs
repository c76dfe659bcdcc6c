//! # BitTorrent Piece Management
//!
//! Pieces are the verification units of a torrent; they are downloaded in smaller
//! blocks (16KB) requested in a pipeline.
//!
//! - [`PieceWork`]: one expected piece, as queued by the coordinator
//! - [`PieceProgress`]: the in-flight download of one piece on one connection
//! - [`PieceResult`]: a verified piece handed back to the coordinator
//!
//! ## Pipelining
//!
//! [`PieceProgress`] hands out block requests in ascending offset order until either
//! the whole piece is requested or the backlog limit is reached. Responses may arrive
//! in any order: each block is placed by the offset it carries. A block that answers
//! no outstanding request (unsolicited, duplicated or resized) is dropped, so
//! `downloaded` never runs ahead of `requested`.

use sha1::{Digest, Sha1};

use crate::error::{MalformedMessage, PeerError};
use crate::message::{check_block, copy_block};

/// One piece waiting to be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Expected SHA-1 hash of the piece
    pub hash: [u8; 20],
    /// Length of the piece in bytes; only the last piece may be shorter
    pub length: u32,
}

/// A downloaded piece whose hash matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceResult {
    pub index: u32,
    pub data: Vec<u8>,
}

/// A block request to put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl PieceWork {
    pub fn new(index: u32, hash: [u8; 20], length: u32) -> PieceWork {
        PieceWork {
            index,
            hash,
            length,
        }
    }

    /// Checks downloaded data against the expected hash.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::IntegrityFailure`] on mismatch.
    pub fn verify(&self, data: &[u8]) -> Result<(), PeerError> {
        let hash = Sha1::digest(data);

        if hash[..] != self.hash[..] {
            return Err(PeerError::IntegrityFailure(self.index));
        }

        Ok(())
    }
}

/// Download state of one piece on one connection.
#[derive(Debug)]
pub struct PieceProgress {
    index: u32,
    buf: Vec<u8>,
    /// Bytes received and copied into `buf`
    downloaded: usize,
    /// Bytes requested so far; requests go out in ascending offset order
    requested: usize,
    /// Requests sent but not answered yet
    pending: Vec<BlockRequest>,
    max_backlog: usize,
    max_block_size: u32,
}

impl PieceProgress {
    /// Starts the download of one piece.
    ///
    /// # Arguments
    ///
    /// * `work` - Piece to download
    /// * `max_backlog` - Most requests allowed in flight at once
    /// * `max_block_size` - Largest block asked for in one request
    pub fn new(work: &PieceWork, max_backlog: usize, max_block_size: u32) -> PieceProgress {
        PieceProgress {
            index: work.index,
            buf: vec![0; work.length as usize],
            downloaded: 0,
            requested: 0,
            pending: Vec::with_capacity(max_backlog),
            max_backlog,
            max_block_size,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn downloaded(&self) -> usize {
        self.downloaded
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Number of requests sent but not answered yet.
    pub fn backlog(&self) -> usize {
        self.pending.len()
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.buf.len()
    }

    /// Returns the next block to request, or `None` once the backlog is full or the
    /// whole piece has been requested.
    pub fn next_request(&mut self) -> Option<BlockRequest> {
        if self.pending.len() >= self.max_backlog || self.requested >= self.buf.len() {
            return None;
        }

        let remaining = self.buf.len() - self.requested;
        let length = remaining.min(self.max_block_size as usize);
        let request = BlockRequest {
            index: self.index,
            begin: self.requested as u32,
            length: length as u32,
        };

        self.pending.push(request);
        self.requested += length;

        Some(request)
    }

    /// Places a received block.
    ///
    /// # Returns
    ///
    /// `true` if the block answered an outstanding request and was copied, `false` if
    /// it matched none and was dropped.
    ///
    /// # Errors
    ///
    /// A [`MalformedMessage`] if the block does not belong to this piece or does not fit
    /// in it. On error nothing is changed.
    pub fn receive_block(
        &mut self,
        index: u32,
        begin: u32,
        block: &[u8],
    ) -> Result<bool, MalformedMessage> {
        let answered = self.pending.iter().position(|request| {
            request.index == index
                && request.begin == begin
                && request.length as usize == block.len()
        });

        let Some(position) = answered else {
            check_block(self.index, self.buf.len(), index, begin, block.len())?;
            return Ok(false);
        };

        let n = copy_block(self.index, &mut self.buf, index, begin, block)?;
        self.pending.swap_remove(position);
        self.downloaded += n;

        Ok(true)
    }

    /// Consumes the state and returns the assembled piece.
    pub fn into_data(self) -> Vec<u8> {
        self.buf
    }
}
