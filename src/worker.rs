//! # BitTorrent Worker Thread
//!
//! A worker manages downloading from a single peer, in its own thread.
//!
//! ## Download Process
//!
//! 1. **Connection**: establish a [`PeerConnection`] (handshake and bitfield)
//! 2. **Interest**: send UNCHOKE and INTERESTED
//! 3. **Work loop**: pull a [`PieceWork`] from the shared queue
//!    - the peer lacks the piece: put it back and pull the next one
//!    - otherwise pipeline block requests until the piece is complete
//! 4. **Verification**: SHA-1 check, then HAVE to the peer and the result to the coordinator
//!
//! ## Error Handling
//!
//! The work item in hand always goes back to the queue on failure. A failed hash check
//! keeps the connection; any other error ends the worker.
//!
//! ## Idle Peers
//!
//! After skipping every queued piece, the worker listens to the socket for
//! `peer_miss_backoff`, so HAVE messages can open up new pieces. A peer that stays
//! without any queued piece for `peer_idle_timeout` is dropped; once every worker is
//! gone the coordinator reports the run as exhausted instead of waiting forever.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{select, Receiver, Sender};

use crate::config::Config;
use crate::connection::PeerConnection;
use crate::error::PeerError;
use crate::message::Message;
use crate::peer::Peer;
use crate::piece::{PieceProgress, PieceResult, PieceWork};

/// What became of one work item.
#[derive(Debug)]
pub enum Step {
    /// The peer does not have the piece; it went back to the queue
    Skipped,
    /// The piece was verified and published
    Delivered,
    /// The piece failed verification and went back to the queue
    Retry(PeerError),
    /// The connection is unusable; the piece went back to the queue
    Abort(PeerError),
    /// The coordinator stopped listening; nothing is left to do
    Closed,
}

/// Downloads pieces from one peer.
pub struct Worker {
    /// Remote peer to download from
    peer: Peer,
    /// SHA-1 hash of the torrent's info dictionary
    info_hash: [u8; 20],
    /// Our own peer id
    peer_id: [u8; 20],
    config: Arc<Config>,
    /// Shared queue: pieces are pulled from it and put back on failure
    work_chan: (Sender<PieceWork>, Receiver<PieceWork>),
    /// Verified pieces for the coordinator
    result_tx: Sender<PieceResult>,
    /// Disconnected by the coordinator once every piece is in
    shutdown_rx: Receiver<()>,
}

impl Worker {
    /// Creates a worker for one peer.
    ///
    /// # Arguments
    ///
    /// * `peer` - Remote peer to download from
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent's info dictionary
    /// * `peer_id` - Our own 20-byte peer id
    /// * `config` - Timeouts and pipelining limits shared by every worker
    /// * `work_chan` - Both ends of the shared work queue
    /// * `result_tx` - Where verified pieces are published
    /// * `shutdown_rx` - Disconnected by the coordinator once the download is complete
    pub fn new(
        peer: Peer,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        config: Arc<Config>,
        work_chan: (Sender<PieceWork>, Receiver<PieceWork>),
        result_tx: Sender<PieceResult>,
        shutdown_rx: Receiver<()>,
    ) -> Worker {
        Worker {
            peer,
            info_hash,
            peer_id,
            config,
            work_chan,
            result_tx,
            shutdown_rx,
        }
    }

    /// Runs the worker until the download completes or the peer fails.
    pub fn start_download(self) {
        let mut conn =
            match PeerConnection::connect(self.peer, self.info_hash, self.peer_id, &self.config) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Could not connect to peer {}: {}", self.peer, e);
                    return;
                }
            };

        if let Err(e) = conn.send_unchoke() {
            warn!("Could not send UNCHOKE to peer {}: {}", self.peer, e);
            return;
        }
        if let Err(e) = conn.send_interested() {
            warn!("Could not send INTERESTED to peer {}: {}", self.peer, e);
            return;
        }

        // Consecutive pieces skipped because the peer lacks them
        let mut misses = 0;
        // Start of the current stretch without any piece this peer could serve
        let mut idle_since: Option<Instant> = None;

        loop {
            let piece_work = select! {
                recv(self.work_chan.1) -> piece_work => match piece_work {
                    Ok(piece_work) => piece_work,
                    Err(_) => {
                        info!("Worker for peer {} exiting: work queue closed", self.peer);
                        return;
                    }
                },
                recv(self.shutdown_rx) -> _ => {
                    info!("Worker for peer {} exiting: download complete", self.peer);
                    return;
                }
            };

            match self.handle(&mut conn, piece_work) {
                Step::Skipped => {
                    misses += 1;
                    if misses < self.work_chan.1.len().max(1) {
                        continue;
                    }
                    // Every queued piece was seen without a usable one.
                    misses = 0;

                    match self.wait_for_news(&mut conn) {
                        Ok(true) => idle_since = None,
                        Ok(false) => {
                            let since = *idle_since.get_or_insert_with(Instant::now);
                            if since.elapsed() >= self.config.peer_idle_timeout {
                                info!(
                                    "Worker for peer {} exiting: peer has none of the remaining pieces",
                                    self.peer
                                );
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("Worker for peer {} exiting: {}", self.peer, e);
                            return;
                        }
                    }
                }
                Step::Delivered | Step::Retry(_) => {
                    misses = 0;
                    idle_since = None;
                }
                Step::Abort(e) => {
                    warn!("Worker for peer {} exiting: {}", self.peer, e);
                    return;
                }
                Step::Closed => {
                    info!("Worker for peer {} exiting: coordinator is gone", self.peer);
                    return;
                }
            }
        }
    }

    /// Listens to the peer for `peer_miss_backoff`.
    ///
    /// # Returns
    ///
    /// `true` if the peer announced a new piece meanwhile.
    fn wait_for_news(&self, conn: &mut PeerConnection) -> Result<bool, PeerError> {
        let deadline = Instant::now() + self.config.peer_miss_backoff;
        let mut news = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !conn.poll_readable(remaining)? {
                return Ok(news);
            }

            // Data is waiting: read the whole frame under the piece deadline.
            conn.set_deadline(Some(self.config.piece_timeout))?;
            let message = conn.read_message();
            conn.set_deadline(None)?;

            match message? {
                Some(Message::Have(index)) => {
                    let known = conn.has_piece(index);
                    conn.set_piece(index);
                    news |= !known && conn.has_piece(index);
                }
                Some(Message::Choke) => conn.set_choked(true),
                Some(Message::Unchoke) => conn.set_choked(false),
                Some(other) => debug!("Ignoring {} from peer {}", other.name(), conn.peer()),
                None => {}
            }
        }
    }

    /// Processes one work item on an established connection.
    ///
    /// # Arguments
    ///
    /// * `conn` - Ready connection to this worker's peer
    /// * `piece_work` - Piece pulled from the queue; it goes back there unless delivered
    ///
    /// # Returns
    ///
    /// The [`Step`] telling the work loop whether to go on.
    pub fn handle(&self, conn: &mut PeerConnection, piece_work: PieceWork) -> Step {
        if !conn.has_piece(piece_work.index) {
            debug!(
                "Peer {} does not have piece {}, putting it back",
                self.peer, piece_work.index
            );
            return match self.requeue(piece_work) {
                Ok(()) => Step::Skipped,
                Err(Closed) => Step::Closed,
            };
        }

        let data = match download_piece(conn, &piece_work, &self.config) {
            Ok(data) => data,
            Err(e) => {
                return match self.requeue(piece_work) {
                    Ok(()) => Step::Abort(e),
                    Err(Closed) => Step::Closed,
                };
            }
        };

        if let Err(e) = piece_work.verify(&data) {
            warn!("Piece {} from peer {} failed integrity check", piece_work.index, self.peer);
            return match self.requeue(piece_work) {
                Ok(()) => Step::Retry(e),
                Err(Closed) => Step::Closed,
            };
        }

        info!("Verified piece {} from peer {}", piece_work.index, self.peer);

        let have = conn.send_have(piece_work.index);

        let result = PieceResult {
            index: piece_work.index,
            data,
        };
        if self.result_tx.send(result).is_err() {
            debug!("Result channel closed, dropping piece {}", piece_work.index);
            return Step::Closed;
        }

        match have {
            Ok(()) => Step::Delivered,
            Err(e) => Step::Abort(e),
        }
    }

    fn requeue(&self, piece_work: PieceWork) -> Result<(), Closed> {
        self.work_chan.0.send(piece_work).map_err(|_| {
            debug!("Work channel closed");
            Closed
        })
    }
}

/// The coordinator side of a channel is gone.
struct Closed;

/// Downloads one piece over a connection, pipelining block requests.
///
/// The whole exchange must finish within the configured piece timeout. Choke state and
/// HAVE announcements received meanwhile update the connection; unrelated messages are
/// skipped.
///
/// # Errors
///
/// - [`PeerError::Timeout`] when the piece deadline passes
/// - [`PeerError::Malformed`] for a block that does not fit the piece
/// - [`PeerError::Io`] when the connection fails
pub fn download_piece(
    conn: &mut PeerConnection,
    piece_work: &PieceWork,
    config: &Config,
) -> Result<Vec<u8>, PeerError> {
    let mut progress = PieceProgress::new(piece_work, config.max_backlog, config.max_block_size);
    let deadline = Instant::now() + config.piece_timeout;

    let outcome = fill_piece(conn, &mut progress, deadline);
    let reset = conn.set_deadline(None);
    outcome?;
    reset?;

    debug!(
        "Downloaded piece {} from peer {}",
        piece_work.index,
        conn.peer()
    );

    Ok(progress.into_data())
}

fn fill_piece(
    conn: &mut PeerConnection,
    progress: &mut PieceProgress,
    deadline: Instant,
) -> Result<(), PeerError> {
    while !progress.is_complete() {
        if !conn.is_choked() {
            while let Some(request) = progress.next_request() {
                conn.send_request(request.index, request.begin, request.length)?;
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(PeerError::Timeout("downloading piece"));
        }
        conn.set_deadline(Some(remaining))?;

        let message = conn.read_message().map_err(|e| match e {
            PeerError::Timeout(_) => PeerError::Timeout("downloading piece"),
            e => e,
        })?;

        match message {
            None => {}
            Some(Message::Choke) => conn.set_choked(true),
            Some(Message::Unchoke) => conn.set_choked(false),
            Some(Message::Have(index)) => conn.set_piece(index),
            Some(Message::Piece {
                index,
                begin,
                block,
            }) => {
                if !progress.receive_block(index, begin, &block)? {
                    debug!(
                        "Ignoring unrequested block [{}:{}] of piece {} from peer {}",
                        begin,
                        begin as usize + block.len(),
                        index,
                        conn.peer()
                    );
                }
            }
            Some(other) => debug!("Ignoring {} from peer {}", other.name(), conn.peer()),
        }
    }

    Ok(())
}
