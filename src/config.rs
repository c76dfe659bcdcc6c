//! # Download Configuration
//!
//! Timeouts and limits shared by the coordinator and its workers.
//!
//! ## Defaults
//!
//! | Setting | Value |
//! |---------|-------|
//! | connect timeout | 3s |
//! | handshake timeout | 3s |
//! | bitfield timeout | 5s |
//! | piece timeout | 30s |
//! | pipelining limit | 5 requests |
//! | block size | 16 KiB |
//! | peer-miss backoff | 100ms |
//! | peer idle timeout | 5s |
//! | stall timeout | disabled |

use std::time::Duration;

/// Maximum number of unanswered block requests per connection.
pub const MAX_BACKLOG: usize = 5;

/// Largest block a single request may ask for (16KB).
pub const MAX_BLOCK_SIZE: u32 = 16384;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
pub const BITFIELD_TIMEOUT: Duration = Duration::from_secs(5);
pub const PIECE_TIMEOUT: Duration = Duration::from_secs(30);
pub const PEER_MISS_BACKOFF: Duration = Duration::from_millis(100);
pub const PEER_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables for one download run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Deadline for establishing the TCP connection
    pub connect_timeout: Duration,
    /// Deadline for the handshake exchange
    pub handshake_timeout: Duration,
    /// Deadline for the first message, which must be a bitfield
    pub bitfield_timeout: Duration,
    /// Wall-clock deadline for downloading one whole piece
    pub piece_timeout: Duration,
    /// Pipelining limit
    pub max_backlog: usize,
    /// Block size requested from peers
    pub max_block_size: u32,
    /// Time a worker listens for HAVE messages after skipping every queued piece
    pub peer_miss_backoff: Duration,
    /// A worker whose peer has none of the queued pieces for this long, and announces
    /// none meanwhile, drops out of the run
    pub peer_idle_timeout: Duration,
    /// Fail the run if no piece is verified within this window
    pub stall_timeout: Option<Duration>,
    /// Draw a progress bar on the terminal
    pub show_progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            connect_timeout: CONNECT_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            bitfield_timeout: BITFIELD_TIMEOUT,
            piece_timeout: PIECE_TIMEOUT,
            max_backlog: MAX_BACKLOG,
            max_block_size: MAX_BLOCK_SIZE,
            peer_miss_backoff: PEER_MISS_BACKOFF,
            peer_idle_timeout: PEER_IDLE_TIMEOUT,
            stall_timeout: None,
            show_progress: false,
        }
    }
}
