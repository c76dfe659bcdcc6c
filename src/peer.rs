//! # BitTorrent Peer Information
//!
//! Network identity of the remote peers a download connects to.
//!
//! ## Compact Peer Format
//!
//! Trackers answer with 6-byte entries:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! Both fields are in network byte order.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder};

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

const PEER_SIZE: usize = 6;

pub type PeerId = u32;

/// A remote peer in the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    /// Sequential identifier used in logs
    pub id: PeerId,
    /// Address to dial
    pub addr: SocketAddr,
}

impl Peer {
    pub fn new(id: PeerId, addr: SocketAddr) -> Peer {
        Peer { id, addr }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.id, self.addr)
    }
}

/// Builds peers from an ordered list of addresses, numbering them from 0.
pub fn peers_from_addrs<I>(addrs: I) -> Vec<Peer>
where
    I: IntoIterator<Item = SocketAddr>,
{
    let mut seen = HashSet::new();
    addrs
        .into_iter()
        .filter(|addr| seen.insert(*addr))
        .enumerate()
        .map(|(i, addr)| Peer::new(i as PeerId, addr))
        .collect()
}

/// Parses a compact peer list as returned by a tracker.
///
/// # Errors
///
/// Returns an error if the list length is not a multiple of 6 bytes.
pub fn parse_compact(tracker_peers: &[u8]) -> Result<Vec<SocketAddr>> {
    if tracker_peers.len() % PEER_SIZE != 0 {
        return Err(anyhow!(
            "received malformed peers of length {}",
            tracker_peers.len()
        ));
    }

    let addrs = tracker_peers
        .chunks_exact(PEER_SIZE)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = BigEndian::read_u16(&chunk[4..6]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect();

    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact() {
        let data = vec![192, 168, 1, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80];
        let addrs = parse_compact(&data).unwrap();

        assert_eq!(
            addrs,
            vec![
                "192.168.1.1:6881".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:80".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn test_parse_compact_rejects_partial_entry() {
        assert!(parse_compact(&[1, 2, 3, 4, 5]).is_err());
        assert!(parse_compact(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_peers_from_addrs_dedups_and_numbers() {
        let a: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2000".parse().unwrap();
        let peers = peers_from_addrs(vec![a, b, a]);

        assert_eq!(peers, vec![Peer::new(0, a), Peer::new(1, b)]);
        assert_eq!(peers[1].to_string(), "#1 (127.0.0.1:2000)");
    }
}
