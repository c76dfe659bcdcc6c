//! # BitTorrent Torrent Management
//!
//! Supplies the inputs of a [`Download`]: torrent metadata and the peers to contact.
//!
//! ## Torrent File Format
//!
//! Torrent files contain metadata in bencoded format:
//!
//! - **announce** / **announce-list**: Tracker URLs for peer discovery
//! - **info**: Dictionary with file information and piece hashes
//!   - **pieces**: Concatenated SHA-1 hashes for integrity verification
//!   - **piece length**: Size of each piece
//!   - **length**: Total file size (single-file torrents only)
//!   - **name**: Suggested filename
//!
//! The info hash is the SHA-1 of the bencoded `info` dictionary.
//!
//! ## Tracker Protocol
//!
//! Trackers are queried over HTTP in tier order until one of them returns peers in
//! the compact format (see [`crate::peer::parse_compact`]).

use crate::config::Config;
use crate::download::Download;
use crate::peer::{parse_compact, peers_from_addrs, Peer};

use anyhow::{anyhow, Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use serde_bencode::{de, ser, value::Value};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use url::Url;

use std::fs;
use std::path::Path;
use std::time::Duration;

// Default port announced to trackers
pub const PORT: u16 = 6881;
// Size of SHA-1 hash in bytes
const SHA1_HASH_SIZE: usize = 20;
// Prefix of the peer ids generated by this client
const PEER_ID_PREFIX: &[u8; 8] = b"-BP0100-";
const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

/// Metadata of a single-file torrent.
#[derive(Debug, Default, Clone)]
pub struct Torrent {
    /// Tracker tiers for peer discovery (each tier is a list of URLs)
    tiers: Vec<Vec<String>>,
    /// 20-byte SHA-1 hash of the bencoded info dictionary
    info_hash: [u8; 20],
    /// One 20-byte SHA-1 hash per piece
    piece_hashes: Vec<[u8; 20]>,
    /// Size of each piece in bytes (except possibly the last)
    piece_length: u32,
    /// Total size of the file in bytes
    length: u64,
    /// Suggested filename from torrent metadata
    name: String,
}

#[derive(Deserialize)]
struct BencodeInfo {
    // Concatenation of all pieces 20-byte SHA-1 hashes
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: u32,
    // Absent from multi-file torrents
    #[serde(default)]
    length: Option<u64>,
    name: String,
}

#[derive(Deserialize)]
struct BencodeTorrent {
    #[serde(default)]
    announce: String,
    #[serde(rename = "announce-list", default)]
    announce_list: Vec<Vec<String>>,
    info: BencodeInfo,
}

/// The `info` dictionary kept as a generic value, for hashing.
#[derive(Deserialize)]
struct RawTorrent {
    info: Value,
}

#[derive(Debug, Deserialize)]
struct BencodeTracker {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    peers: ByteBuf,
}

impl BencodeInfo {
    /// Split bencoded pieces into SHA-1 hashes.
    fn split_piece_hashes(&self) -> Result<Vec<[u8; 20]>> {
        if self.pieces.len() % SHA1_HASH_SIZE != 0 {
            return Err(anyhow!(
                "torrent has malformed pieces of length {}",
                self.pieces.len()
            ));
        }

        let hashes = self
            .pieces
            .chunks_exact(SHA1_HASH_SIZE)
            .map(|chunk| {
                let mut hash = [0; SHA1_HASH_SIZE];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        Ok(hashes)
    }
}

impl Torrent {
    /// Reads and decodes a `.torrent` file.
    pub fn open<P: AsRef<Path>>(filepath: P) -> Result<Torrent> {
        let filepath = filepath.as_ref();
        let buf = fs::read(filepath)
            .with_context(|| format!("could not read torrent '{}'", filepath.display()))?;

        Torrent::from_bytes(&buf)
    }

    /// Decodes bencoded torrent metadata.
    pub fn from_bytes(buf: &[u8]) -> Result<Torrent> {
        let bencode =
            de::from_bytes::<BencodeTorrent>(buf).map_err(|e| anyhow!("could not decode torrent: {}", e))?;
        let raw = de::from_bytes::<RawTorrent>(buf)
            .map_err(|e| anyhow!("could not decode torrent info: {}", e))?;

        let info_bytes =
            ser::to_bytes(&raw.info).map_err(|e| anyhow!("could not encode torrent info: {}", e))?;
        let info_hash: [u8; 20] = Sha1::digest(&info_bytes).into();

        let length = bencode
            .info
            .length
            .ok_or_else(|| anyhow!("multi-file torrents are not supported"))?;

        let piece_hashes = bencode.info.split_piece_hashes()?;
        let piece_length = bencode.info.piece_length;
        let expected = if length == 0 || piece_length == 0 {
            0
        } else {
            length.div_ceil(piece_length as u64)
        };
        if piece_hashes.len() as u64 != expected {
            return Err(anyhow!(
                "torrent lists {} piece hashes for {} pieces",
                piece_hashes.len(),
                expected
            ));
        }

        let mut tiers: Vec<Vec<String>> = bencode
            .announce_list
            .into_iter()
            .filter(|tier| !tier.is_empty())
            .collect();
        if !bencode.announce.is_empty() && !tiers.iter().flatten().any(|u| *u == bencode.announce) {
            tiers.push(vec![bencode.announce]);
        }
        if tiers.is_empty() {
            return Err(anyhow!("torrent has no announce or announce-list"));
        }

        Ok(Torrent {
            tiers,
            info_hash,
            piece_hashes,
            piece_length,
            length,
            name: bencode.info.name,
        })
    }

    /// Suggested filename from the torrent metadata.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Request peers from the trackers, tier by tier (BEP 12).
    ///
    /// URLs within a tier are tried in random order; the first tracker answering with
    /// at least one peer wins.
    pub fn request_peers(&self, peer_id: &[u8; 20], port: u16) -> Result<Vec<Peer>> {
        let client = reqwest::blocking::Client::builder()
            .timeout(TRACKER_TIMEOUT)
            .build()
            .context("could not build HTTP client")?;

        let mut rng = rand::thread_rng();
        for tier in &self.tiers {
            let mut tier = tier.clone();
            tier.shuffle(&mut rng);

            for announce in &tier {
                match self.announce(&client, announce, peer_id, port) {
                    Ok(addrs) if !addrs.is_empty() => {
                        info!("Tracker {} returned {} peers", announce, addrs.len());
                        return Ok(peers_from_addrs(addrs));
                    }
                    Ok(_) => warn!("Tracker {} returned no peers", announce),
                    Err(e) => warn!("Tracker {} failed: {:#}", announce, e),
                }
            }
        }

        Err(anyhow!("could not get peers from any tracker"))
    }

    fn announce(
        &self,
        client: &reqwest::blocking::Client,
        announce: &str,
        peer_id: &[u8; 20],
        port: u16,
    ) -> Result<Vec<std::net::SocketAddr>> {
        let url = build_tracker_url(announce, &self.info_hash, peer_id, port, self.length)?;

        let response = client
            .get(url)
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.bytes())
            .context("tracker request failed")?;

        let tracker = de::from_bytes::<BencodeTracker>(&response)
            .map_err(|e| anyhow!("could not decode tracker response: {}", e))?;
        if let Some(reason) = tracker.failure_reason {
            return Err(anyhow!("tracker refused announce: {}", reason));
        }

        parse_compact(&tracker.peers)
    }

    /// Builds the download of this torrent.
    pub fn download_plan(&self, peer_id: [u8; 20], peers: Vec<Peer>, config: Config) -> Result<Download> {
        let download = Download::new(
            self.info_hash,
            peer_id,
            self.piece_hashes.clone(),
            self.piece_length,
            self.length,
            peers,
        )?
        .with_config(config);

        Ok(download)
    }

    /// Downloads the torrent from `peers` and returns the file content.
    pub fn download(&self, peer_id: [u8; 20], peers: Vec<Peer>, config: Config) -> Result<Vec<u8>> {
        println!(
            "Downloading {:?} ({} pieces from {} peers)",
            self.name,
            self.piece_hashes.len(),
            peers.len()
        );

        let data = self.download_plan(peer_id, peers, config)?.run()?;

        Ok(data)
    }
}

/// Generates a random peer id carrying this client's prefix.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
    rand::thread_rng().fill(&mut peer_id[PEER_ID_PREFIX.len()..]);
    peer_id
}

/// Builds the announce URL for one tracker.
///
/// Binary fields are percent-encoded byte by byte.
pub fn build_tracker_url(
    announce: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    left: u64,
) -> Result<String> {
    /// Each byte is encoded as %XX where XX is the hexadecimal representation
    fn percent_encode_binary(data: &[u8]) -> String {
        data.iter().map(|byte| format!("%{:02X}", byte)).collect()
    }

    let base_url = Url::parse(announce).with_context(|| format!("could not parse tracker url '{}'", announce))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(anyhow!("unsupported tracker scheme '{}'", base_url.scheme()));
    }

    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        percent_encode_binary(info_hash),
        percent_encode_binary(peer_id),
        port,
        left
    );

    let mut url = base_url.to_string();
    url.push(if base_url.query().is_some() { '&' } else { '?' });
    url.push_str(&query);

    Ok(url)
}
