//! Mock BitTorrent peer for testing.
//!
//! Listens on a loopback port and serves pieces from memory, one connection at a time.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bitpipe::handshake::Handshake;
use bitpipe::message::Message;
use bitpipe::peer::Peer;
use sha1::{Digest, Sha1};

pub const INFO_HASH: [u8; 20] = [0x5a; 20];
pub const CLIENT_ID: [u8; 20] = *b"-BP0100-testclient00";

/// Mock peer configuration
#[derive(Clone)]
pub struct MockPeerConfig {
    /// Info hash announced in the handshake
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    /// Bitfield sent right after the handshake
    pub bitfield: Vec<u8>,
    /// Piece data to serve
    pub pieces: HashMap<u32, Vec<u8>>,
    /// Pieces whose first served block is corrupted
    pub corrupt_once: HashSet<u32>,
    /// Answer every request with the next piece index
    pub wrong_index: bool,
    /// Send UNCHOKE after the bitfield
    pub unchoke: bool,
    /// Send HAVE for this piece after this delay
    pub have_later: Option<(u32, Duration)>,
}

impl MockPeerConfig {
    /// A peer owning every piece of `data`.
    pub fn seeding(data: &[u8], piece_length: usize) -> Self {
        let pieces: HashMap<u32, Vec<u8>> = data
            .chunks(piece_length)
            .enumerate()
            .map(|(i, chunk)| (i as u32, chunk.to_vec()))
            .collect();

        let mut bitfield = vec![0u8; pieces.len().div_ceil(8)];
        for index in pieces.keys() {
            bitfield[*index as usize / 8] |= 1 << (7 - index % 8);
        }

        MockPeerConfig {
            info_hash: INFO_HASH,
            peer_id: [0x70; 20],
            bitfield,
            pieces,
            corrupt_once: HashSet::new(),
            wrong_index: false,
            unchoke: true,
            have_later: None,
        }
    }

    pub fn with_bitfield(mut self, bitfield: Vec<u8>) -> Self {
        self.bitfield = bitfield;
        self
    }

    pub fn with_info_hash(mut self, info_hash: [u8; 20]) -> Self {
        self.info_hash = info_hash;
        self
    }

    pub fn corrupting(mut self, index: u32) -> Self {
        self.corrupt_once.insert(index);
        self
    }

    pub fn with_wrong_index(mut self) -> Self {
        self.wrong_index = true;
        self
    }

    pub fn choking(mut self) -> Self {
        self.unchoke = false;
        self
    }

    pub fn announcing_later(mut self, index: u32, delay: Duration) -> Self {
        self.have_later = Some((index, delay));
        self
    }
}

/// A running mock peer.
pub struct MockPeer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<(u32, u32, u32)>>>,
}

impl MockPeer {
    pub fn spawn(config: MockPeerConfig) -> MockPeer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&requests);
        thread::spawn(move || {
            let mut config = config;
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => serve(stream, &mut config, &recorded),
                    Err(_) => return,
                }
            }
        });

        MockPeer { addr, requests }
    }

    pub fn peer(&self, id: u32) -> Peer {
        Peer::new(id, self.addr)
    }

    /// Every REQUEST received so far, as (index, begin, length).
    pub fn requests(&self) -> Vec<(u32, u32, u32)> {
        self.requests.lock().unwrap().clone()
    }
}

fn serve(
    mut stream: TcpStream,
    config: &mut MockPeerConfig,
    requests: &Mutex<Vec<(u32, u32, u32)>>,
) {
    if Handshake::read(&mut stream).is_err() {
        return;
    }

    let mut greeting = Handshake::new(config.info_hash, config.peer_id)
        .serialize()
        .unwrap();
    greeting.extend(Message::Bitfield(config.bitfield.clone()).serialize());
    if config.unchoke {
        greeting.extend(Message::Unchoke.serialize());
    }
    if stream.write_all(&greeting).is_err() {
        return;
    }

    if let Some((index, delay)) = config.have_later {
        if let Ok(mut writer) = stream.try_clone() {
            thread::spawn(move || {
                thread::sleep(delay);
                let _ = writer.write_all(&Message::Have(index).serialize());
            });
        }
    }

    loop {
        let message = match Message::read(&mut stream) {
            Ok(message) => message,
            Err(_) => return,
        };

        let (index, begin, length) = match message {
            Some(Message::Request {
                index,
                begin,
                length,
            }) => (index, begin, length),
            _ => continue,
        };
        requests.lock().unwrap().push((index, begin, length));

        let piece = match config.pieces.get(&index) {
            Some(piece) => piece,
            None => continue,
        };
        let start = begin as usize;
        if start >= piece.len() {
            continue;
        }
        let end = (start + length as usize).min(piece.len());
        let mut block = piece[start..end].to_vec();

        if config.corrupt_once.remove(&index) {
            for byte in block.iter_mut() {
                *byte ^= 0xff;
            }
        }

        let index = if config.wrong_index { index + 1 } else { index };
        let reply = Message::Piece {
            index,
            begin,
            block,
        };
        if stream.write_all(&reply.serialize()).is_err() {
            return;
        }
    }
}

/// Expected SHA-1 hash of every piece of `data`.
pub fn piece_hashes(data: &[u8], piece_length: usize) -> Vec<[u8; 20]> {
    data.chunks(piece_length)
        .map(|chunk| Sha1::digest(chunk).into())
        .collect()
}

/// Deterministic test content.
pub fn sample_data(length: usize) -> Vec<u8> {
    (0..length).map(|i| (i * 31 % 251) as u8).collect()
}
