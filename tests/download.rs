mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bitpipe::connection::PeerConnection;
use bitpipe::piece::PieceWork;
use bitpipe::worker::{download_piece, Step, Worker};
use bitpipe::{Config, Download, DownloadError, MalformedMessage, PeerError};
use common::*;
use crossbeam_channel::{bounded, unbounded};

fn download(data: &[u8], piece_length: usize, peers: &[&MockPeer]) -> Download {
    let peers = peers
        .iter()
        .enumerate()
        .map(|(i, mock)| mock.peer(i as u32))
        .collect();

    Download::new(
        INFO_HASH,
        CLIENT_ID,
        piece_hashes(data, piece_length),
        piece_length as u32,
        data.len() as u64,
        peers,
    )
    .unwrap()
}

#[test]
fn test_two_pieces_from_one_peer() {
    let data = b"abcdef".to_vec();
    let mock = MockPeer::spawn(MockPeerConfig::seeding(&data, 4));

    let assembled = download(&data, 4, &[&mock]).run().unwrap();

    assert_eq!(assembled, data);
    let mut requests = mock.requests();
    requests.sort();
    assert_eq!(requests, vec![(0, 0, 4), (1, 0, 2)]);
}

#[test]
fn test_multi_block_pieces_from_two_peers() {
    let piece_length = 40_000;
    let data = sample_data(piece_length * 4 + 1234);
    let first = MockPeer::spawn(MockPeerConfig::seeding(&data, piece_length));
    let second = MockPeer::spawn(MockPeerConfig::seeding(&data, piece_length));

    let assembled = download(&data, piece_length, &[&first, &second])
        .run()
        .unwrap();

    assert_eq!(assembled.len(), data.len());
    assert_eq!(assembled, data);
    for (index, begin, length) in first.requests().into_iter().chain(second.requests()) {
        assert!(length <= 16384);
        assert!(begin as usize + length as usize <= piece_length);
        assert!(index < 5);
    }
}

#[test]
fn test_corrupted_piece_is_downloaded_again() {
    let data = sample_data(12);
    let mock = MockPeer::spawn(MockPeerConfig::seeding(&data, 4).corrupting(1));

    let assembled = download(&data, 4, &[&mock]).run().unwrap();

    assert_eq!(assembled, data);
    let piece_1_requests = mock.requests().iter().filter(|r| r.0 == 1).count();
    assert_eq!(piece_1_requests, 2);
}

#[test]
fn test_piece_missing_from_bitfield_goes_back_to_queue() {
    let data = b"abcdef".to_vec();
    // Only piece 1 is advertised.
    let mock = MockPeer::spawn(MockPeerConfig::seeding(&data, 4).with_bitfield(vec![0b0100_0000]));
    let config = Arc::new(Config::default());

    let mut conn = PeerConnection::connect(mock.peer(0), INFO_HASH, CLIENT_ID, &config).unwrap();
    assert!(!conn.has_piece(0));

    let work_chan = bounded::<PieceWork>(2);
    let (result_tx, result_rx) = unbounded();
    let (_shutdown_tx, shutdown_rx) = bounded::<()>(0);
    let worker = Worker::new(
        mock.peer(0),
        INFO_HASH,
        CLIENT_ID,
        Arc::clone(&config),
        work_chan.clone(),
        result_tx,
        shutdown_rx,
    );

    let hashes = piece_hashes(&data, 4);
    let piece_0 = PieceWork::new(0, hashes[0], 4);
    let step = worker.handle(&mut conn, piece_0.clone());

    assert!(matches!(step, Step::Skipped));
    assert_eq!(work_chan.1.try_recv().unwrap(), piece_0);
    assert!(result_rx.try_recv().is_err());

    thread::sleep(Duration::from_millis(100));
    assert!(mock.requests().is_empty());
}

#[test]
fn test_pieces_are_routed_to_peers_owning_them() {
    let data = sample_data(10);
    // Lacks piece 0, so it has to be fetched from the other peer.
    let partial = MockPeer::spawn(MockPeerConfig::seeding(&data, 4).with_bitfield(vec![0b0110_0000]));
    let only_first = MockPeer::spawn(MockPeerConfig::seeding(&data, 4).with_bitfield(vec![0b1000_0000]));

    let assembled = download(&data, 4, &[&partial, &only_first]).run().unwrap();

    assert_eq!(assembled, data);
    assert!(partial.requests().iter().all(|r| r.0 != 0));
    assert!(only_first.requests().iter().all(|r| r.0 == 0));
}

#[test]
fn test_piece_with_foreign_index_is_rejected() {
    let data = b"abcdef".to_vec();
    let mock = MockPeer::spawn(MockPeerConfig::seeding(&data, 4).with_wrong_index());
    let config = Config::default();

    let mut conn = PeerConnection::connect(mock.peer(0), INFO_HASH, CLIENT_ID, &config).unwrap();
    conn.send_interested().unwrap();
    conn.set_choked(false);

    let hashes = piece_hashes(&data, 4);
    let err = download_piece(&mut conn, &PieceWork::new(0, hashes[0], 4), &config).unwrap_err();

    assert!(matches!(
        err,
        PeerError::Malformed(MalformedMessage::IndexMismatch {
            expected: 0,
            received: 1
        })
    ));
    assert!(err.is_fatal());
}

#[test]
fn test_handshake_with_other_info_hash_fails_fast() {
    let data = b"abcdef".to_vec();
    let mock = MockPeer::spawn(MockPeerConfig::seeding(&data, 4).with_info_hash([0x11; 20]));

    let started = Instant::now();
    let result = PeerConnection::connect(mock.peer(0), INFO_HASH, CLIENT_ID, &Config::default());

    assert!(matches!(result, Err(PeerError::HandshakeMismatch { .. })));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn test_run_fails_once_every_peer_is_gone() {
    let data = b"abcdef".to_vec();
    let mock = MockPeer::spawn(MockPeerConfig::seeding(&data, 4).with_info_hash([0x11; 20]));

    let result = download(&data, 4, &[&mock]).run();

    assert!(matches!(
        result,
        Err(DownloadError::PeersExhausted { remaining: 2 })
    ));
}

#[test]
fn test_run_fails_when_stalled() {
    let data = b"abcdef".to_vec();
    let mock = MockPeer::spawn(MockPeerConfig::seeding(&data, 4).choking());
    let config = Config {
        stall_timeout: Some(Duration::from_millis(300)),
        ..Config::default()
    };

    let started = Instant::now();
    let result = download(&data, 4, &[&mock]).with_config(config).run();

    assert!(matches!(
        result,
        Err(DownloadError::Stalled { remaining: 2, .. })
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(mock.requests().is_empty());
}

#[test]
fn test_piece_deadline_is_a_timeout() {
    let data = b"abcdef".to_vec();
    let mock = MockPeer::spawn(MockPeerConfig::seeding(&data, 4).choking());
    let config = Config {
        piece_timeout: Duration::from_millis(200),
        ..Config::default()
    };

    let mut conn = PeerConnection::connect(mock.peer(0), INFO_HASH, CLIENT_ID, &config).unwrap();
    let hashes = piece_hashes(&data, 4);
    let err = download_piece(&mut conn, &PieceWork::new(0, hashes[0], 4), &config).unwrap_err();

    assert!(matches!(err, PeerError::Timeout("downloading piece")));
}

#[test]
fn test_run_gives_up_on_peer_lacking_remaining_pieces() {
    let data = b"abcdef".to_vec();
    // Owns piece 0 only, and never announces piece 1.
    let mock = MockPeer::spawn(MockPeerConfig::seeding(&data, 4).with_bitfield(vec![0b1000_0000]));

    let started = Instant::now();
    let result = download(&data, 4, &[&mock]).run();

    assert!(matches!(
        result,
        Err(DownloadError::PeersExhausted { remaining: 1 })
    ));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(mock.requests().iter().all(|r| r.0 == 0));
}

#[test]
fn test_idle_timeout_is_configurable() {
    let data = b"abcdef".to_vec();
    let mock = MockPeer::spawn(MockPeerConfig::seeding(&data, 4).with_bitfield(vec![0b1000_0000]));
    let config = Config {
        peer_miss_backoff: Duration::from_millis(20),
        peer_idle_timeout: Duration::from_millis(300),
        ..Config::default()
    };

    let started = Instant::now();
    let result = download(&data, 4, &[&mock]).with_config(config).run();

    assert!(matches!(
        result,
        Err(DownloadError::PeersExhausted { remaining: 1 })
    ));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn test_have_received_while_idle_unlocks_piece() {
    let data = b"abcdef".to_vec();
    let mock = MockPeer::spawn(
        MockPeerConfig::seeding(&data, 4)
            .with_bitfield(vec![0b1000_0000])
            .announcing_later(1, Duration::from_millis(300)),
    );

    let assembled = download(&data, 4, &[&mock]).run().unwrap();

    assert_eq!(assembled, data);
    let mut requests = mock.requests();
    requests.sort();
    assert_eq!(requests, vec![(0, 0, 4), (1, 0, 2)]);
}

#[test]
fn test_closed_result_channel_stops_worker() {
    let data = b"abcdef".to_vec();
    let mock = MockPeer::spawn(MockPeerConfig::seeding(&data, 4));
    let config = Arc::new(Config::default());

    let mut conn = PeerConnection::connect(mock.peer(0), INFO_HASH, CLIENT_ID, &config).unwrap();
    conn.send_interested().unwrap();

    let work_chan = bounded::<PieceWork>(2);
    let (result_tx, result_rx) = unbounded();
    let (_shutdown_tx, shutdown_rx) = bounded::<()>(0);
    drop(result_rx);
    let worker = Worker::new(
        mock.peer(0),
        INFO_HASH,
        CLIENT_ID,
        Arc::clone(&config),
        work_chan,
        result_tx,
        shutdown_rx,
    );

    let hashes = piece_hashes(&data, 4);
    let step = worker.handle(&mut conn, PieceWork::new(0, hashes[0], 4));

    assert!(matches!(step, Step::Closed));
}
