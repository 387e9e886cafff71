// Handshake behaviour over in-memory connections.

mod common;

use alloy_primitives::{FixedBytes, B256, U256};
use common::*;
use futures::{SinkExt, StreamExt};
use peercollect::{
    codec::RawMsg,
    error::SyncError,
    handshake::{self, TrustedNetwork, TrustedNetworkCache, MAINNET_GENESIS},
    peer::PeerId,
    protocol::{codes, EthMessage, ForkId, StatusPacket},
};
use std::time::Duration;

async fn run_local(
    params: peercollect::HandshakeParams,
    cache: &TrustedNetworkCache,
    local: Remote,
) -> Result<peercollect::PeerSession, SyncError> {
    let (mut sink, mut stream) = local.split();
    handshake::run(&params, cache, &mut sink, &mut stream, PeerId::random(), "10.1.1.1:30303".into()).await
}

#[tokio::test]
async fn test_trusted_peer_is_answered_with_cached_status() {
    let (local, mut remote) = pipe();
    let cache = TrustedNetworkCache::new();
    let theirs = mainnet_status(900, B256::repeat_byte(0xee));

    let peer = {
        let theirs = theirs.clone();
        tokio::spawn(async move {
            send(&mut remote, EthMessage::Status(theirs)).await;
            recv(&mut remote).await
        })
    };

    let session = run_local(handshake_params(true), &cache, local).await.expect("handshake should succeed");
    assert_eq!(session.head().hash, theirs.head, "session seeded with the remote head");
    assert_eq!(session.head().total_difficulty, U256::from(900u64));
    assert_eq!(session.network_id, 1);

    // The reply echoes the trusted cache, not the local chain state.
    let EthMessage::Status(reply) = peer.await.unwrap() else { panic!("expected status") };
    assert_eq!(reply, theirs);
    assert_eq!(cache.snapshot(), Some(theirs));
}

#[tokio::test]
async fn test_untrusted_network_is_rejected() {
    let mutations: [fn(&mut StatusPacket); 3] = [
        |s| s.network_id = 5,
        |s| s.genesis = B256::repeat_byte(1),
        |s| s.fork_id.hash = FixedBytes::ZERO,
    ];
    for mutate in mutations {
        let (local, mut remote) = pipe();
        let cache = TrustedNetworkCache::new();
        let mut theirs = mainnet_status(1, B256::ZERO);
        mutate(&mut theirs);
        send(&mut remote, EthMessage::Status(theirs)).await;

        let err = run_local(handshake_params(true), &cache, local).await.unwrap_err();
        assert!(matches!(err, SyncError::HandshakeMismatch(_)), "got {err:?}");
        assert!(cache.snapshot().is_none(), "rejected status must not reach the cache");
    }
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let (local, _remote) = pipe();
    let mut params = handshake_params(true);
    params.timeout = Duration::from_millis(100);
    let err = run_local(params, &TrustedNetworkCache::new(), local).await.unwrap_err();
    assert!(matches!(err, SyncError::Timeout(_)), "got {err:?}");
}

#[tokio::test]
async fn test_oversize_status_is_rejected() {
    let (local, mut remote) = pipe_with_limit(16);
    send(&mut remote, EthMessage::Status(mainnet_status(1, B256::ZERO))).await;
    let err = run_local(handshake_params(true), &TrustedNetworkCache::new(), local).await.unwrap_err();
    assert!(matches!(err, SyncError::OversizeMessage { max: 16, .. }), "got {err:?}");
}

#[tokio::test]
async fn test_malformed_status_is_decode_error() {
    let (local, mut remote) = pipe();
    remote.send(RawMsg::new(codes::STATUS, bytes::Bytes::from_static(&[0xc2, 0x42, 0x01]))).await.unwrap();
    let err = run_local(handshake_params(true), &TrustedNetworkCache::new(), local).await.unwrap_err();
    assert!(matches!(err, SyncError::DecodeError(_)), "got {err:?}");
}

#[tokio::test]
async fn test_first_message_must_be_status() {
    let (local, mut remote) = pipe();
    remote.send(RawMsg::new(codes::NEW_BLOCK, bytes::Bytes::from_static(&[0xc0]))).await.unwrap();
    let err = run_local(handshake_params(true), &TrustedNetworkCache::new(), local).await.unwrap_err();
    assert!(matches!(err, SyncError::UnexpectedMessage { code: codes::NEW_BLOCK, .. }), "got {err:?}");
}

#[tokio::test]
async fn test_closed_connection_is_disconnected() {
    let (local, remote) = pipe();
    drop(remote);
    let err = run_local(handshake_params(true), &TrustedNetworkCache::new(), local).await.unwrap_err();
    assert!(matches!(err, SyncError::Disconnected | SyncError::Io(_)), "got {err:?}");
}

#[tokio::test]
async fn test_local_mode_sends_local_status_concurrently() {
    let (local, mut remote) = pipe();
    let params = handshake_params(false);
    let expected = params.local.clone();

    // Remote waits for our status before sending its own.
    let peer = tokio::spawn(async move {
        let ours = recv(&mut remote).await;
        send(&mut remote, EthMessage::Status(mainnet_status(7, B256::repeat_byte(7)))).await;
        ours
    });

    let session = run_local(params, &TrustedNetworkCache::new(), local).await.expect("handshake");
    assert_eq!(session.head().total_difficulty, U256::from(7u64));
    assert_eq!(peer.await.unwrap(), EthMessage::Status(expected));
}

#[tokio::test]
async fn test_local_mode_applies_fork_filter() {
    let (local, mut remote) = pipe();
    let other_fork = FixedBytes::from([0xf0, 0x0d, 0xbe, 0xef]);
    let mut params = handshake_params(false);
    params.trusted.push(TrustedNetwork { network_id: 1, genesis: MAINNET_GENESIS, fork_hash: other_fork });

    let mut theirs = mainnet_status(3, B256::ZERO);
    theirs.fork_id = ForkId { hash: other_fork, next: 0 };
    let peer = tokio::spawn(async move {
        send(&mut remote, EthMessage::Status(theirs)).await;
        let _ = remote.next().await;
    });

    let err = run_local(params, &TrustedNetworkCache::new(), local).await.unwrap_err();
    assert!(matches!(err, SyncError::HandshakeMismatch(ref m) if m.contains("fork")), "got {err:?}");
    peer.await.unwrap();
}

#[tokio::test]
async fn test_session_counts_failed_handshakes() {
    let h = harness(true);
    let (local, mut remote) = pipe();
    let mut theirs = mainnet_status(1, B256::ZERO);
    theirs.network_id = 56;
    send(&mut remote, EthMessage::Status(theirs)).await;

    let res = peercollect::session::run(h.ctx.clone(), local, PeerId::random(), "10.0.0.9:30303".into()).await;
    assert!(matches!(res, Err(SyncError::HandshakeMismatch(_))));
    assert_eq!(h.metrics.handshake_failures.get(), 1);
    assert!(h.ctx.peers.is_empty());
}
