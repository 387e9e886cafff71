// Shared fixtures for the integration tests.
#![allow(dead_code)]

use alloy_primitives::{Bytes, FixedBytes, B256, U256};
use alloy_rlp::RlpEncodable;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use peercollect::{
    broker::LocalBroker,
    codec::{framed, RawMsg, WireFramed, MAX_MESSAGE_SIZE},
    collector::Collector,
    dedup::AnnouncementDeduplicator,
    error::{SinkError, SyncError},
    fetcher::RttConfig,
    handshake::{exact_fork_filter, HandshakeParams, TrustedNetwork, TrustedNetworkCache, MAINNET_FORK_HASH, MAINNET_GENESIS},
    metrics::Metrics,
    peer::{PeerHandle, PeerId, PeerSet},
    protocol::{Block, BlockHeader, EthMessage, ForkId, StatusPacket, ETH66},
    publisher::{EventPublisher, MessageBroker, PublisherConfig, PublisherWorkers, RecordStore},
    record::BlockRecord,
    registry::PeerInfoRegistry,
    request::PendingRequestTable,
    session::{self, SessionContext},
    sync::{self, Announcement},
};
use std::{sync::Arc, time::Duration};
use tokio::{io::DuplexStream, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

#[derive(RlpEncodable)]
struct TestHeader {
    parent: B256,
    uncles: B256,
    coinbase: FixedBytes<20>,
    root: B256,
    tx_root: B256,
    receipt_root: B256,
    bloom: Bytes,
    difficulty: U256,
    number: u64,
    gas_limit: u64,
    gas_used: u64,
    time: u64,
    extra: Bytes,
    mix: B256,
    nonce: FixedBytes<8>,
}

#[derive(RlpEncodable)]
struct TestBlock {
    header: BlockHeader,
    transactions: Vec<Bytes>,
    uncles: Vec<Bytes>,
}

pub fn header(number: u64, difficulty: u64, parent: B256) -> BlockHeader {
    let h = TestHeader {
        parent,
        uncles: B256::ZERO,
        coinbase: FixedBytes::ZERO,
        root: B256::ZERO,
        tx_root: B256::ZERO,
        receipt_root: B256::ZERO,
        bloom: Bytes::from(vec![0u8; 256]),
        difficulty: U256::from(difficulty),
        number,
        gas_limit: 30_000_000,
        gas_used: 0,
        time: 1_650_000_000 + number,
        extra: Bytes::new(),
        mix: B256::ZERO,
        nonce: FixedBytes::ZERO,
    };
    BlockHeader::from_rlp(alloy_rlp::encode(&h).into()).expect("valid header")
}

pub fn block(header: &BlockHeader) -> Block {
    let b = TestBlock { header: header.clone(), transactions: vec![], uncles: vec![] };
    Block::from_rlp(alloy_rlp::encode(&b).into())
}

pub fn mainnet_status(td: u64, head: B256) -> StatusPacket {
    StatusPacket {
        protocol_version: ETH66,
        network_id: 1,
        total_difficulty: U256::from(td),
        head,
        genesis: MAINNET_GENESIS,
        fork_id: ForkId { hash: MAINNET_FORK_HASH, next: 0 },
    }
}

pub fn handshake_params(impersonate: bool) -> HandshakeParams {
    let local = StatusPacket {
        total_difficulty: U256::from(42u64),
        head: MAINNET_GENESIS,
        ..mainnet_status(0, B256::ZERO)
    };
    HandshakeParams {
        timeout: Duration::from_secs(2),
        fork_filter: exact_fork_filter(local.fork_id),
        local,
        trusted: vec![TrustedNetwork::mainnet()],
        impersonate,
    }
}

pub fn fast_rtt() -> RttConfig {
    RttConfig { rtt_min_ms: 10, rtt_max_ms: 50, ttl_scaling: 2, ttl_limit_ms: 1_000, rtt_impact: 0.5 }
}

/// Durable sink kept in memory.
#[derive(Default)]
pub struct MemoryStore {
    pub records: Mutex<Vec<BlockRecord>>,
    pub fail: bool,
}

impl MemoryStore {
    pub fn failing() -> Self {
        Self { records: Mutex::default(), fail: true }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_block_record(&self, record: &BlockRecord) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::Unavailable("store offline".into()));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Broker that records every publish.
#[derive(Default)]
pub struct RecordingBroker {
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl MessageBroker for RecordingBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), SinkError> {
        self.published.lock().push((channel.to_string(), payload));
        Ok(())
    }
}

pub struct Harness {
    pub ctx: Arc<SessionContext>,
    pub store: Arc<MemoryStore>,
    pub broker: Arc<LocalBroker>,
    pub metrics: Arc<Metrics>,
    pub announcements: Option<mpsc::Receiver<Announcement>>,
    pub workers: PublisherWorkers,
}

pub fn harness(impersonate: bool) -> Harness {
    let metrics = Arc::new(Metrics::new().expect("metrics"));
    let store = Arc::new(MemoryStore::default());
    let broker = Arc::new(LocalBroker::new());
    let (publisher, workers) = EventPublisher::spawn(
        &PublisherConfig::default(),
        Some(store.clone() as Arc<dyn RecordStore>),
        broker.clone() as Arc<dyn MessageBroker>,
        metrics.clone(),
    );
    let collector = Arc::new(Collector::new(
        Arc::new(PeerInfoRegistry::new(64)),
        Arc::new(AnnouncementDeduplicator::new(64)),
        Arc::new(AnnouncementDeduplicator::new(64)),
        publisher,
        metrics.clone(),
    ));
    let (announce_tx, announce_rx) = sync::channel();
    let ctx = Arc::new(SessionContext {
        handshake: handshake_params(impersonate),
        trusted_cache: Arc::new(TrustedNetworkCache::new()),
        peers: PeerSet::default(),
        table: PendingRequestTable::new(),
        collector,
        announcements: announce_tx,
        rtt: fast_rtt(),
        metrics: metrics.clone(),
        shutdown: CancellationToken::new(),
    });
    Harness { ctx, store, broker, metrics, announcements: Some(announce_rx), workers }
}

pub type Remote = WireFramed<DuplexStream>;

/// Two ends of an in-memory connection with the framing already applied.
pub fn pipe() -> (Remote, Remote) {
    pipe_with_limit(MAX_MESSAGE_SIZE)
}

/// Like `pipe`, but the first end only accepts frames up to `local_max`.
pub fn pipe_with_limit(local_max: usize) -> (Remote, Remote) {
    let (a, b) = tokio::io::duplex(1 << 20);
    (framed(a, local_max), framed(b, MAX_MESSAGE_SIZE))
}

pub async fn send(remote: &mut Remote, msg: EthMessage) {
    remote.send(msg.encode()).await.expect("remote send");
}

pub async fn recv(remote: &mut Remote) -> EthMessage {
    let raw: RawMsg = tokio::time::timeout(Duration::from_secs(2), remote.next())
        .await
        .expect("remote recv timed out")
        .expect("stream open")
        .expect("frame");
    EthMessage::decode(&raw).expect("decodable")
}

/// Start a session for `id` and complete the handshake from the remote side.
pub async fn connect(
    h: &Harness,
    id: PeerId,
    addr: &str,
    status: StatusPacket,
) -> (JoinHandle<Result<(), SyncError>>, Remote, Arc<PeerHandle>) {
    let (local, mut remote) = pipe();
    let task = tokio::spawn(session::run(h.ctx.clone(), local, id, addr.to_string()));
    send(&mut remote, EthMessage::Status(status)).await;
    let EthMessage::Status(_) = recv(&mut remote).await else { panic!("expected status reply") };
    let handle = wait_for_peer(&h.ctx.peers, id).await;
    (task, remote, handle)
}

pub async fn wait_for_peer(peers: &PeerSet, id: PeerId) -> Arc<PeerHandle> {
    for _ in 0..200 {
        if let Some(handle) = peers.get(&id) {
            return handle;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("peer {id} never registered");
}

/// Poll `f` until it holds or two seconds pass.
pub async fn eventually(mut f: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
