//! Synchronous-looking fetch API over the eth/66 request-id protocol.

use crate::{
    error::SyncError,
    metrics::Metrics,
    peer::PeerHandle,
    protocol::{BlockHeader, EthMessage, GetBlockBodies, GetBlockHeaders, HashOrNumber, HeadersQuery, RawRlp},
    request::{PendingHandle, PendingRequestTable, Response, ResponseKind, ResponsePayload},
};
use alloy_primitives::B256;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Tuning of the per-peer round trip estimate.
#[derive(Debug, Deserialize, Clone)]
pub struct RttConfig {
    #[serde(default = "default_rtt_min_ms")]
    pub rtt_min_ms: u64,
    #[serde(default = "default_rtt_max_ms")]
    pub rtt_max_ms: u64,
    #[serde(default = "default_ttl_scaling")]
    pub ttl_scaling: u32,
    #[serde(default = "default_ttl_limit_ms")]
    pub ttl_limit_ms: u64,
    #[serde(default = "default_rtt_impact")]
    pub rtt_impact: f64,
}

fn default_rtt_min_ms() -> u64 { 2_000 }
fn default_rtt_max_ms() -> u64 { 20_000 }
fn default_ttl_scaling() -> u32 { 3 }
fn default_ttl_limit_ms() -> u64 { 60_000 }
fn default_rtt_impact() -> f64 { 0.25 }

impl Default for RttConfig {
    fn default() -> Self {
        Self {
            rtt_min_ms: default_rtt_min_ms(),
            rtt_max_ms: default_rtt_max_ms(),
            ttl_scaling: default_ttl_scaling(),
            ttl_limit_ms: default_ttl_limit_ms(),
            rtt_impact: default_rtt_impact(),
        }
    }
}

/// Exponential moving average of a peer's response time.
#[derive(Debug, Clone)]
pub struct RoundTripEstimator {
    rtt: Duration,
    min: Duration,
    max: Duration,
    scaling: u32,
    limit: Duration,
    impact: f64,
}

impl RoundTripEstimator {
    /// Starts pessimistic at `rtt_max` until the peer proves faster.
    pub fn new(cfg: &RttConfig) -> Self {
        let min = Duration::from_millis(cfg.rtt_min_ms);
        let max = Duration::from_millis(cfg.rtt_max_ms.max(cfg.rtt_min_ms));
        Self {
            rtt: max,
            min,
            max,
            scaling: cfg.ttl_scaling.max(1),
            limit: Duration::from_millis(cfg.ttl_limit_ms),
            impact: cfg.rtt_impact.clamp(0.0, 1.0),
        }
    }

    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    pub fn target_timeout(&self) -> Duration {
        (self.rtt * self.scaling).min(self.limit)
    }

    pub fn update(&mut self, measured: Duration) {
        let old = self.rtt.as_secs_f64();
        let next = (1.0 - self.impact) * old + self.impact * measured.as_secs_f64();
        self.rtt = Duration::from_secs_f64(next).clamp(self.min, self.max);
    }
}

/// Origin of a header request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSelector {
    Hash(B256),
    Number(u64),
}

impl From<HeaderSelector> for HashOrNumber {
    fn from(s: HeaderSelector) -> Self {
        match s {
            HeaderSelector::Hash(h) => HashOrNumber::Hash(h),
            HeaderSelector::Number(n) => HashOrNumber::Number(n),
        }
    }
}

/// Turns request/response pairs into awaited calls with cancellation and
/// timeout. Content of a delivered response is not judged here.
#[derive(Clone)]
pub struct FetchOrchestrator {
    table: PendingRequestTable,
    metrics: Arc<Metrics>,
}

impl FetchOrchestrator {
    pub fn new(table: PendingRequestTable, metrics: Arc<Metrics>) -> Self {
        Self { table, metrics }
    }

    pub fn table(&self) -> &PendingRequestTable {
        &self.table
    }

    /// Fetch headers and their keccak hashes, in delivery order.
    pub async fn fetch_headers(
        &self,
        peer: &PeerHandle,
        selector: HeaderSelector,
        amount: u64,
        skip: u64,
        reverse: bool,
        cancel: &CancellationToken,
    ) -> Result<(Vec<BlockHeader>, Vec<B256>), SyncError> {
        if amount == 0 {
            return Ok((Vec::new(), Vec::new()));
        }
        let ttl = peer.target_timeout();
        let mut pending = self.table.register(peer.id(), ResponseKind::BlockHeaders, ttl);
        let query = HeadersQuery { origin: selector.into(), amount, skip, reverse };
        let request = EthMessage::GetBlockHeaders(GetBlockHeaders { request_id: pending.id(), query });

        let response = self.roundtrip(peer, &mut pending, ResponseKind::BlockHeaders, request, ttl, cancel).await?;
        match response {
            ResponsePayload::Headers(headers) => {
                self.metrics.headers_in.inc_by(headers.len() as u64);
                let hashes = headers.iter().map(BlockHeader::hash).collect();
                Ok((headers, hashes))
            }
            // The table only hands out payloads of the registered kind.
            ResponsePayload::Bodies(_) => Err(SyncError::UnexpectedMessage {
                code: crate::protocol::codes::BLOCK_BODIES,
                reason: "bodies delivered to a header request".into(),
            }),
        }
    }

    /// Fetch raw block bodies for `hashes`.
    pub async fn fetch_bodies(
        &self,
        peer: &PeerHandle,
        hashes: Vec<B256>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawRlp>, SyncError> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let ttl = peer.target_timeout();
        let mut pending = self.table.register(peer.id(), ResponseKind::BlockBodies, ttl);
        let request = EthMessage::GetBlockBodies(GetBlockBodies { request_id: pending.id(), hashes });

        match self.roundtrip(peer, &mut pending, ResponseKind::BlockBodies, request, ttl, cancel).await? {
            ResponsePayload::Bodies(bodies) => Ok(bodies),
            ResponsePayload::Headers(_) => Err(SyncError::UnexpectedMessage {
                code: crate::protocol::codes::BLOCK_HEADERS,
                reason: "headers delivered to a bodies request".into(),
            }),
        }
    }

    async fn roundtrip(
        &self,
        peer: &PeerHandle,
        pending: &mut PendingHandle,
        kind: ResponseKind,
        request: EthMessage,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<ResponsePayload, SyncError> {
        let id = pending.id();
        let started = std::time::Instant::now();

        // Send and wait share one deadline and one cancellation, and
        // cancellation wins ties. Dropping `pending` releases the entry.
        let exchange = async {
            if let Err(e) = peer.send(request).await {
                return Err(e);
            }
            // A closed slot means the entry was swept as expired.
            pending.receiver().await.map_err(|_| SyncError::Timeout(ttl))
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Canceled),
            res = exchange => res,
            _ = tokio::time::sleep(ttl) => Err(SyncError::Timeout(ttl)),
        };

        match outcome {
            Ok(Response { payload, received_at, done, .. }) => {
                let _ = done.send(());
                let elapsed = received_at.saturating_duration_since(started);
                peer.record_round_trip(elapsed);
                self.metrics.header_request_seconds.observe(elapsed.as_secs_f64());
                debug!(peer = %peer.id(), request_id = id, items = payload.len(), ?elapsed, "fetch answered");
                Ok(payload)
            }
            Err(SyncError::Timeout(t)) => {
                self.table.release(id);
                self.metrics.header_timeouts.with_label_values(&[kind.as_str()]).inc();
                debug!(peer = %peer.id(), request_id = id, ttl = ?t, "fetch timed out");
                Err(SyncError::Timeout(t))
            }
            Err(SyncError::Canceled) => {
                self.table.release(id);
                debug!(peer = %peer.id(), request_id = id, "fetch canceled");
                Err(SyncError::Canceled)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        peer::{PeerId, PeerSession},
        protocol::{ForkId, StatusPacket, ETH66},
        request::Delivery,
    };
    use alloy_primitives::U256;
    use tokio::sync::mpsc;

    fn fast_rtt() -> RttConfig {
        RttConfig { rtt_min_ms: 10, rtt_max_ms: 50, ttl_scaling: 2, ttl_limit_ms: 1_000, rtt_impact: 0.5 }
    }

    fn peer() -> (Arc<PeerHandle>, mpsc::Receiver<EthMessage>) {
        let status = StatusPacket {
            protocol_version: ETH66,
            network_id: 1,
            total_difficulty: U256::from(1u64),
            head: B256::ZERO,
            genesis: B256::ZERO,
            fork_id: ForkId::default(),
        };
        let session = Arc::new(PeerSession::from_status(PeerId::random(), "10.0.0.2:30303".into(), &status));
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(PeerHandle::new(session, tx, RoundTripEstimator::new(&fast_rtt()))), rx)
    }

    #[test]
    fn estimator_clamps_and_caps_target() {
        let mut est = RoundTripEstimator::new(&RttConfig::default());
        assert_eq!(est.rtt(), Duration::from_secs(20));
        assert_eq!(est.target_timeout(), Duration::from_secs(60));
        for _ in 0..64 {
            est.update(Duration::from_millis(1));
        }
        assert_eq!(est.rtt(), Duration::from_secs(2));
        assert_eq!(est.target_timeout(), Duration::from_secs(6));
    }

    #[tokio::test]
    async fn zero_amount_sends_nothing() {
        let fetcher = FetchOrchestrator::new(PendingRequestTable::new(), Arc::new(Metrics::new().unwrap()));
        let (peer, mut rx) = peer();
        let (headers, hashes) = fetcher
            .fetch_headers(&peer, HeaderSelector::Number(1), 0, 0, false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(headers.is_empty() && hashes.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn bodies_are_correlated_by_request_id() {
        let table = PendingRequestTable::new();
        let fetcher = FetchOrchestrator::new(table.clone(), Arc::new(Metrics::new().unwrap()));
        let (peer, mut rx) = peer();
        let id = peer.id();

        let responder = tokio::spawn(async move {
            let Some(EthMessage::GetBlockBodies(req)) = rx.recv().await else { panic!("expected GetBlockBodies") };
            let body = RawRlp(alloy_primitives::Bytes::from_static(&[0xc2, 0xc0, 0xc0]));
            let delivery = table.deliver(&id, req.request_id, ResponsePayload::Bodies(vec![body])).unwrap();
            let Delivery::Delivered(ack) = delivery else { panic!("not delivered") };
            ack.await.unwrap();
        });

        let bodies = fetcher
            .fetch_bodies(&peer, vec![B256::repeat_byte(7)], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(bodies.len(), 1);
        responder.await.unwrap();
        assert!(fetcher.table().is_empty());
    }

    #[tokio::test]
    async fn closed_outbound_queue_fails_send() {
        let fetcher = FetchOrchestrator::new(PendingRequestTable::new(), Arc::new(Metrics::new().unwrap()));
        let (peer, rx) = peer();
        drop(rx);
        let err = fetcher
            .fetch_headers(&peer, HeaderSelector::Number(5), 1, 0, false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RequestSendFailed(_)));
        assert!(fetcher.table().is_empty());
    }
}
