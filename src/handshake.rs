//! Status exchange that must precede any other traffic on a connection.

use crate::{
    codec::RawMsg,
    error::SyncError,
    peer::{PeerId, PeerSession},
    protocol::{codes, decode_exact, EthMessage, ForkId, StatusPacket},
};
use alloy_primitives::{b256, fixed_bytes, FixedBytes, B256};
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

/// Upper bound for each half of the exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub const MAINNET_NETWORK_ID: u64 = 1;
pub const MAINNET_GENESIS: B256 = b256!("d4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3");
pub const MAINNET_FORK_HASH: FixedBytes<4> = fixed_bytes!("20c327fc");

/// A network identity this node is willing to represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TrustedNetwork {
    pub network_id: u64,
    pub genesis: B256,
    pub fork_hash: FixedBytes<4>,
}

impl TrustedNetwork {
    pub const fn mainnet() -> Self {
        Self { network_id: MAINNET_NETWORK_ID, genesis: MAINNET_GENESIS, fork_hash: MAINNET_FORK_HASH }
    }

    pub fn matches(&self, status: &StatusPacket) -> bool {
        status.network_id == self.network_id
            && status.genesis == self.genesis
            && status.fork_id.hash == self.fork_hash
    }
}

/// Last status accepted from a trusted peer. Outgoing statuses in
/// impersonation mode are built from it.
#[derive(Debug, Default)]
pub struct TrustedNetworkCache {
    last: RwLock<Option<StatusPacket>>,
}

impl TrustedNetworkCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, status: &StatusPacket) {
        *self.last.write() = Some(status.clone());
    }

    pub fn snapshot(&self) -> Option<StatusPacket> {
        self.last.read().clone()
    }
}

/// Fork compatibility predicate applied to the remote fork id.
pub type ForkFilter = Arc<dyn Fn(&ForkId) -> Result<(), String> + Send + Sync>;

/// Accept only peers announcing exactly `local`'s fork hash.
pub fn exact_fork_filter(local: ForkId) -> ForkFilter {
    Arc::new(move |remote: &ForkId| {
        if remote.hash == local.hash {
            Ok(())
        } else {
            Err(format!("fork hash {} (!= {})", remote.hash, local.hash))
        }
    })
}

#[derive(Clone)]
pub struct HandshakeParams {
    pub timeout: Duration,
    /// Genuinely local chain state.
    pub local: StatusPacket,
    pub trusted: Vec<TrustedNetwork>,
    /// Answer with the cached trusted status instead of `local`.
    pub impersonate: bool,
    pub fork_filter: ForkFilter,
}

impl HandshakeParams {
    fn trusted_match(&self, status: &StatusPacket) -> Result<(), SyncError> {
        if self.trusted.iter().any(|t| t.matches(status)) {
            return Ok(());
        }
        Err(SyncError::HandshakeMismatch(format!(
            "untrusted network {} genesis {} fork {}",
            status.network_id, status.genesis, status.fork_id.hash
        )))
    }

    fn local_match(&self, status: &StatusPacket) -> Result<(), SyncError> {
        if status.network_id != self.local.network_id {
            return Err(SyncError::HandshakeMismatch(format!(
                "network id {} (!= {})",
                status.network_id, self.local.network_id
            )));
        }
        if status.genesis != self.local.genesis {
            return Err(SyncError::HandshakeMismatch(format!(
                "genesis {} (!= {})",
                status.genesis, self.local.genesis
            )));
        }
        (self.fork_filter)(&status.fork_id).map_err(SyncError::HandshakeMismatch)
    }
}

/// Run the status exchange over the two halves of a connection.
///
/// In impersonation mode the remote status is read first and the reply is
/// synthesized from the trusted cache the read just refreshed. Otherwise
/// both halves run concurrently, each under its own deadline.
pub async fn run<Si, St>(
    params: &HandshakeParams,
    cache: &TrustedNetworkCache,
    sink: &mut Si,
    stream: &mut St,
    peer: PeerId,
    remote_addr: String,
) -> Result<PeerSession, SyncError>
where
    Si: Sink<RawMsg, Error = SyncError> + Unpin,
    St: Stream<Item = Result<RawMsg, SyncError>> + Unpin,
{
    let timeout = params.timeout;
    let status = if params.impersonate {
        let remote = with_deadline(timeout, read_status(stream)).await?;
        params.trusted_match(&remote)?;
        cache.update(&remote);

        let outgoing = synthesize(params, cache);
        with_deadline(timeout, send_status(sink, outgoing)).await?;
        remote
    } else {
        let (sent, received) = tokio::join!(
            with_deadline(timeout, send_status(sink, params.local.clone())),
            with_deadline(timeout, read_status(stream)),
        );
        sent?;
        let remote = received?;
        params.trusted_match(&remote)?;
        params.local_match(&remote)?;
        cache.update(&remote);
        remote
    };

    info!(
        peer = %peer,
        addr = %remote_addr,
        version = status.protocol_version,
        network = status.network_id,
        fork_hash = %status.fork_id.hash,
        fork_next = status.fork_id.next,
        "handshake complete"
    );
    Ok(PeerSession::from_status(peer, remote_addr, &status))
}

fn synthesize(params: &HandshakeParams, cache: &TrustedNetworkCache) -> StatusPacket {
    let mut status = cache.snapshot().unwrap_or_else(|| params.local.clone());
    status.network_id = params.local.network_id;
    status
}

async fn with_deadline<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, SyncError>>,
) -> Result<T, SyncError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| SyncError::Timeout(timeout))?
}

async fn send_status<Si>(sink: &mut Si, status: StatusPacket) -> Result<(), SyncError>
where
    Si: Sink<RawMsg, Error = SyncError> + Unpin,
{
    sink.send(EthMessage::Status(status).encode()).await
}

async fn read_status<St>(stream: &mut St) -> Result<StatusPacket, SyncError>
where
    St: Stream<Item = Result<RawMsg, SyncError>> + Unpin,
{
    let msg = stream.next().await.ok_or(SyncError::Disconnected)??;
    if msg.code != codes::STATUS {
        return Err(SyncError::UnexpectedMessage {
            code: msg.code,
            reason: "first message is not status".into(),
        });
    }
    let status: StatusPacket = decode_exact(&msg.payload)?;
    debug!(
        network = status.network_id,
        genesis = %status.genesis,
        version = status.protocol_version,
        "received remote status"
    );
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ETH66;
    use alloy_primitives::U256;

    fn mainnet_status(td: u64) -> StatusPacket {
        StatusPacket {
            protocol_version: ETH66,
            network_id: MAINNET_NETWORK_ID,
            total_difficulty: U256::from(td),
            head: B256::repeat_byte(td as u8),
            genesis: MAINNET_GENESIS,
            fork_id: ForkId { hash: MAINNET_FORK_HASH, next: 0 },
        }
    }

    #[test]
    fn trusted_requires_all_three_fields() {
        let t = TrustedNetwork::mainnet();
        assert!(t.matches(&mainnet_status(1)));
        let mut s = mainnet_status(1);
        s.network_id = 5;
        assert!(!t.matches(&s));
        let mut s = mainnet_status(1);
        s.fork_id.hash = FixedBytes::ZERO;
        assert!(!t.matches(&s));
    }

    #[test]
    fn cache_keeps_latest_trusted_status() {
        let cache = TrustedNetworkCache::new();
        assert!(cache.snapshot().is_none());
        cache.update(&mainnet_status(3));
        cache.update(&mainnet_status(4));
        assert_eq!(cache.snapshot().unwrap().total_difficulty, U256::from(4u64));
    }

    #[test]
    fn exact_filter_rejects_other_forks() {
        let filter = exact_fork_filter(ForkId { hash: MAINNET_FORK_HASH, next: 0 });
        assert!(filter(&ForkId { hash: MAINNET_FORK_HASH, next: 99 }).is_ok());
        assert!(filter(&ForkId { hash: FixedBytes::ZERO, next: 0 }).is_err());
    }
}
