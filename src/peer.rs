use crate::{
    error::SyncError,
    fetcher::RoundTripEstimator,
    protocol::{EthMessage, ForkId, StatusPacket},
};
use alloy_primitives::{B256, U256};
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, fmt, fs, path::Path, sync::Arc, time::Duration};
use tokio::sync::mpsc;

/// Opaque peer identity: the 32 byte node id announced in the transport hello.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &hex::encode(self.0)[..16])
    }
}

/// Load the local node id from `path`, creating a fresh one on first start.
pub fn load_or_create_node_key(path: &str) -> anyhow::Result<PeerId> {
    if Path::new(path).exists() {
        let data = fs::read(path)?;
        let bytes: [u8; 32] = data
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("node key {} must be 32 bytes, found {}", path, data.len()))?;
        return Ok(PeerId::new(bytes));
    }
    let id = PeerId::random();
    if let Some(parent) = Path::new(path).parent() {
        fs::create_dir_all(parent).ok();
    }
    fs::write(path, id.as_bytes())?;
    Ok(id)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerHead {
    pub hash: B256,
    pub total_difficulty: U256,
}

/// State negotiated with one peer. Exists only after a successful handshake.
#[derive(Debug)]
pub struct PeerSession {
    pub id: PeerId,
    pub protocol_version: u32,
    pub network_id: u64,
    pub genesis: B256,
    pub fork_id: ForkId,
    pub remote_addr: String,
    head: RwLock<PeerHead>,
}

impl PeerSession {
    pub fn from_status(id: PeerId, remote_addr: String, status: &StatusPacket) -> Self {
        Self {
            id,
            protocol_version: status.protocol_version,
            network_id: status.network_id,
            genesis: status.genesis,
            fork_id: status.fork_id,
            remote_addr,
            head: RwLock::new(PeerHead { hash: status.head, total_difficulty: status.total_difficulty }),
        }
    }

    pub fn head(&self) -> PeerHead {
        *self.head.read()
    }

    /// Advance the head iff `td` is strictly heavier; total difficulty never
    /// moves backwards.
    pub fn set_head_if_heavier(&self, hash: B256, td: U256) -> bool {
        let mut head = self.head.write();
        if td > head.total_difficulty {
            *head = PeerHead { hash, total_difficulty: td };
            return true;
        }
        false
    }
}

/// Handle other tasks use to talk to a live session.
pub struct PeerHandle {
    session: Arc<PeerSession>,
    outbound: mpsc::Sender<EthMessage>,
    rtt: Mutex<RoundTripEstimator>,
}

impl PeerHandle {
    pub fn new(session: Arc<PeerSession>, outbound: mpsc::Sender<EthMessage>, rtt: RoundTripEstimator) -> Self {
        Self { session, outbound, rtt: Mutex::new(rtt) }
    }

    pub fn id(&self) -> PeerId {
        self.session.id
    }

    pub fn session(&self) -> &Arc<PeerSession> {
        &self.session
    }

    pub async fn send(&self, msg: EthMessage) -> Result<(), SyncError> {
        let code = msg.code();
        self.outbound
            .send(msg)
            .await
            .map_err(|_| SyncError::RequestSendFailed(format!("peer {} gone (code {code:#04x})", self.id())))
    }

    /// Enqueue without waiting; a full queue is a failed send.
    pub fn try_send(&self, msg: EthMessage) -> Result<(), SyncError> {
        let code = msg.code();
        self.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                SyncError::RequestSendFailed(format!("peer {} outbound queue full (code {code:#04x})", self.id()))
            }
            mpsc::error::TrySendError::Closed(_) => {
                SyncError::RequestSendFailed(format!("peer {} gone (code {code:#04x})", self.id()))
            }
        })
    }

    pub fn target_timeout(&self) -> Duration {
        self.rtt.lock().target_timeout()
    }

    pub fn record_round_trip(&self, elapsed: Duration) {
        self.rtt.lock().update(elapsed);
    }
}

/// Live sessions keyed by peer id.
#[derive(Clone, Default)]
pub struct PeerSet {
    inner: Arc<RwLock<HashMap<PeerId, Arc<PeerHandle>>>>,
}

impl PeerSet {
    /// Returns false when the peer already has a live session.
    pub fn register(&self, handle: Arc<PeerHandle>) -> bool {
        let mut peers = self.inner.write();
        if peers.contains_key(&handle.id()) {
            return false;
        }
        peers.insert(handle.id(), handle);
        true
    }

    pub fn unregister(&self, id: &PeerId) -> Option<Arc<PeerHandle>> {
        self.inner.write().remove(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<PeerHandle>> {
        self.inner.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
