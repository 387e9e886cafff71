// Library interface for the peercollect node.
// Integration tests and the binary both drive the node through it.

pub mod broker;
pub mod codec;
pub mod collector;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fetcher;
pub mod gossip;
pub mod handshake;
pub mod metrics;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod publisher;
pub mod record;
pub mod registry;
pub mod request;
pub mod session;
pub mod storage;
pub mod sync;

pub use collector::Collector;
pub use dedup::AnnouncementDeduplicator;
pub use error::{SinkError, SyncError};
pub use fetcher::{FetchOrchestrator, HeaderSelector};
pub use handshake::{HandshakeParams, TrustedNetwork, TrustedNetworkCache};
pub use peer::{PeerId, PeerSession};
pub use publisher::{EventPublisher, MessageBroker, RecordStore};
pub use record::{BlockRecord, PublishableRecord, TransactionRecord};
pub use registry::PeerInfoRegistry;
pub use request::PendingRequestTable;
pub use storage::RocksStore;
