//! Turns observed headers and transactions into deduplicated records.

use crate::{
    dedup::AnnouncementDeduplicator,
    error::SyncError,
    metrics::Metrics,
    peer::PeerId,
    protocol::{BlockHeader, Transaction},
    publisher::EventPublisher,
    record::{BlockRecord, PublishableRecord, TransactionRecord},
    registry::PeerInfoRegistry,
};
use alloy_primitives::Bytes;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// Shared by every session and the sync loop.
pub struct Collector {
    pub registry: Arc<PeerInfoRegistry>,
    pub blocks: Arc<AnnouncementDeduplicator>,
    pub transactions: Arc<AnnouncementDeduplicator>,
    pub publisher: EventPublisher,
    metrics: Arc<Metrics>,
}

impl Collector {
    pub fn new(
        registry: Arc<PeerInfoRegistry>,
        blocks: Arc<AnnouncementDeduplicator>,
        transactions: Arc<AnnouncementDeduplicator>,
        publisher: EventPublisher,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { registry, blocks, transactions, publisher, metrics }
    }

    /// Submit the header if its hash has not been seen. Returns whether it was queued.
    pub fn collect_block_header(&self, peer: &PeerId, header: &BlockHeader) -> Result<bool, SyncError> {
        let number = header.number()?;
        let hash = header.hash();
        if !self.blocks.mark_if_new(hash) {
            self.metrics.dedup_suppressed.inc();
            debug!(peer = %peer, %hash, number, "block already collected");
            return Ok(false);
        }
        let record = BlockRecord {
            number,
            hash,
            payload: header.rlp().clone(),
            peer_id: peer.to_string(),
            peer_address: self.registry.address_or_sentinel(peer),
            timestamp: Utc::now(),
        };
        if !self.publisher.submit(PublishableRecord::Block(record)) {
            self.blocks.forget(&hash);
            return Ok(false);
        }
        debug!(peer = %peer, %hash, number, "collected block");
        Ok(true)
    }

    /// Submit every not yet seen transaction. Returns how many were new.
    pub fn collect_transactions(&self, peer: &PeerId, txs: &[Transaction]) -> Result<usize, SyncError> {
        let address = self.registry.address_or_sentinel(peer);
        let mut fresh = 0;
        for tx in txs {
            let hash = tx.hash()?;
            let payload = Bytes::copy_from_slice(tx.canonical()?);
            if !self.transactions.mark_if_new(hash) {
                self.metrics.dedup_suppressed.inc();
                continue;
            }
            let record = TransactionRecord {
                hash,
                payload,
                peer_id: peer.to_string(),
                peer_address: address.clone(),
                timestamp: Utc::now(),
            };
            if !self.publisher.submit(PublishableRecord::Transaction(record)) {
                // Rejected records stay eligible for the next announcement.
                self.transactions.forget(&hash);
                continue;
            }
            fresh += 1;
        }
        Ok(fresh)
    }
}
