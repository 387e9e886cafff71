use crate::{
    collector::Collector,
    error::SyncError,
    fetcher::{FetchOrchestrator, HeaderSelector},
    peer::{PeerId, PeerSet},
    protocol::{EthMessage, GetPooledTransactions},
    request::PendingRequestTable,
};
use alloy_primitives::B256;
use std::{sync::Arc, time::Instant};
use tokio::{
    sync::{mpsc, Semaphore},
    task::{self, JoinHandle},
    time::{interval, Duration},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_CONCURRENT_HEADER_REQUESTS: usize = 16;
const ANNOUNCEMENT_QUEUE: usize = 1024;
// Sweeps table entries whose waiter leaked without releasing them.
const EXPIRE_SWEEP_SECS: u64 = 30;
// eth/66 soft limit on hashes per GetPooledTransactions.
const MAX_POOLED_TX_REQUEST: usize = 256;

/// Work forwarded from session read loops.
#[derive(Debug, Clone)]
pub enum Announcement {
    Block { peer: PeerId, hash: B256, number: u64 },
    Transactions { peer: PeerId, hashes: Vec<B256> },
}

pub fn channel() -> (mpsc::Sender<Announcement>, mpsc::Receiver<Announcement>) {
    mpsc::channel(ANNOUNCEMENT_QUEUE)
}

/// Fetch announced headers through the orchestrator and collect them.
pub fn spawn(
    mut rx: mpsc::Receiver<Announcement>,
    peers: PeerSet,
    fetcher: FetchOrchestrator,
    collector: Arc<Collector>,
    table: PendingRequestTable,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    task::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_HEADER_REQUESTS));
        let mut sweep = interval(Duration::from_secs(EXPIRE_SWEEP_SECS));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("sync loop received shutdown signal");
                    break;
                }

                _ = sweep.tick() => {
                    let expired = table.expire(Instant::now());
                    if expired > 0 {
                        debug!(expired, "swept expired requests");
                    }
                }

                next = rx.recv() => {
                    let Some(announcement) = next else { break };
                    match announcement {
                        Announcement::Block { peer, hash, number } => {
                            // Another peer may have delivered it meanwhile.
                            if collector.blocks.contains(&hash) {
                                continue;
                            }
                            let Ok(permit) = semaphore.clone().acquire_owned().await else { break };
                            let (peers, fetcher, collector, cancel) =
                                (peers.clone(), fetcher.clone(), collector.clone(), shutdown.clone());
                            task::spawn(async move {
                                let _permit = permit;
                                if let Err(e) = fetch_announced(&peers, &fetcher, &collector, peer, hash, &cancel).await {
                                    log_fetch_error(peer, hash, number, &e);
                                }
                            });
                        }
                        Announcement::Transactions { peer, hashes } => {
                            request_pooled(&peers, peer, hashes);
                        }
                    }
                }
            }
        }
    })
}

async fn fetch_announced(
    peers: &PeerSet,
    fetcher: &FetchOrchestrator,
    collector: &Collector,
    peer: PeerId,
    hash: B256,
    cancel: &CancellationToken,
) -> Result<(), SyncError> {
    let Some(handle) = peers.get(&peer) else {
        return Err(SyncError::Disconnected);
    };
    let (headers, hashes) = fetcher
        .fetch_headers(&handle, HeaderSelector::Hash(hash), 1, 0, false, cancel)
        .await?;
    for (header, got) in headers.iter().zip(hashes) {
        if got != hash {
            debug!(peer = %peer, want = %hash, %got, "peer answered with a different header");
            continue;
        }
        collector.collect_block_header(&peer, header)?;
    }
    Ok(())
}

/// Pooled transactions arrive as an ordinary PooledTransactions packet and
/// are collected by the session; nothing waits for them here. Never blocks
/// the loop: a peer with a full outbound queue simply misses the request.
fn request_pooled(peers: &PeerSet, peer: PeerId, hashes: Vec<B256>) {
    let Some(handle) = peers.get(&peer) else { return };
    for chunk in hashes.chunks(MAX_POOLED_TX_REQUEST) {
        let request = GetPooledTransactions { request_id: rand::random(), hashes: chunk.to_vec() };
        if let Err(e) = handle.try_send(EthMessage::GetPooledTransactions(request)) {
            debug!(peer = %peer, err = %e, "pooled transaction request not sent");
            return;
        }
    }
}

fn log_fetch_error(peer: PeerId, hash: B256, number: u64, e: &SyncError) {
    match e {
        SyncError::Canceled | SyncError::Disconnected => debug!(peer = %peer, %hash, number, err = %e, "header fetch abandoned"),
        _ => warn!(peer = %peer, %hash, number, err = %e, "header fetch failed"),
    }
}
