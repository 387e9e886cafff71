//! Per-connection task: handshake, then strictly ordered packet dispatch.

use crate::{
    codec::{RawMsg, WireFramed},
    collector::Collector,
    error::SyncError,
    fetcher::{RoundTripEstimator, RttConfig},
    handshake::{self, HandshakeParams, TrustedNetworkCache},
    metrics::Metrics,
    peer::{PeerHandle, PeerId, PeerSession, PeerSet},
    protocol::{
        BlockBodies, BlockHashNumber, BlockHeaders, EthMessage, NewBlock, PooledTransactions,
    },
    request::{Delivery, PendingRequestTable, ResponsePayload},
    sync::Announcement,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const OUTBOUND_QUEUE: usize = 64;

/// Everything a session shares with the rest of the node.
pub struct SessionContext {
    pub handshake: HandshakeParams,
    pub trusted_cache: Arc<TrustedNetworkCache>,
    pub peers: PeerSet,
    pub table: PendingRequestTable,
    pub collector: Arc<Collector>,
    pub announcements: mpsc::Sender<Announcement>,
    pub rtt: RttConfig,
    pub metrics: Arc<Metrics>,
    pub shutdown: CancellationToken,
}

/// Drive one connection until it closes, errors fatally or the node stops.
pub async fn run<S>(
    ctx: Arc<SessionContext>,
    framed: WireFramed<S>,
    peer_id: PeerId,
    remote_addr: String,
) -> Result<(), SyncError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sink, mut stream) = framed.split();

    let session = match handshake::run(
        &ctx.handshake,
        &ctx.trusted_cache,
        &mut sink,
        &mut stream,
        peer_id,
        remote_addr.clone(),
    )
    .await
    {
        Ok(session) => Arc::new(session),
        Err(e) => {
            ctx.metrics.handshake_failures.inc();
            return Err(e);
        }
    };
    ctx.collector.registry.observe(peer_id, remote_addr.clone());

    let (out_tx, mut out_rx) = mpsc::channel::<EthMessage>(OUTBOUND_QUEUE);
    let handle = Arc::new(PeerHandle::new(session.clone(), out_tx, RoundTripEstimator::new(&ctx.rtt)));
    if !ctx.peers.register(handle.clone()) {
        debug!(peer = %peer_id, "duplicate connection dropped");
        return Ok(());
    }
    ctx.metrics.connected_peers.inc();

    let closing = ctx.shutdown.child_token();
    let writer_token = closing.clone();
    let writer = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = writer_token.cancelled() => break,
                msg = out_rx.recv() => msg,
            };
            let Some(msg) = msg else { break };
            if let Err(e) = sink.send(msg.encode()).await {
                warn!(peer = %peer_id, err = %e, "write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let result = loop {
        let next = tokio::select! {
            _ = closing.cancelled() => break Ok(()),
            next = stream.next() => next,
        };
        let raw = match next {
            Some(Ok(raw)) => raw,
            Some(Err(e)) => break Err(e),
            None => break Ok(()),
        };
        if let Err(e) = dispatch(&ctx, &handle, &raw).await {
            if e.is_fatal() {
                break Err(e);
            }
            debug!(peer = %peer_id, code = raw.code, err = %e, "packet ignored");
        }
    };

    closing.cancel();
    ctx.peers.unregister(&peer_id);
    ctx.metrics.connected_peers.dec();
    let _ = writer.await;

    match &result {
        Ok(()) => info!(peer = %peer_id, addr = %remote_addr, "peer disconnected"),
        Err(e) => warn!(peer = %peer_id, addr = %remote_addr, err = %e, "peer dropped"),
    }
    result
}

async fn dispatch(ctx: &SessionContext, peer: &Arc<PeerHandle>, raw: &RawMsg) -> Result<(), SyncError> {
    let id = peer.id();
    match EthMessage::decode(raw)? {
        EthMessage::Status(_) => Err(SyncError::UnexpectedMessage {
            code: raw.code,
            reason: "status after handshake".into(),
        }),
        EthMessage::NewBlockHashes(announced) => {
            announce_blocks(ctx, id, announced);
            Ok(())
        }
        EthMessage::NewBlock(packet) => handle_new_block(ctx, peer.session(), packet),
        EthMessage::Transactions(txs) => {
            ctx.collector.collect_transactions(&id, &txs)?;
            Ok(())
        }
        EthMessage::PooledTransactions(PooledTransactions { transactions, .. }) => {
            ctx.collector.collect_transactions(&id, &transactions)?;
            Ok(())
        }
        EthMessage::NewPooledTransactionHashes(hashes) => {
            let unknown: Vec<_> =
                hashes.into_iter().filter(|h| !ctx.collector.transactions.contains(h)).collect();
            if !unknown.is_empty() {
                forward(ctx, Announcement::Transactions { peer: id, hashes: unknown });
            }
            Ok(())
        }
        EthMessage::BlockHeaders(BlockHeaders { request_id, headers }) => {
            deliver(ctx, &id, request_id, ResponsePayload::Headers(headers))
        }
        EthMessage::BlockBodies(BlockBodies { request_id, bodies }) => {
            deliver(ctx, &id, request_id, ResponsePayload::Bodies(bodies))
        }
        // Nothing is served: answer with an empty response of the same id.
        EthMessage::GetBlockHeaders(req) => {
            let reply = BlockHeaders { request_id: req.request_id, headers: Vec::new() };
            peer.send(EthMessage::BlockHeaders(reply)).await
        }
        EthMessage::GetBlockBodies(req) => {
            let reply = BlockBodies { request_id: req.request_id, bodies: Vec::new() };
            peer.send(EthMessage::BlockBodies(reply)).await
        }
        EthMessage::GetPooledTransactions(req) => {
            let reply = PooledTransactions { request_id: req.request_id, transactions: Vec::new() };
            peer.send(EthMessage::PooledTransactions(reply)).await
        }
    }
}

fn announce_blocks(ctx: &SessionContext, peer: PeerId, announced: Vec<BlockHashNumber>) {
    for BlockHashNumber { hash, number } in announced {
        if ctx.collector.blocks.contains(&hash) {
            continue;
        }
        debug!(peer = %peer, %hash, number, "block announced");
        forward(ctx, Announcement::Block { peer, hash, number });
    }
}

fn forward(ctx: &SessionContext, announcement: Announcement) {
    if let Err(e) = ctx.announcements.try_send(announcement) {
        debug!(err = %e, "announcement queue full, dropping");
    }
}

fn handle_new_block(ctx: &SessionContext, session: &PeerSession, packet: NewBlock) -> Result<(), SyncError> {
    let header = packet.block.header()?;
    ctx.collector.collect_block_header(&session.id, &header)?;

    // The announced block is the peer's new head only once its parent is;
    // the parent's weight is td minus this block's difficulty.
    let parent = header.parent_hash()?;
    let parent_td = packet.td.saturating_sub(header.difficulty()?);
    if session.set_head_if_heavier(parent, parent_td) {
        debug!(peer = %session.id, head = %parent, td = %parent_td, "peer head advanced");
    }
    Ok(())
}

fn deliver(ctx: &SessionContext, peer: &PeerId, request_id: u64, payload: ResponsePayload) -> Result<(), SyncError> {
    match ctx.table.deliver(peer, request_id, payload)? {
        // The waiting fetch acknowledges on its own time; the read loop moves on.
        Delivery::Delivered(_ack) => Ok(()),
        Delivery::Discarded => Ok(()),
    }
}
