//! Wires the components together and runs the listener and dialer.

use crate::{
    broker::LocalBroker,
    codec,
    collector::Collector,
    config::{BrokerKind, Config},
    dedup::AnnouncementDeduplicator,
    fetcher::FetchOrchestrator,
    gossip::GossipBroker,
    handshake::TrustedNetworkCache,
    metrics::{self, Metrics},
    peer::{load_or_create_node_key, PeerId, PeerSet},
    publisher::{EventPublisher, MessageBroker, RecordStore},
    registry::PeerInfoRegistry,
    request::PendingRequestTable,
    session::{self, SessionContext},
    storage,
    sync,
};
use anyhow::{Context, Result};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run until `shutdown` fires, then drain the publisher.
pub async fn run(cfg: Config, shutdown: CancellationToken) -> Result<()> {
    let local_id = load_or_create_node_key(&cfg.net.node_key)
        .with_context(|| format!("loading node key {}", cfg.net.node_key))?;
    info!(node = %local_id, "local node id");

    let metrics = Arc::new(Metrics::new()?);
    if let Err(e) = metrics::serve(&cfg.metrics, (*metrics).clone()) {
        warn!(err = %e, "metrics exporter disabled");
    }

    let store: Option<Arc<dyn RecordStore>> = if cfg.storage.enabled {
        Some(storage::open(&cfg.storage)? as Arc<dyn RecordStore>)
    } else {
        None
    };
    let broker: Arc<dyn MessageBroker> = match cfg.broker.kind {
        BrokerKind::Local => {
            warn!("broker.kind = local: records are not published outside this process");
            Arc::new(LocalBroker::new())
        }
        BrokerKind::Gossip => {
            let topics = [cfg.publisher.block_channel.clone(), cfg.publisher.tx_channel.clone()];
            Arc::new(GossipBroker::spawn(&cfg.broker, &topics, shutdown.clone())?)
        }
    };
    let (publisher, workers) = EventPublisher::spawn(&cfg.publisher, store, broker, metrics.clone());

    let collector = Arc::new(Collector::new(
        Arc::new(PeerInfoRegistry::new(cfg.registry.capacity)),
        Arc::new(AnnouncementDeduplicator::new(cfg.dedup.capacity)),
        Arc::new(AnnouncementDeduplicator::new(cfg.dedup.tx_capacity)),
        publisher,
        metrics.clone(),
    ));
    let table = PendingRequestTable::new();
    let peers = PeerSet::default();
    let (announce_tx, announce_rx) = sync::channel();

    let ctx = Arc::new(SessionContext {
        handshake: cfg.handshake.params()?,
        trusted_cache: Arc::new(TrustedNetworkCache::new()),
        peers: peers.clone(),
        table: table.clone(),
        collector: collector.clone(),
        announcements: announce_tx,
        rtt: cfg.fetch.clone(),
        metrics: metrics.clone(),
        shutdown: shutdown.clone(),
    });

    let sync_task = sync::spawn(
        announce_rx,
        peers.clone(),
        FetchOrchestrator::new(table.clone(), metrics.clone()),
        collector,
        table,
        shutdown.clone(),
    );

    let listener = TcpListener::bind(&cfg.net.listen)
        .await
        .with_context(|| format!("binding {}", cfg.net.listen))?;
    info!(addr = %cfg.net.listen, "listening for peers");

    let mut sessions = JoinSet::new();
    for addr in &cfg.net.bootstrap {
        let (ctx, addr) = (ctx.clone(), addr.clone());
        let max_frame = cfg.net.max_frame_size;
        sessions.spawn(async move {
            match TcpStream::connect(&addr).await {
                Ok(stream) => serve_connection(ctx, stream, addr, local_id, max_frame).await,
                Err(e) => warn!(%addr, err = %e, "bootstrap dial failed"),
            }
        });
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("node received shutdown signal");
                break;
            }
            // Reap finished sessions so the set does not grow.
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        warn!(err = %e, "accept failed");
                        continue;
                    }
                };
                if peers.len() >= cfg.net.max_peers {
                    debug!(%remote, "peer limit reached, refusing connection");
                    continue;
                }
                sessions.spawn(serve_connection(ctx.clone(), stream, remote.to_string(), local_id, cfg.net.max_frame_size));
            }
        }
    }

    drop(listener);
    drop(ctx);
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while sessions.join_next().await.is_some() {}
        let _ = sync_task.await;
        workers.join().await;
    })
    .await;
    if drained.is_err() {
        warn!("shutdown drain timed out, pending records may be lost");
    }
    Ok(())
}

async fn serve_connection(
    ctx: Arc<SessionContext>,
    mut stream: TcpStream,
    remote: String,
    local_id: PeerId,
    max_frame_size: usize,
) {
    let _ = stream.set_nodelay(true);
    let remote_addr = stream.peer_addr().map(|a: SocketAddr| a.to_string()).unwrap_or(remote);

    let peer_id = match codec::exchange_node_ids(&mut stream, &local_id, ctx.handshake.timeout).await {
        Ok(id) if id == local_id => {
            debug!(addr = %remote_addr, "dropping connection to self");
            return;
        }
        Ok(id) => id,
        Err(e) => {
            debug!(addr = %remote_addr, err = %e, "hello failed");
            return;
        }
    };

    let framed = codec::framed(stream, max_frame_size);
    if let Err(e) = session::run(ctx, framed, peer_id, remote_addr.clone()).await {
        debug!(peer = %peer_id, addr = %remote_addr, err = %e, "session ended with error");
    }
}
