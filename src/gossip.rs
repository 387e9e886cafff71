//! Broker that publishes records as gossipsub messages over QUIC.

use crate::{config, error::SinkError, publisher::MessageBroker};
use async_trait::async_trait;
use libp2p::{
    core::muxing::StreamMuxerBox,
    futures::StreamExt,
    gossipsub::{
        self, AllowAllSubscriptionFilter, Behaviour as Gossipsub, Event as GossipsubEvent, IdentTopic,
        IdentityTransform, MessageAuthenticity, PublishError,
    },
    identity, quic,
    swarm::SwarmEvent,
    Multiaddr, PeerId, Swarm, Transport,
};
use std::{collections::VecDeque, fs, path::Path};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// Messages held while no gossip peer is connected.
const MAX_PENDING: usize = 1024;

struct PublishCommand {
    topic: String,
    payload: Vec<u8>,
    reply: oneshot::Sender<Result<(), SinkError>>,
}

pub struct GossipBroker {
    command_tx: mpsc::UnboundedSender<PublishCommand>,
}

fn load_or_create_identity(path: &str) -> anyhow::Result<identity::Keypair> {
    if Path::new(path).exists() {
        let key_data = fs::read(path)?;
        return Ok(identity::Keypair::from_protobuf_encoding(&key_data)?);
    }
    let keypair = identity::Keypair::generate_ed25519();
    fs::write(path, keypair.to_protobuf_encoding()?)?;
    Ok(keypair)
}

impl GossipBroker {
    pub fn spawn(cfg: &config::Broker, topics: &[String], shutdown: CancellationToken) -> anyhow::Result<Self> {
        let id_keys = load_or_create_identity(&cfg.identity_path)?;
        let peer_id = PeerId::from(id_keys.public());
        info!(%peer_id, "gossip broker identity");

        let transport = quic::tokio::Transport::new(quic::Config::new(&id_keys))
            .map(|(peer_id, muxer), _| (peer_id, StreamMuxerBox::new(muxer)))
            .boxed();

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(std::time::Duration::from_secs(1))
            .validation_mode(gossipsub::ValidationMode::Permissive)
            .mesh_n_low(0)
            .mesh_outbound_min(0)
            .flood_publish(true)
            .build()?;

        let mut gs: Gossipsub<IdentityTransform, AllowAllSubscriptionFilter> =
            Gossipsub::new(MessageAuthenticity::Signed(id_keys.clone()), gossipsub_config)
                .map_err(|e| anyhow::anyhow!(e))?;
        for t in topics {
            gs.subscribe(&IdentTopic::new(t))?;
        }

        let mut swarm = Swarm::new(
            transport,
            gs,
            peer_id,
            libp2p::swarm::Config::with_tokio_executor()
                .with_idle_connection_timeout(std::time::Duration::from_secs(20)),
        );

        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/udp/{}/quic-v1", cfg.listen_port).parse()?;
        swarm.listen_on(listen_addr)?;
        for addr in &cfg.bootstrap {
            match swarm.dial(addr.parse::<Multiaddr>()?) {
                Ok(_) => debug!(%addr, "gossip bootstrap dial initiated"),
                Err(e) => warn!(%addr, err = %e, "failed to dial gossip bootstrap node"),
            }
        }

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<PublishCommand>();
        tokio::spawn(async move {
            let mut pending: VecDeque<(String, Vec<u8>)> = VecDeque::new();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,

                    event = swarm.select_next_some() => match event {
                        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                            debug!(%peer_id, "gossip peer connected");
                            let mut still_pending = VecDeque::new();
                            while let Some((topic, data)) = pending.pop_front() {
                                if swarm.behaviour_mut().publish(IdentTopic::new(&topic), data.clone()).is_err() {
                                    still_pending.push_back((topic, data));
                                }
                            }
                            pending = still_pending;
                        }
                        SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                            debug!(%peer_id, ?cause, "gossip peer disconnected");
                        }
                        SwarmEvent::Behaviour(GossipsubEvent::Message { message, .. }) => {
                            debug!(topic = %message.topic, bytes = message.data.len(), "ignoring inbound gossip");
                        }
                        _ => {}
                    },

                    cmd = command_rx.recv() => {
                        let Some(PublishCommand { topic, payload, reply }) = cmd else { break };
                        let result = match swarm.behaviour_mut().publish(IdentTopic::new(&topic), payload.clone()) {
                            Ok(_) | Err(PublishError::Duplicate) => Ok(()),
                            Err(PublishError::InsufficientPeers) => {
                                if pending.len() >= MAX_PENDING {
                                    pending.pop_front();
                                }
                                pending.push_back((topic, payload));
                                Ok(())
                            }
                            Err(e) => Err(SinkError::Rejected(e.to_string())),
                        };
                        let _ = reply.send(result);
                    }
                }
            }
            debug!("gossip broker stopped");
        });

        Ok(Self { command_tx })
    }
}

#[async_trait]
impl MessageBroker for GossipBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), SinkError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(PublishCommand { topic: channel.to_string(), payload, reply })
            .map_err(|_| SinkError::Unavailable("gossip task stopped".into()))?;
        rx.await.map_err(|_| SinkError::Unavailable("gossip task stopped".into()))?
    }
}
