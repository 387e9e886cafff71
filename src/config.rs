use crate::{
    codec::MAX_MESSAGE_SIZE,
    fetcher::RttConfig,
    handshake::{exact_fork_filter, HandshakeParams, TrustedNetwork, HANDSHAKE_TIMEOUT, MAINNET_FORK_HASH, MAINNET_GENESIS},
    protocol::{ForkId, StatusPacket, ETH66},
    publisher::PublisherConfig,
};
use alloy_primitives::{FixedBytes, B256, U256};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::Path, str::FromStr, time::Duration};

/// Configuration used when no file is given or found.
pub const DEFAULT_CONFIG: &str = include_str!("../config.toml");

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub net: Net,
    #[serde(default)]
    pub handshake: Handshake,
    #[serde(default)]
    pub fetch: RttConfig,
    #[serde(default)]
    pub dedup: Dedup,
    #[serde(default)]
    pub registry: Registry,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub broker: Broker,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Net {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub bootstrap: Vec<String>, // host:port
    #[serde(default = "default_node_key")]
    pub node_key: String,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Handshake {
    #[serde(default = "default_handshake_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_network_id")]
    pub network_id: u64,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(default = "default_genesis")]
    pub genesis: B256,
    #[serde(default = "default_fork_hash")]
    pub fork_hash: FixedBytes<4>,
    #[serde(default)]
    pub fork_next: u64,
    #[serde(default = "default_genesis")]
    pub head: B256,
    /// Decimal or 0x-prefixed total difficulty.
    #[serde(default = "default_td")]
    pub td: String,
    #[serde(default)]
    pub impersonate: bool,
    #[serde(default = "default_trusted")]
    pub trusted: Vec<TrustedNetwork>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Dedup {
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,
    #[serde(default = "default_tx_capacity")]
    pub tx_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Registry {
    #[serde(default = "default_registry_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    #[serde(default = "default_storage_path")]
    pub path: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Local,
    Gossip,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Broker {
    #[serde(default)]
    pub kind: BrokerKind,
    #[serde(default = "default_broker_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub bootstrap: Vec<String>, // multiaddrs
    #[serde(default = "default_identity_path")]
    pub identity_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_listen() -> String { "0.0.0.0:30303".into() }
fn default_node_key() -> String { "node.key".into() }
fn default_max_frame_size() -> usize { MAX_MESSAGE_SIZE }
fn default_max_peers() -> usize { 50 }
fn default_handshake_timeout_ms() -> u64 { HANDSHAKE_TIMEOUT.as_millis() as u64 }
fn default_network_id() -> u64 { 1 }
fn default_protocol_version() -> u32 { ETH66 }
fn default_genesis() -> B256 { MAINNET_GENESIS }
fn default_fork_hash() -> FixedBytes<4> { MAINNET_FORK_HASH }
fn default_td() -> String { "17179869184".into() } // mainnet genesis difficulty
fn default_true() -> bool { true }
fn default_trusted() -> Vec<TrustedNetwork> { vec![TrustedNetwork::mainnet()] }
fn default_dedup_capacity() -> usize { 4096 }
fn default_tx_capacity() -> usize { 32_768 }
fn default_registry_capacity() -> usize { 4096 }
fn default_storage_path() -> String { "data/records".into() }
fn default_broker_port() -> u16 { 31000 }
fn default_identity_path() -> String { "peer_identity.key".into() }
fn default_bind() -> String { "0.0.0.0:9100".into() }

impl Default for Net {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            bootstrap: Vec::new(),
            node_key: default_node_key(),
            max_frame_size: default_max_frame_size(),
            max_peers: default_max_peers(),
        }
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            timeout_ms: default_handshake_timeout_ms(),
            network_id: default_network_id(),
            protocol_version: default_protocol_version(),
            genesis: default_genesis(),
            fork_hash: default_fork_hash(),
            fork_next: 0,
            head: default_genesis(),
            td: default_td(),
            impersonate: false,
            trusted: default_trusted(),
        }
    }
}

impl Default for Dedup {
    fn default() -> Self {
        Self { capacity: default_dedup_capacity(), tx_capacity: default_tx_capacity() }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self { capacity: default_registry_capacity() }
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self { path: default_storage_path(), enabled: true }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Local,
            listen_port: default_broker_port(),
            bootstrap: Vec::new(),
            identity_path: default_identity_path(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

impl Handshake {
    /// Local chain state as announced when not impersonating.
    pub fn local_status(&self) -> Result<StatusPacket> {
        let total_difficulty = U256::from_str(self.td.trim())
            .with_context(|| format!("invalid handshake.td '{}'", self.td))?;
        Ok(StatusPacket {
            protocol_version: self.protocol_version,
            network_id: self.network_id,
            total_difficulty,
            head: self.head,
            genesis: self.genesis,
            fork_id: ForkId { hash: self.fork_hash, next: self.fork_next },
        })
    }

    pub fn params(&self) -> Result<HandshakeParams> {
        if self.trusted.is_empty() {
            anyhow::bail!("handshake.trusted must list at least one network");
        }
        let local = self.local_status()?;
        Ok(HandshakeParams {
            timeout: Duration::from_millis(self.timeout_ms),
            fork_filter: exact_fork_filter(local.fork_id),
            local,
            trusted: self.trusted.clone(),
            impersonate: self.impersonate,
        })
    }
}

/// Read the TOML file at `p` and deserialize into `Config`.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read or parsed.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("couldn't read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Config> {
    toml::from_str(text).with_context(|| "invalid TOML in config file".to_string())
}

/// Load `p` if it exists, the embedded defaults otherwise.
pub fn load_or_default<P: AsRef<Path>>(p: P) -> Result<Config> {
    if p.as_ref().exists() {
        load(p)
    } else {
        load_from_str(DEFAULT_CONFIG)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_config_parses() {
        let cfg = load_from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(cfg.handshake.protocol_version, ETH66);
        assert!(!cfg.handshake.impersonate);
        assert_eq!(cfg.handshake.trusted, vec![TrustedNetwork::mainnet()]);
        assert_eq!(cfg.publisher.block_channel, "BlockInfo");
        assert_eq!(cfg.fetch.ttl_scaling, 3);
        assert_eq!(cfg.broker.kind, BrokerKind::Local);
    }

    #[test]
    fn empty_file_falls_back_to_defaults() {
        let cfg = load_from_str("").unwrap();
        assert_eq!(cfg.net.max_frame_size, MAX_MESSAGE_SIZE);
        assert_eq!(cfg.dedup.capacity, 4096);
        assert_eq!(cfg.broker.kind, BrokerKind::Local);
        let params = cfg.handshake.params().unwrap();
        assert_eq!(params.timeout, HANDSHAKE_TIMEOUT);
        assert_eq!(params.local.total_difficulty, U256::from(17_179_869_184u64));
    }

    #[test]
    fn trusted_networks_and_td_from_toml() {
        let cfg = load_from_str(
            r#"
            [handshake]
            impersonate = true
            td = "0x10"
            [[handshake.trusted]]
            network_id = 5
            genesis = "0xbf7e331f7f7c1dd2e05159666b3bf8bc7a8a3a9eb1d518969eab529dd9b88c1a"
            fork_hash = "0xf9843abf"
            "#,
        )
        .unwrap();
        assert!(cfg.handshake.impersonate);
        assert_eq!(cfg.handshake.trusted[0].network_id, 5);
        assert_eq!(cfg.handshake.local_status().unwrap().total_difficulty, U256::from(16u64));
    }

    #[test]
    fn bad_td_is_reported() {
        let cfg = load_from_str("[handshake]\ntd = \"lots\"\n").unwrap();
        assert!(cfg.handshake.local_status().is_err());
    }
}
