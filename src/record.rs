//! Records handed to the downstream sinks.

use alloy_primitives::{Bytes, B256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SinkError;

/// A block header observed on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    #[serde(rename = "blocknum")]
    pub number: u64,
    #[serde(rename = "blockhash")]
    pub hash: B256,
    /// RLP of the header exactly as received.
    #[serde(rename = "data")]
    pub payload: Bytes,
    #[serde(rename = "peerid")]
    pub peer_id: String,
    #[serde(rename = "peeraddress")]
    pub peer_address: String,
    pub timestamp: DateTime<Utc>,
}

/// A transaction observed on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    #[serde(rename = "txhash")]
    pub hash: B256,
    /// Canonical transaction encoding.
    #[serde(rename = "data")]
    pub payload: Bytes,
    #[serde(rename = "peerid")]
    pub peer_id: String,
    #[serde(rename = "peeraddr")]
    pub peer_address: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishableRecord {
    Block(BlockRecord),
    Transaction(TransactionRecord),
}

impl PublishableRecord {
    pub fn hash(&self) -> B256 {
        match self {
            PublishableRecord::Block(b) => b.hash,
            PublishableRecord::Transaction(t) => t.hash,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PublishableRecord::Block(_) => "block",
            PublishableRecord::Transaction(_) => "tx",
        }
    }

    /// JSON body published on the broker channel.
    pub fn to_json(&self) -> Result<Vec<u8>, SinkError> {
        let encoded = match self {
            PublishableRecord::Block(b) => serde_json::to_vec(b),
            PublishableRecord::Transaction(t) => serde_json::to_vec(t),
        };
        encoded.map_err(|e| SinkError::Encode(e.to_string()))
    }
}

impl From<BlockRecord> for PublishableRecord {
    fn from(r: BlockRecord) -> Self {
        PublishableRecord::Block(r)
    }
}

impl From<TransactionRecord> for PublishableRecord {
    fn from(r: TransactionRecord) -> Self {
        PublishableRecord::Transaction(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_json_uses_wire_field_names() {
        let record = BlockRecord {
            number: 17,
            hash: B256::repeat_byte(0xab),
            payload: Bytes::from_static(&[0xc0]),
            peer_id: "aa".into(),
            peer_address: "127.0.0.1".into(),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        let json: serde_json::Value =
            serde_json::from_slice(&PublishableRecord::from(record).to_json().unwrap()).unwrap();
        assert_eq!(json["blocknum"], 17);
        assert_eq!(json["data"], "0xc0");
        assert_eq!(json["peeraddress"], "127.0.0.1");
        assert!(json["blockhash"].as_str().unwrap().starts_with("0xabab"));
    }
}
