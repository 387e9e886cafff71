//! eth wire packets (eth/66 request-id framing) and the closed message set
//! exchanged with a peer.

use crate::{codec::RawMsg, error::SyncError};
use alloy_primitives::{keccak256, Bytes, FixedBytes, B256, U256};
use alloy_rlp::{BufMut, Decodable, Encodable, Header, RlpDecodable, RlpEncodable};

pub const ETH66: u32 = 66;

pub mod codes {
    pub const STATUS: u64 = 0x00;
    pub const NEW_BLOCK_HASHES: u64 = 0x01;
    pub const TRANSACTIONS: u64 = 0x02;
    pub const GET_BLOCK_HEADERS: u64 = 0x03;
    pub const BLOCK_HEADERS: u64 = 0x04;
    pub const GET_BLOCK_BODIES: u64 = 0x05;
    pub const BLOCK_BODIES: u64 = 0x06;
    pub const NEW_BLOCK: u64 = 0x07;
    pub const NEW_POOLED_TRANSACTION_HASHES: u64 = 0x08;
    pub const GET_POOLED_TRANSACTIONS: u64 = 0x09;
    pub const POOLED_TRANSACTIONS: u64 = 0x0a;
}

// Header list positions.
const HEADER_PARENT_HASH: usize = 0;
const HEADER_DIFFICULTY: usize = 7;
const HEADER_NUMBER: usize = 8;

/// Fork identifier as defined by EIP-2124.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, RlpEncodable, RlpDecodable)]
pub struct ForkId {
    pub hash: FixedBytes<4>,
    pub next: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct StatusPacket {
    pub protocol_version: u32,
    pub network_id: u64,
    pub total_difficulty: U256,
    pub head: B256,
    pub genesis: B256,
    pub fork_id: ForkId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct BlockHashNumber {
    pub hash: B256,
    pub number: u64,
}

/// Origin of a header query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashOrNumber {
    Hash(B256),
    Number(u64),
}

impl Encodable for HashOrNumber {
    fn encode(&self, out: &mut dyn BufMut) {
        match self {
            HashOrNumber::Hash(h) => h.encode(out),
            HashOrNumber::Number(n) => n.encode(out),
        }
    }

    fn length(&self) -> usize {
        match self {
            HashOrNumber::Hash(h) => h.length(),
            HashOrNumber::Number(n) => n.length(),
        }
    }
}

impl Decodable for HashOrNumber {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let (item, _) = split_item(*buf)?;
        // A 32 byte string is a hash, anything else must fit a u64.
        if item.len() == 33 {
            Ok(HashOrNumber::Hash(B256::decode(buf)?))
        } else {
            Ok(HashOrNumber::Number(u64::decode(buf)?))
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct HeadersQuery {
    pub origin: HashOrNumber,
    pub amount: u64,
    pub skip: u64,
    pub reverse: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct GetBlockHeaders {
    pub request_id: u64,
    pub query: HeadersQuery,
}

#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct BlockHeaders {
    pub request_id: u64,
    pub headers: Vec<BlockHeader>,
}

#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct GetBlockBodies {
    pub request_id: u64,
    pub hashes: Vec<B256>,
}

#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct BlockBodies {
    pub request_id: u64,
    pub bodies: Vec<RawRlp>,
}

#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct NewBlock {
    pub block: Block,
    pub td: U256,
}

#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct GetPooledTransactions {
    pub request_id: u64,
    pub hashes: Vec<B256>,
}

#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct PooledTransactions {
    pub request_id: u64,
    pub transactions: Vec<Transaction>,
}

/// One RLP item kept verbatim. Content is never interpreted beyond what the
/// accessor methods of the wrapping types need.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawRlp(pub Bytes);

impl RawRlp {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    fn is_list(&self) -> bool {
        self.0.first().is_some_and(|b| *b >= alloy_rlp::EMPTY_LIST_CODE)
    }
}

impl Encodable for RawRlp {
    fn encode(&self, out: &mut dyn BufMut) {
        out.put_slice(&self.0);
    }

    fn length(&self) -> usize {
        self.0.len()
    }
}

impl Decodable for RawRlp {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let (item, rest) = split_item(*buf)?;
        let raw = RawRlp(Bytes::from(item.to_vec()));
        *buf = rest;
        Ok(raw)
    }
}

/// Block header as the raw RLP list received from the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader(RawRlp);

impl BlockHeader {
    pub fn from_rlp(raw: Bytes) -> Result<Self, SyncError> {
        let raw = RawRlp(raw);
        if !raw.is_list() {
            return Err(SyncError::DecodeError("block header is not a list".into()));
        }
        split_item(raw.as_slice())?;
        Ok(BlockHeader(raw))
    }

    pub fn hash(&self) -> B256 {
        keccak256(self.0.as_slice())
    }

    pub fn number(&self) -> Result<u64, SyncError> {
        Ok(list_field(self.0.as_slice(), HEADER_NUMBER)?)
    }

    pub fn parent_hash(&self) -> Result<B256, SyncError> {
        Ok(list_field(self.0.as_slice(), HEADER_PARENT_HASH)?)
    }

    pub fn difficulty(&self) -> Result<U256, SyncError> {
        Ok(list_field(self.0.as_slice(), HEADER_DIFFICULTY)?)
    }

    pub fn rlp(&self) -> &Bytes {
        &self.0 .0
    }
}

impl Encodable for BlockHeader {
    fn encode(&self, out: &mut dyn BufMut) {
        self.0.encode(out)
    }

    fn length(&self) -> usize {
        self.0.length()
    }
}

impl Decodable for BlockHeader {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let raw = RawRlp::decode(buf)?;
        if !raw.is_list() {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        Ok(BlockHeader(raw))
    }
}

/// Full block `[header, transactions, uncles, ...]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block(RawRlp);

impl Block {
    pub fn from_rlp(raw: Bytes) -> Self {
        Block(RawRlp(raw))
    }

    pub fn header(&self) -> Result<BlockHeader, SyncError> {
        let item = nth_item(self.0.as_slice(), 0)?;
        BlockHeader::from_rlp(Bytes::from(item.to_vec()))
    }
}

impl Encodable for Block {
    fn encode(&self, out: &mut dyn BufMut) {
        self.0.encode(out)
    }

    fn length(&self) -> usize {
        self.0.length()
    }
}

impl Decodable for Block {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let raw = RawRlp::decode(buf)?;
        if !raw.is_list() {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        Ok(Block(raw))
    }
}

/// Transaction in network encoding: a list for legacy transactions, a byte
/// string wrapping the typed envelope otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction(RawRlp);

impl Transaction {
    pub fn from_rlp(raw: Bytes) -> Self {
        Transaction(RawRlp(raw))
    }

    /// Canonical encoding the transaction hash is computed over.
    pub fn canonical(&self) -> Result<&[u8], SyncError> {
        if self.0.is_list() {
            return Ok(self.0.as_slice());
        }
        let mut buf = self.0.as_slice();
        let header = Header::decode(&mut buf)?;
        if buf.len() < header.payload_length {
            return Err(SyncError::DecodeError("truncated typed transaction".into()));
        }
        Ok(&buf[..header.payload_length])
    }

    pub fn hash(&self) -> Result<B256, SyncError> {
        Ok(keccak256(self.canonical()?))
    }

    pub fn rlp(&self) -> &Bytes {
        &self.0 .0
    }
}

impl Encodable for Transaction {
    fn encode(&self, out: &mut dyn BufMut) {
        self.0.encode(out)
    }

    fn length(&self) -> usize {
        self.0.length()
    }
}

impl Decodable for Transaction {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        Ok(Transaction(RawRlp::decode(buf)?))
    }
}

/// Every message of the eth sub-protocol this node understands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EthMessage {
    Status(StatusPacket),
    NewBlockHashes(Vec<BlockHashNumber>),
    Transactions(Vec<Transaction>),
    GetBlockHeaders(GetBlockHeaders),
    BlockHeaders(BlockHeaders),
    GetBlockBodies(GetBlockBodies),
    BlockBodies(BlockBodies),
    NewBlock(NewBlock),
    NewPooledTransactionHashes(Vec<B256>),
    GetPooledTransactions(GetPooledTransactions),
    PooledTransactions(PooledTransactions),
}

impl EthMessage {
    pub fn code(&self) -> u64 {
        match self {
            EthMessage::Status(_) => codes::STATUS,
            EthMessage::NewBlockHashes(_) => codes::NEW_BLOCK_HASHES,
            EthMessage::Transactions(_) => codes::TRANSACTIONS,
            EthMessage::GetBlockHeaders(_) => codes::GET_BLOCK_HEADERS,
            EthMessage::BlockHeaders(_) => codes::BLOCK_HEADERS,
            EthMessage::GetBlockBodies(_) => codes::GET_BLOCK_BODIES,
            EthMessage::BlockBodies(_) => codes::BLOCK_BODIES,
            EthMessage::NewBlock(_) => codes::NEW_BLOCK,
            EthMessage::NewPooledTransactionHashes(_) => codes::NEW_POOLED_TRANSACTION_HASHES,
            EthMessage::GetPooledTransactions(_) => codes::GET_POOLED_TRANSACTIONS,
            EthMessage::PooledTransactions(_) => codes::POOLED_TRANSACTIONS,
        }
    }

    pub fn encode(&self) -> RawMsg {
        let payload = match self {
            EthMessage::Status(p) => alloy_rlp::encode(p),
            EthMessage::NewBlockHashes(p) => alloy_rlp::encode(p),
            EthMessage::Transactions(p) => alloy_rlp::encode(p),
            EthMessage::GetBlockHeaders(p) => alloy_rlp::encode(p),
            EthMessage::BlockHeaders(p) => alloy_rlp::encode(p),
            EthMessage::GetBlockBodies(p) => alloy_rlp::encode(p),
            EthMessage::BlockBodies(p) => alloy_rlp::encode(p),
            EthMessage::NewBlock(p) => alloy_rlp::encode(p),
            EthMessage::NewPooledTransactionHashes(p) => alloy_rlp::encode(p),
            EthMessage::GetPooledTransactions(p) => alloy_rlp::encode(p),
            EthMessage::PooledTransactions(p) => alloy_rlp::encode(p),
        };
        RawMsg::new(self.code(), payload.into())
    }

    pub fn decode(msg: &RawMsg) -> Result<Self, SyncError> {
        let payload = &msg.payload[..];
        let decoded = match msg.code {
            codes::STATUS => EthMessage::Status(decode_exact(payload)?),
            codes::NEW_BLOCK_HASHES => EthMessage::NewBlockHashes(decode_exact(payload)?),
            codes::TRANSACTIONS => EthMessage::Transactions(decode_exact(payload)?),
            codes::GET_BLOCK_HEADERS => EthMessage::GetBlockHeaders(decode_exact(payload)?),
            codes::BLOCK_HEADERS => EthMessage::BlockHeaders(decode_exact(payload)?),
            codes::GET_BLOCK_BODIES => EthMessage::GetBlockBodies(decode_exact(payload)?),
            codes::BLOCK_BODIES => EthMessage::BlockBodies(decode_exact(payload)?),
            codes::NEW_BLOCK => EthMessage::NewBlock(decode_exact(payload)?),
            codes::NEW_POOLED_TRANSACTION_HASHES => {
                EthMessage::NewPooledTransactionHashes(decode_exact(payload)?)
            }
            codes::GET_POOLED_TRANSACTIONS => {
                EthMessage::GetPooledTransactions(decode_exact(payload)?)
            }
            codes::POOLED_TRANSACTIONS => EthMessage::PooledTransactions(decode_exact(payload)?),
            other => {
                return Err(SyncError::DecodeError(format!("unknown message code {other:#04x}")))
            }
        };
        Ok(decoded)
    }
}

/// Decode `T` and require that the whole input was consumed.
pub fn decode_exact<T: Decodable>(mut buf: &[u8]) -> Result<T, SyncError> {
    let value = T::decode(&mut buf)?;
    if !buf.is_empty() {
        return Err(SyncError::DecodeError(format!("{} trailing bytes", buf.len())));
    }
    Ok(value)
}

/// Split the first RLP item (header included) off `buf`.
fn split_item(buf: &[u8]) -> alloy_rlp::Result<(&[u8], &[u8])> {
    let mut rest = buf;
    let header = Header::decode(&mut rest)?;
    let total = (buf.len() - rest.len()) + header.payload_length;
    if buf.len() < total {
        return Err(alloy_rlp::Error::InputTooShort);
    }
    Ok(buf.split_at(total))
}

fn nth_item(raw: &[u8], index: usize) -> alloy_rlp::Result<&[u8]> {
    let mut rest = raw;
    let header = Header::decode(&mut rest)?;
    if !header.list {
        return Err(alloy_rlp::Error::UnexpectedString);
    }
    if rest.len() < header.payload_length {
        return Err(alloy_rlp::Error::InputTooShort);
    }
    let mut payload = &rest[..header.payload_length];
    for _ in 0..index {
        if payload.is_empty() {
            return Err(alloy_rlp::Error::InputTooShort);
        }
        payload = split_item(payload)?.1;
    }
    if payload.is_empty() {
        return Err(alloy_rlp::Error::InputTooShort);
    }
    Ok(split_item(payload)?.0)
}

fn list_field<T: Decodable>(raw: &[u8], index: usize) -> alloy_rlp::Result<T> {
    let mut item = nth_item(raw, index)?;
    T::decode(&mut item)
}
