//! Wire framing between two nodes.
//!
//! A frame is `len: u32 BE | rlp(code) | payload`, `len` covering code and
//! payload. Before framing starts each side writes its 32 byte node id.

use crate::{error::SyncError, peer::PeerId};
use alloy_rlp::{Decodable, Encodable};
use bytes::{Bytes, BytesMut};
use std::{io, time::Duration};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec, LengthDelimitedCodecError};

/// Upper bound of a protocol message, as enforced by geth-derived peers.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// A framed protocol message, `size` being the payload length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMsg {
    pub code: u64,
    pub size: usize,
    pub payload: Bytes,
}

impl RawMsg {
    pub fn new(code: u64, payload: Bytes) -> Self {
        Self { code, size: payload.len(), payload }
    }
}

/// `LengthDelimitedCodec` does the framing; this layer only splits the
/// RLP message code off the front of each frame.
#[derive(Debug)]
pub struct WireCodec {
    length_codec: LengthDelimitedCodec,
    max_frame_size: usize,
}

impl WireCodec {
    pub fn new(max_frame_size: usize) -> Self {
        let length_codec = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(LEN_PREFIX)
            .max_frame_length(max_frame_size)
            .new_codec();
        Self { length_codec, max_frame_size }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

fn frame_too_big(e: &io::Error) -> bool {
    e.get_ref().is_some_and(|inner| inner.is::<LengthDelimitedCodecError>())
}

impl Decoder for WireCodec {
    type Item = RawMsg;
    type Error = SyncError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let announced = src.get(..LEN_PREFIX).map(|p| u32::from_be_bytes([p[0], p[1], p[2], p[3]]) as usize);
        let mut frame = match self.length_codec.decode(src) {
            Ok(Some(frame)) => frame.freeze(),
            Ok(None) => return Ok(None),
            Err(e) if frame_too_big(&e) => {
                return Err(SyncError::OversizeMessage { size: announced.unwrap_or_default(), max: self.max_frame_size })
            }
            Err(e) => return Err(e.into()),
        };

        let (code, consumed) = {
            let mut cursor: &[u8] = &frame;
            let code = u64::decode(&mut cursor)?;
            (code, frame.len() - cursor.len())
        };
        let payload = frame.split_off(consumed);
        Ok(Some(RawMsg::new(code, payload)))
    }
}

impl Encoder<RawMsg> for WireCodec {
    type Error = SyncError;

    fn encode(&mut self, item: RawMsg, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut frame = BytesMut::with_capacity(item.code.length() + item.payload.len());
        item.code.encode(&mut frame);
        frame.extend_from_slice(&item.payload);
        let (len, max) = (frame.len(), self.max_frame_size);
        self.length_codec.encode(frame.freeze(), dst).map_err(|e| {
            if frame_too_big(&e) {
                SyncError::OversizeMessage { size: len, max }
            } else {
                e.into()
            }
        })
    }
}

pub type WireFramed<S> = Framed<S, WireCodec>;

pub fn framed<S: AsyncRead + AsyncWrite>(stream: S, max_frame_size: usize) -> WireFramed<S> {
    Framed::new(stream, WireCodec::new(max_frame_size))
}

/// Transport hello: swap node ids before any framed traffic.
pub async fn exchange_node_ids<S>(stream: &mut S, local: &PeerId, timeout: Duration) -> Result<PeerId, SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        stream.write_all(local.as_bytes()).await?;
        stream.flush().await?;
        let mut remote = [0u8; 32];
        stream.read_exact(&mut remote).await?;
        Ok::<_, SyncError>(PeerId::new(remote))
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| SyncError::Timeout(timeout))?
}
