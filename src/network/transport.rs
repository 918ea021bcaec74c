use bytes::{Buf, BufMut, BytesMut};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::common::PeerAddress;
use crate::config::NetworkConfig;
use crate::error::{ChatError, FrameError};

use super::protocol::WireFrame;

const LENGTH_PREFIX: usize = 4;

pub type FramedStream = Framed<TcpStream, FrameCodec>;

/// 4-byte big-endian length prefix followed by a JSON-encoded [`WireFrame`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = WireFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total = LENGTH_PREFIX + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let body = src.split_to(length);
        let frame = serde_json::from_slice(&body)?;
        Ok(Some(frame))
    }
}

impl Encoder<WireFrame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: WireFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item)?;
        if body.len() > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }
        dst.reserve(LENGTH_PREFIX + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

/// Size of the frame body `frame` encodes to, excluding the length prefix.
pub fn encoded_len(frame: &WireFrame) -> Result<usize, FrameError> {
    Ok(serde_json::to_vec(frame)?.len())
}

pub fn frame_stream(stream: TcpStream, config: &NetworkConfig) -> FramedStream {
    if let Err(err) = stream.set_nodelay(true) {
        log::debug!("Failed to set TCP_NODELAY: {err}");
    }
    Framed::new(stream, FrameCodec::new(config.max_frame_size))
}

/// Opens a TCP stream, bounded by the configured connect timeout.
pub async fn dial(address: &PeerAddress, config: &NetworkConfig) -> Result<FramedStream, ChatError> {
    let connect = TcpStream::connect((address.host.as_str(), address.port));
    let stream = tokio::time::timeout(config.connect_timeout, connect)
        .await
        .map_err(|_| ChatError::ConnectTimeout(address.to_string()))?
        .map_err(|e| ChatError::ConnectionFailed(format!("TCP connect to {address} failed: {e}")))?;
    Ok(frame_stream(stream, config))
}
