//! Control-frame codec for the ingress control stream.
//!
//! Wire layout:
//! ```text
//! | kind (1B) | payload_len (4B big-endian) | payload (UTF-8 JSON) |
//! ```
//! Payloads above 1 MiB are rejected on both encode and decode. The codec
//! reads exact byte counts and returns short-read errors verbatim; it never
//! buffers beyond the frame being decoded.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::Endpoint;

/// Maximum control-frame payload size.
pub const MAX_PAYLOAD: usize = 1 << 20;

pub const HEADER_SIZE: usize = 5;

/// Control-frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Hello = 0x01,
    HelloAck = 0x02,
    Keepalive = 0x03,
}

impl FrameKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::HelloAck),
            0x03 => Some(Self::Keepalive),
            _ => None,
        }
    }
}

/// One decoded control frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

/// Codec errors. `UnknownKind` and `PayloadTooLarge` leave the stream
/// position unusable; callers treat them as fatal to the session.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),
    #[error("frame payload too large: {0} bytes (max {MAX_PAYLOAD})")]
    PayloadTooLarge(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Encode into a binary buffer.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.clone());
        Ok(buf.freeze())
    }
}

/// Read one frame, suspending until the full frame has arrived.
pub async fn read_frame<R>(r: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    r.read_exact(&mut header).await?;

    let kind = FrameKind::from_u8(header[0]).ok_or(FrameError::UnknownKind(header[0]))?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(Frame::new(kind, payload))
}

/// Write one frame and flush it.
pub async fn write_frame<W>(w: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let data = frame.encode()?;
    w.write_all(&data).await?;
    w.flush().await?;
    Ok(())
}

/// HELLO payload: authentication token plus the full endpoint set, re-sent
/// on every reconnect.
#[derive(Debug, Serialize, Deserialize)]
pub struct Hello {
    pub token: String,
    pub endpoints: Vec<Endpoint>,
}

/// HELLO_ACK payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct HelloAck {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(kind: FrameKind, payload: &[u8]) -> Frame {
        let (mut client, mut server) = tokio::io::duplex(MAX_PAYLOAD + 64);
        let frame = Frame::new(kind, payload.to_vec());
        write_frame(&mut client, &frame).await.unwrap();
        read_frame(&mut server).await.unwrap()
    }

    #[tokio::test]
    async fn encodes_and_decodes_each_kind() {
        for (kind, payload) in [
            (FrameKind::Hello, br#"{"token":"t","endpoints":[]}"# as &[u8]),
            (FrameKind::HelloAck, br#"{"ok":true}"#),
            (FrameKind::Keepalive, br#"{}"#),
        ] {
            let decoded = round_trip(kind, payload).await;
            assert_eq!(decoded.kind, kind);
            assert_eq!(&decoded.payload[..], payload);
        }
    }

    #[tokio::test]
    async fn payload_of_exactly_one_mebibyte_is_accepted() {
        let payload = vec![b'x'; MAX_PAYLOAD];
        let decoded = round_trip(FrameKind::Keepalive, &payload).await;
        assert_eq!(decoded.payload.len(), MAX_PAYLOAD);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_on_encode() {
        let frame = Frame::new(FrameKind::Keepalive, vec![b'x'; MAX_PAYLOAD + 1]);
        assert!(matches!(
            frame.encode(),
            Err(FrameError::PayloadTooLarge(n)) if n == MAX_PAYLOAD + 1
        ));
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_on_decode() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut header = vec![FrameKind::Keepalive as u8];
        header.extend_from_slice(&((MAX_PAYLOAD as u32 + 1).to_be_bytes()));
        tokio::io::AsyncWriteExt::write_all(&mut client, &header)
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(FrameError::PayloadTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[0x7f, 0, 0, 0, 0])
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(FrameError::UnknownKind(0x7f))
        ));
    }

    #[tokio::test]
    async fn short_read_surfaces_io_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // Header promises 10 payload bytes but the writer hangs up early.
        let frame = Frame::new(FrameKind::Keepalive, vec![0u8; 10]);
        let bytes = frame.encode().unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, &bytes[..bytes.len() - 4])
            .await
            .unwrap();
        drop(client);
        assert!(matches!(read_frame(&mut server).await, Err(FrameError::Io(_))));
    }

    #[test]
    fn hello_payload_shape() {
        let hello = Hello {
            token: "t".into(),
            endpoints: vec![crate::config::Endpoint {
                hostname: "a.example".into(),
                local_port: 8080,
            }],
        };
        let json = serde_json::to_value(&hello).unwrap();
        assert_eq!(json["endpoints"][0]["hostname"], "a.example");
        assert_eq!(json["endpoints"][0]["local_port"], 8080);

        let ack: HelloAck = serde_json::from_str(r#"{"ok":false,"error":"bad token"}"#).unwrap();
        assert!(!ack.ok);
        assert_eq!(ack.error.as_deref(), Some("bad token"));
    }
}
