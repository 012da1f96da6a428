//! Control-channel wire format: length-delimited JSON over the TLS stream.
//!
//! Every control message shares one flat field set (mirroring the agent's
//! own wire struct) rather than a tagged enum per message kind, since
//! `type` is the only thing that varies message-to-message and several
//! fields (`key`, `client_id`, `id`) are reused across kinds.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are rejected outright, before the payload is read.
pub const MAX_FRAME_BYTES: u32 = 1 << 20; // 1 MiB

#[derive(Debug, Error)]
pub enum ControlCodecError {
    #[error("frame too large: {0} bytes")]
    TooLarge(u32),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub mod kind {
    pub const REGISTER: &str = "register";
    pub const REGISTERED: &str = "registered";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const PROXY: &str = "proxy";
    pub const PROXY_ERROR: &str = "proxy_error";
    pub const UDP_OPEN: &str = "udp_open";
    pub const UDP_CLOSE: &str = "udp_close";
    pub const UDP_IDLE: &str = "udp_idle";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ControlMessage {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Default::default()
        }
    }
}

/// Writes one length-delimited JSON frame. Callers are responsible for
/// serializing concurrent writers onto the same stream (the control writer
/// has two producers: replies to reads, and fire-and-forget `proxy` pushes).
pub async fn write_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    msg: &ControlMessage,
) -> Result<(), ControlCodecError> {
    let body = serde_json::to_vec(msg)?;
    let n: u32 = body.len().try_into().unwrap_or(u32::MAX);
    w.write_u32(n).await?;
    w.write_all(&body).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_message<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<ControlMessage, ControlCodecError> {
    let n = r.read_u32().await?;
    if n > MAX_FRAME_BYTES {
        return Err(ControlCodecError::TooLarge(n));
    }
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_message_roundtrips() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let mut msg = ControlMessage::new(kind::REGISTER);
        msg.protocol = Some("tcp".into());
        msg.target = Some("127.0.0.1:22".into());

        let sent = msg.clone();
        let w = tokio::spawn(async move { write_message(&mut a, &sent).await });
        let got = read_message(&mut b).await.unwrap();
        w.await.unwrap().unwrap();

        assert_eq!(got.kind, kind::REGISTER);
        assert_eq!(got.protocol.as_deref(), Some("tcp"));
        assert_eq!(got.target.as_deref(), Some("127.0.0.1:22"));
        assert!(got.key.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_reading_payload() {
        let (mut a, mut b) = tokio::io::duplex(128);

        tokio::spawn(async move {
            a.write_u32(MAX_FRAME_BYTES + 1).await.unwrap();
        });

        let err = read_message(&mut b).await.unwrap_err();
        match err {
            ControlCodecError::TooLarge(n) => assert!(n > MAX_FRAME_BYTES),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
