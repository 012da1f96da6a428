//! UDP relay wire format: a single binary frame layout shared by every
//! message type.
//!
//! ```text
//! u8  type
//! u16 key_len   | key bytes
//! [u16 id_len   | id bytes]   ; present unless type == Handshake
//! payload...                   ; remainder of packet
//! ```
//!
//! All integers are big-endian. Parsing tolerates truncated packets by
//! returning `None` rather than erroring; the caller just drops them.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpFrameKind {
    Handshake = 1,
    Data = 2,
    Close = 3,
    Ping = 4,
    Pong = 5,
}

impl UdpFrameKind {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Handshake),
            2 => Some(Self::Data),
            3 => Some(Self::Close),
            4 => Some(Self::Ping),
            5 => Some(Self::Pong),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UdpFrame {
    pub kind: UdpFrameKind,
    pub key: String,
    pub id: Option<String>,
    pub payload: Vec<u8>,
}

/// Encodes a frame onto a fresh buffer ready to hand to `send_to`.
pub fn encode(kind: UdpFrameKind, key: &str, id: Option<&str>, payload: &[u8]) -> Vec<u8> {
    let key_bytes = key.as_bytes();
    let id_bytes = id.map(str::as_bytes);

    let mut total = 1 + 2 + key_bytes.len();
    if kind != UdpFrameKind::Handshake {
        total += 2 + id_bytes.map_or(0, <[u8]>::len);
    }
    total += payload.len();

    let mut buf = Vec::with_capacity(total);
    buf.push(kind as u8);
    buf.extend_from_slice(&(key_bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(key_bytes);
    if kind != UdpFrameKind::Handshake {
        let id_bytes = id_bytes.unwrap_or(&[]);
        buf.extend_from_slice(&(id_bytes.len() as u16).to_be_bytes());
        buf.extend_from_slice(id_bytes);
    }
    buf.extend_from_slice(payload);
    buf
}

/// Parses a received datagram. Returns `None` on any malformed or truncated
/// input instead of erroring, per the frame codec's tolerate-and-drop policy.
pub fn decode(packet: &[u8]) -> Option<UdpFrame> {
    if packet.is_empty() {
        return None;
    }
    let kind = UdpFrameKind::from_u8(packet[0])?;

    let (key, mut off) = read_field(packet, 1)?;
    let key = String::from_utf8(key).ok()?;

    let id = if kind == UdpFrameKind::Handshake {
        None
    } else {
        let (id_bytes, next) = read_field(packet, off)?;
        off = next;
        Some(String::from_utf8(id_bytes).ok()?)
    };

    let payload = packet[off..].to_vec();
    Some(UdpFrame {
        kind,
        key,
        id,
        payload,
    })
}

fn read_field(packet: &[u8], offset: usize) -> Option<(Vec<u8>, usize)> {
    if offset + 2 > packet.len() {
        return None;
    }
    let len = u16::from_be_bytes([packet[offset], packet[offset + 1]]) as usize;
    let start = offset + 2;
    if start + len > packet.len() {
        return None;
    }
    Some((packet[start..start + len].to_vec(), start + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_has_no_id_field() {
        let buf = encode(UdpFrameKind::Handshake, "abc123", None, b"");
        let frame = decode(&buf).unwrap();
        assert_eq!(frame.kind, UdpFrameKind::Handshake);
        assert_eq!(frame.key, "abc123");
        assert!(frame.id.is_none());
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn data_frame_roundtrips_with_id_and_payload() {
        let buf = encode(UdpFrameKind::Data, "key1", Some("sess-1"), b"hello");
        let frame = decode(&buf).unwrap();
        assert_eq!(frame.kind, UdpFrameKind::Data);
        assert_eq!(frame.key, "key1");
        assert_eq!(frame.id.as_deref(), Some("sess-1"));
        assert_eq!(frame.payload, b"hello");
    }

    #[test]
    fn truncated_packets_are_dropped_not_errored() {
        assert!(decode(&[]).is_none());
        assert!(decode(&[UdpFrameKind::Data as u8]).is_none());
        // key_len claims 10 bytes but only 2 are present.
        let mut buf = vec![UdpFrameKind::Ping as u8];
        buf.extend_from_slice(&10u16.to_be_bytes());
        buf.extend_from_slice(b"ab");
        assert!(decode(&buf).is_none());
    }

    #[test]
    fn unknown_type_byte_is_dropped() {
        assert!(decode(&[0xFF, 0, 0]).is_none());
    }
}
