//! UDP relay (C8): a single server-wide UDP socket that speaks the binary
//! frame format in `udp_protocol` to agents, and plain UDP to whatever
//! upstream a flow was opened against.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use socket2::SockRef;
use tokio::net::UdpSocket;

use super::dest_policy;
use super::udp_protocol::{decode, encode, UdpFrame, UdpFrameKind};

const RECV_BUF_BYTES: usize = 4 * 1024 * 1024;
const SEND_BUF_BYTES: usize = 4 * 1024 * 1024;
const MAX_DATAGRAM_BYTES: usize = 65535;

/// Picks an unspecified bind address matching `dest`'s address family, so
/// `connect(dest)` doesn't fail with an address-family mismatch.
fn upstream_bind_addr(dest: SocketAddr) -> &'static str {
    match dest {
        SocketAddr::V4(_) => "0.0.0.0:0",
        SocketAddr::V6(_) => "[::]:0",
    }
}

/// One open upstream relay: `agent_key`'s session `session_id` bridges to
/// `upstream`, whose replies are framed back to `agent_addr`.
struct UdpFlow {
    agent_key: String,
    upstream: Arc<UdpSocket>,
    agent_addr: Mutex<SocketAddr>,
    closed: AtomicBool,
}

impl UdpFlow {
    fn close_once(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Shared state for the UDP data plane: the server socket plus the
/// session_id -> UdpFlow table.
pub struct UdpRelay {
    socket: Arc<UdpSocket>,
    flows: Mutex<HashMap<String, Arc<UdpFlow>>>,
}

impl UdpRelay {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        let sock_ref = SockRef::from(&socket);
        if let Err(e) = sock_ref.set_recv_buffer_size(RECV_BUF_BYTES) {
            tracing::warn!(error = %e, "failed to set UDP recv buffer size");
        }
        if let Err(e) = sock_ref.set_send_buffer_size(SEND_BUF_BYTES) {
            tracing::warn!(error = %e, "failed to set UDP send buffer size");
        }

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            flows: Mutex::new(HashMap::new()),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Opens a flow on behalf of `agent_key`, dialing `remote_addr`. Rejects
    /// destinations the SSRF guard blocks. Spawns the upstream reader task.
    pub async fn open(self: &Arc<Self>, agent_key: String, session_id: String, remote_addr: &str) {
        let resolved = match tokio::net::lookup_host(remote_addr).await {
            Ok(mut it) => match it.next() {
                Some(a) => a,
                None => {
                    tracing::warn!(remote_addr, "udp_open: no address resolved");
                    return;
                }
            },
            Err(e) => {
                tracing::warn!(remote_addr, error = %e, "udp_open: resolve failed");
                return;
            }
        };

        if !dest_policy::is_allowed(resolved.ip()) {
            tracing::warn!(remote_addr, "udp_open: destination policy violation");
            return;
        }

        let upstream = match UdpSocket::bind(upstream_bind_addr(resolved)).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "udp_open: failed to bind upstream socket");
                return;
            }
        };
        if let Err(e) = upstream.connect(resolved).await {
            tracing::warn!(remote_addr, error = %e, "udp_open: failed to connect upstream socket");
            return;
        }
        let upstream = Arc::new(upstream);

        // Agent address is unknown until its first frame arrives for this
        // session; use an unspecified placeholder until then.
        let placeholder: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let flow = Arc::new(UdpFlow {
            agent_key: agent_key.clone(),
            upstream: upstream.clone(),
            agent_addr: Mutex::new(placeholder),
            closed: AtomicBool::new(false),
        });

        self.flows.lock().unwrap().insert(session_id.clone(), flow.clone());

        let relay = self.clone();
        let key = agent_key.clone();
        let sid = session_id.clone();
        tokio::spawn(async move {
            relay.run_upstream_reader(sid, key, flow, upstream).await;
        });
    }

    async fn run_upstream_reader(
        self: Arc<Self>,
        session_id: String,
        agent_key: String,
        flow: Arc<UdpFlow>,
        upstream: Arc<UdpSocket>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        loop {
            let n = match upstream.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(session_id, error = %e, "udp flow: upstream read error");
                    break;
                }
            };

            let agent_addr = *flow.agent_addr.lock().unwrap();
            if agent_addr.ip().is_unspecified() {
                // Never heard from the agent on this session; nowhere to send.
                continue;
            }

            let frame = encode(UdpFrameKind::Data, &agent_key, Some(&session_id), &buf[..n]);
            if let Err(e) = self.socket.send_to(&frame, agent_addr).await {
                tracing::debug!(session_id, error = %e, "udp flow: failed to send frame to agent");
            }
        }
        self.close_flow(&session_id);
    }

    /// Closes and removes a flow if present. Idempotent.
    pub fn close_flow(&self, session_id: &str) {
        let flow = self.flows.lock().unwrap().remove(session_id);
        if let Some(flow) = flow {
            flow.close_once();
        }
    }

    /// Runs the server-wide ingress loop: reads datagrams from agents and
    /// dispatches by frame type. Never returns under normal operation.
    pub async fn run_ingress(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        loop {
            let (n, src) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "udp relay: recv error");
                    continue;
                }
            };
            let Some(frame) = decode(&buf[..n]) else {
                continue;
            };
            self.handle_frame(frame, src).await;
        }
    }

    async fn handle_frame(&self, frame: UdpFrame, src: SocketAddr) {
        match frame.kind {
            UdpFrameKind::Handshake => {
                let reply = encode(UdpFrameKind::Handshake, &frame.key, None, &[]);
                let _ = self.socket.send_to(&reply, src).await;
            }
            UdpFrameKind::Data => {
                let Some(session_id) = frame.id else { return };
                let flow = self.flows.lock().unwrap().get(&session_id).cloned();
                let Some(flow) = flow else { return };
                if flow.agent_key != frame.key {
                    return;
                }
                *flow.agent_addr.lock().unwrap() = src;
                if let Err(e) = flow.upstream.send(&frame.payload).await {
                    tracing::debug!(session_id, error = %e, "udp flow: upstream write failed");
                    self.close_flow(&session_id);
                }
            }
            UdpFrameKind::Close => {
                if let Some(session_id) = frame.id {
                    self.close_flow(&session_id);
                }
            }
            UdpFrameKind::Ping => {
                let reply = encode(UdpFrameKind::Pong, &frame.key, frame.id.as_deref(), &frame.payload);
                let _ = self.socket.send_to(&reply, src).await;
            }
            UdpFrameKind::Pong => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_is_echoed_back() {
        let relay = UdpRelay::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let relay_addr = relay.local_addr().unwrap();

        let task = tokio::spawn({
            let relay = relay.clone();
            async move {
                let mut buf = vec![0u8; 128];
                let (n, src) = relay.socket.recv_from(&mut buf).await.unwrap();
                let frame = decode(&buf[..n]).unwrap();
                relay.handle_frame(frame, src).await;
            }
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let hs = encode(UdpFrameKind::Handshake, "abc", None, &[]);
        client.send_to(&hs, relay_addr).await.unwrap();

        let mut buf = vec![0u8; 128];
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        let reply = decode(&buf[..n]).unwrap();
        assert_eq!(reply.kind, UdpFrameKind::Handshake);
        assert_eq!(reply.key, "abc");

        task.await.unwrap();
    }

    #[tokio::test]
    async fn udp_open_rejects_loopback_destination() {
        let relay = UdpRelay::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        relay.open("key1".into(), "sess1".into(), "127.0.0.1:53").await;
        assert!(relay.flows.lock().unwrap().is_empty());
    }

    #[test]
    fn upstream_bind_addr_matches_destination_family() {
        assert_eq!(upstream_bind_addr("93.184.216.34:53".parse().unwrap()), "0.0.0.0:0");
        assert_eq!(upstream_bind_addr("[2606:2800:220:1:248:1893:25c8:1946]:53".parse().unwrap()), "[::]:0");
    }
}
