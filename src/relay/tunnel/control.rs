//! Control channel handler (C5): the TLS accept loop for the tunnel port,
//! agent registration, keepalive, control-message demultiplexing, and the
//! per-agent liveness supervisor (C9).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use super::ids::random_hex128;
use super::protocol::{kind, read_message, ControlMessage};
use super::registry::AgentSession;
use super::stream::BoxedConn;
use crate::relay::tunnel::public_listener;
use crate::relay::tunnel::state::SharedState;

const IDLE_CHECK_PERIOD: Duration = Duration::from_secs(20);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Accepts TLS connections on the tunnel port and dispatches each by its
/// first control frame: a fresh `register` starts a new agent session, a
/// `proxy` handshake hands the connection to the rendezvous table.
pub async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: Arc<SharedState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (tcp, remote_addr) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "control: accept failed");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    match acceptor.accept(tcp).await {
                        Ok(tls) => {
                            let conn: BoxedConn = Box::new(tls);
                            handle_connection(conn, remote_addr, state).await;
                        }
                        Err(e) => tracing::debug!(error = %e, "control: TLS handshake failed"),
                    }
                });
            }
        }
    }
}

async fn handle_connection(conn: BoxedConn, remote_addr: SocketAddr, state: Arc<SharedState>) {
    let (mut r, w) = tokio::io::split(conn);

    let first = match read_message(&mut r).await {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(error = %e, "control: failed to read first frame");
            return;
        }
    };

    match first.kind.as_str() {
        kind::REGISTER => handle_register(first, r, w, remote_addr, state).await,
        kind::PROXY => {
            let Some(id) = first.id else {
                tracing::warn!("control: proxy handoff missing id");
                return;
            };
            let conn = r.unsplit(w);
            if !state.rendezvous.deliver(&id, Box::new(conn)) {
                tracing::warn!(proxy_id = %id, "control: reverse-dial without matching rendezvous");
            }
        }
        other => {
            tracing::warn!(kind = %other, "control: unexpected handshake type on fresh connection");
        }
    }
}

async fn handle_register(
    msg: ControlMessage,
    mut r: tokio::io::ReadHalf<BoxedConn>,
    w: tokio::io::WriteHalf<BoxedConn>,
    remote_addr: SocketAddr,
    state: Arc<SharedState>,
) {
    let key = msg.key.unwrap_or_else(random_hex128);
    let agent_id = msg
        .client_id
        .unwrap_or_else(|| format!("client-{}", &key[..8.min(key.len())]));
    let protocol = msg
        .protocol
        .map(|p| p.to_lowercase())
        .unwrap_or_else(|| "tcp".to_string());
    let target = msg.target.unwrap_or_default();
    let public_port = state.port_allocator.allocate();

    let session = Arc::new(AgentSession::new(
        agent_id.clone(),
        key.clone(),
        target,
        protocol.clone(),
        public_port,
        remote_addr.ip(),
        Box::new(w),
    ));

    // A re-register for the same agent id replaces and closes the previous
    // session; the new registration always wins.
    if let Some(old) = state.registry.remove(&agent_id) {
        tracing::info!(agent_id = %agent_id, "control: replacing existing session on re-register");
        close_session(&old, &state);
    }
    state.registry.insert(session.clone());

    let reply = ControlMessage {
        kind: kind::REGISTERED.to_string(),
        key: Some(key.clone()),
        client_id: Some(agent_id.clone()),
        remote_port: Some(public_port),
        protocol: Some(protocol.clone()),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
        ..Default::default()
    };
    if let Err(e) = session.send(&reply).await {
        tracing::warn!(agent_id = %agent_id, error = %e, "control: failed to send registered reply");
        state.registry.remove_current(&agent_id, &session);
        return;
    }

    tracing::info!(
        agent_id = %agent_id,
        protocol = %protocol,
        public_port,
        remote_addr = %remote_addr,
        "control: agent registered"
    );

    tokio::spawn(liveness_supervisor(session.clone(), state.clone()));

    if protocol == "tcp" {
        let session = session.clone();
        let state = state.clone();
        tokio::spawn(async move {
            public_listener::run(session, state).await;
        });
    }

    control_loop(&mut r, session, state).await;
}

async fn control_loop(
    r: &mut tokio::io::ReadHalf<BoxedConn>,
    session: Arc<AgentSession>,
    state: Arc<SharedState>,
) {
    let mut shutdown = session.shutdown_receiver();
    loop {
        let msg = tokio::select! {
            // Woken by the liveness supervisor (idle eviction) or a
            // duplicate-register replacing this session elsewhere; without
            // this arm the blocked read here would never notice either.
            // A `watch` receiver (rather than `Notify`) is required: it
            // cannot miss a close that happens before this select is first
            // polled, since `changed()` compares against the version this
            // receiver last observed rather than requiring a waiter to
            // already be registered.
            _ = shutdown.changed() => {
                tracing::debug!(agent_id = %session.agent_id, "control: session closed externally");
                break;
            }
            read = read_message(r) => match read {
                Ok(m) => m,
                Err(e) => {
                    use std::io::ErrorKind;
                    let is_clean_eof = matches!(
                        &e,
                        super::protocol::ControlCodecError::Io(io_err)
                            if io_err.kind() == ErrorKind::UnexpectedEof
                    );
                    if is_clean_eof {
                        tracing::debug!(agent_id = %session.agent_id, "control: agent disconnected");
                    } else {
                        tracing::warn!(agent_id = %session.agent_id, error = %e, "control: decode error, closing session");
                    }
                    break;
                }
            },
        };
        session.touch();

        match msg.kind.as_str() {
            kind::PING => {
                let pong = ControlMessage::new(kind::PONG);
                if let Err(e) = session.send(&pong).await {
                    tracing::debug!(agent_id = %session.agent_id, error = %e, "control: failed to send pong");
                    break;
                }
            }
            kind::PROXY => {
                tracing::debug!(agent_id = %session.agent_id, "control: informational proxy message ignored");
            }
            kind::UDP_OPEN => {
                let (Some(id), Some(remote_addr)) = (msg.id, msg.remote_addr) else {
                    tracing::warn!(agent_id = %session.agent_id, "control: udp_open missing fields");
                    continue;
                };
                state.udp_relay.open(session.key.clone(), id, &remote_addr).await;
            }
            kind::UDP_CLOSE | kind::UDP_IDLE => {
                if let Some(id) = msg.id {
                    state.udp_relay.close_flow(&id);
                }
            }
            kind::PROXY_ERROR => {
                if let Some(id) = msg.id {
                    session.untrack_pending_proxy(&id);
                    state.rendezvous.cancel(&id);
                }
            }
            other => {
                tracing::debug!(agent_id = %session.agent_id, kind = %other, "control: unknown message type");
            }
        }
    }

    state.registry.remove_current(&session.agent_id, &session);
    close_session(&session, &state);
}

fn close_session(session: &Arc<AgentSession>, state: &Arc<SharedState>) {
    if !session.close_once() {
        return;
    }
    for id in session.take_pending_proxies() {
        state.rendezvous.cancel(&id);
    }
}

async fn liveness_supervisor(session: Arc<AgentSession>, state: Arc<SharedState>) {
    let mut shutdown = session.shutdown_receiver();
    let mut ticker = tokio::time::interval(IDLE_CHECK_PERIOD);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if session.is_closed() {
                    break;
                }
                if session.idle_for() >= IDLE_TIMEOUT {
                    tracing::info!(agent_id = %session.agent_id, "control: idle timeout, evicting session");
                    state.registry.remove_current(&session.agent_id, &session);
                    close_session(&session, &state);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_defaults_to_key_prefix() {
        let key = "0123456789abcdef0123456789abcdef".to_string();
        let agent_id = format!("client-{}", &key[..8.min(key.len())]);
        assert_eq!(agent_id, "client-01234567");
    }
}
