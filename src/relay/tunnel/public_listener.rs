//! Public TCP listener (C6): one per TCP agent, bound to its allocated
//! port. Every accepted connection mints a proxy id, registers a rendezvous
//! slot, asks the agent to reverse-dial, and bridges the pair with C7.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use super::copier;
use super::ids::random_hex128;
use super::protocol::{kind, ControlMessage};
use super::registry::AgentSession;
use super::rendezvous::Outcome;
use super::stream::BoxedConn;
use crate::relay::net::normalize_bind_addr;
use crate::relay::tunnel::state::SharedState;

const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs until the bind fails, the accept loop errors out persistently, or
/// the owning agent session is closed.
pub async fn run(session: Arc<AgentSession>, state: Arc<SharedState>) {
    let bind_addr = normalize_bind_addr(&format!(":{}", session.public_port));
    let listener = match TcpListener::bind(bind_addr.as_ref()).await {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!(
                agent_id = %session.agent_id,
                public_port = session.public_port,
                error = %e,
                "public listener: bind failed, agent remains registered but unreachable"
            );
            return;
        }
    };

    tracing::info!(
        agent_id = %session.agent_id,
        public_port = session.public_port,
        "public listener: listening"
    );

    let mut shutdown = session.shutdown_receiver();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (tcp, _peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(agent_id = %session.agent_id, error = %e, "public listener: accept failed");
                        continue;
                    }
                };
                let session = session.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    handle_public_connection(tcp, session, state).await;
                });
            }
        }
    }

    tracing::debug!(agent_id = %session.agent_id, "public listener: stopped");
}

async fn handle_public_connection(tcp: tokio::net::TcpStream, session: Arc<AgentSession>, state: Arc<SharedState>) {
    let proxy_id = random_hex128();
    let rx = state.rendezvous.register(proxy_id.clone());
    session.track_pending_proxy(proxy_id.clone());

    let request = ControlMessage {
        kind: kind::PROXY.to_string(),
        key: Some(session.key.clone()),
        client_id: Some(session.agent_id.clone()),
        id: Some(proxy_id.clone()),
        ..Default::default()
    };
    if let Err(e) = session.send(&request).await {
        tracing::warn!(agent_id = %session.agent_id, proxy_id = %proxy_id, error = %e, "public listener: failed to send proxy request");
        session.untrack_pending_proxy(&proxy_id);
        state.rendezvous.remove(&proxy_id);
        return;
    }

    let outcome = tokio::time::timeout(RENDEZVOUS_TIMEOUT, rx).await;
    session.untrack_pending_proxy(&proxy_id);

    let agent_conn = match outcome {
        Ok(Ok(Outcome::Delivered(conn))) => conn,
        Ok(Ok(Outcome::Cancelled)) => {
            tracing::debug!(agent_id = %session.agent_id, proxy_id = %proxy_id, "public listener: rendezvous cancelled");
            return;
        }
        Ok(Err(_)) => {
            // Sender dropped without signalling; treat like cancellation.
            return;
        }
        Err(_) => {
            tracing::info!(agent_id = %session.agent_id, proxy_id = %proxy_id, "public listener: rendezvous timed out");
            state.rendezvous.remove(&proxy_id);
            return;
        }
    };

    let public_conn: BoxedConn = Box::new(tcp);
    copier::pair(public_conn, agent_conn, &session.bytes_up, &session.bytes_down).await;
}
