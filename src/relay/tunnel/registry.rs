//! Session registry (C3): tracks every connected agent and the UDP flows
//! opened against it.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::watch;

use super::protocol::ControlMessage;

/// Serializes writes onto an agent's control stream. Two producers share
/// this: replies to the agent's own requests, and fire-and-forget `proxy`
/// pushes triggered by public connections.
pub type ControlWriter = tokio::sync::Mutex<Box<dyn tokio::io::AsyncWrite + Send + Unpin>>;

/// One registered agent and everything the relay needs to route to it.
pub struct AgentSession {
    pub agent_id: String,
    pub key: String,
    pub target: String,
    pub protocol: String,
    pub public_port: u16,
    pub remote_ip: IpAddr,

    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,

    last_seen: Mutex<Instant>,

    writer: ControlWriter,

    /// Proxy ids this agent currently owes a connection for. Used to cancel
    /// outstanding rendezvous waits when the agent disconnects.
    pending_proxies: Mutex<HashSet<String>>,

    /// Broadcasts session closure to every task that outlives a single
    /// read/accept call on this agent: the public listener's accept loop,
    /// the control loop's blocked read, and the liveness supervisor. A
    /// `watch` receiver observes a close that happened before it ever
    /// polled, so subscribing late (e.g. right after eviction) still works.
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    closed: AtomicBool,
}

impl AgentSession {
    pub fn new(
        agent_id: String,
        key: String,
        target: String,
        protocol: String,
        public_port: u16,
        remote_ip: IpAddr,
        writer: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            agent_id,
            key,
            target,
            protocol,
            public_port,
            remote_ip,
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            last_seen: Mutex::new(Instant::now()),
            writer: tokio::sync::Mutex::new(writer),
            pending_proxies: Mutex::new(HashSet::new()),
            shutdown_tx,
            shutdown_rx,
            closed: AtomicBool::new(false),
        }
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_seen.lock().unwrap().elapsed()
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn track_pending_proxy(&self, proxy_id: String) {
        self.pending_proxies.lock().unwrap().insert(proxy_id);
    }

    pub fn untrack_pending_proxy(&self, proxy_id: &str) {
        self.pending_proxies.lock().unwrap().remove(proxy_id);
    }

    pub fn take_pending_proxies(&self) -> Vec<String> {
        std::mem::take(&mut self.pending_proxies.lock().unwrap())
            .into_iter()
            .collect()
    }

    /// Sends a control message over this agent's shared writer. Safe to call
    /// from multiple tasks concurrently.
    pub async fn send(&self, msg: &ControlMessage) -> Result<(), super::protocol::ControlCodecError> {
        let mut w = self.writer.lock().await;
        super::protocol::write_message(&mut *w, msg).await
    }

    /// Marks this session closed exactly once. Returns `true` the first time
    /// it's called, `false` on any subsequent call.
    pub fn close_once(&self) -> bool {
        let was_open = self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if was_open {
            let _ = self.shutdown_tx.send(true);
        }
        was_open
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// All currently connected agents, keyed by agent id.
#[derive(Default)]
pub struct Registry {
    agents: DashMap<String, std::sync::Arc<AgentSession>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    pub fn insert(&self, session: std::sync::Arc<AgentSession>) {
        self.agents.insert(session.agent_id.clone(), session);
    }

    pub fn get(&self, agent_id: &str) -> Option<std::sync::Arc<AgentSession>> {
        self.agents.get(agent_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, agent_id: &str) -> Option<std::sync::Arc<AgentSession>> {
        self.agents.remove(agent_id).map(|(_, v)| v)
    }

    /// Removes `agent_id` only if the entry currently there is still
    /// `session`. A re-register replaces the map entry before closing the
    /// old session; the old session's own teardown must not evict whatever
    /// (possibly newer) session has since taken its place.
    pub fn remove_current(&self, agent_id: &str, session: &std::sync::Arc<AgentSession>) {
        self.agents
            .remove_if(agent_id, |_, v| std::sync::Arc::ptr_eq(v, session));
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn iter(&self) -> Vec<std::sync::Arc<AgentSession>> {
        self.agents.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn session(id: &str) -> std::sync::Arc<AgentSession> {
        let (_a, b) = tokio::io::duplex(64);
        std::sync::Arc::new(AgentSession::new(
            id.to_string(),
            "key".into(),
            "127.0.0.1:22".into(),
            "tcp".into(),
            10000,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Box::new(tokio::io::split(b).1),
        ))
    }

    #[test]
    fn close_once_fires_exactly_once() {
        let s = session("a1");
        assert!(s.close_once());
        assert!(!s.close_once());
        assert!(s.is_closed());
    }

    #[test]
    fn registry_insert_get_remove() {
        let reg = Registry::new();
        reg.insert(session("a2"));
        assert_eq!(reg.len(), 1);
        assert!(reg.get("a2").is_some());
        assert!(reg.remove("a2").is_some());
        assert!(reg.is_empty());
    }

    #[test]
    fn remove_current_does_not_evict_a_replacement_session() {
        let reg = Registry::new();
        let old = session("a4");
        reg.insert(old.clone());

        // Simulate a re-register: a new session takes the same agent id
        // before the old session's own teardown runs.
        let new = session("a4");
        reg.insert(new.clone());

        reg.remove_current("a4", &old);
        assert!(reg.get("a4").is_some(), "replacement session must survive");

        reg.remove_current("a4", &new);
        assert!(reg.get("a4").is_none());
    }

    #[test]
    fn pending_proxies_round_trip() {
        let s = session("a3");
        s.track_pending_proxy("p1".into());
        s.track_pending_proxy("p2".into());
        let mut drained = s.take_pending_proxies();
        drained.sort();
        assert_eq!(drained, vec!["p1".to_string(), "p2".to_string()]);
        assert!(s.take_pending_proxies().is_empty());
    }
}
