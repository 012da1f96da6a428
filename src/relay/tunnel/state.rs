//! Shared state threaded through the control, public-listener, and UDP
//! relay tasks: the three registries named in the concurrency model plus
//! the port counter.

use std::sync::Arc;

use super::port_allocator::PortAllocator;
use super::registry::Registry;
use super::rendezvous::RendezvousTable;
use super::udp_relay::UdpRelay;

pub struct SharedState {
    pub registry: Registry,
    pub rendezvous: RendezvousTable,
    pub port_allocator: PortAllocator,
    pub udp_relay: Arc<UdpRelay>,
}

impl SharedState {
    pub fn new(udp_relay: Arc<UdpRelay>) -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(),
            rendezvous: RendezvousTable::new(),
            port_allocator: PortAllocator::new(),
            udp_relay,
        })
    }

    /// Count of currently registered agents, for the metrics surface (C13).
    pub fn active_agents(&self) -> usize {
        self.registry.len()
    }

    /// Process-wide metrics snapshot (C13). Cheap enough to call from a
    /// hot path without contending with registry mutations.
    pub fn metrics(&self) -> Metrics {
        Metrics {
            active_agents: self.active_agents(),
        }
    }

    /// Per-agent snapshot for the metrics surface (C13). Copies out
    /// immutable fields under the registry's lock rather than holding it
    /// while serialising, per the registry-iteration discipline.
    pub fn list_tunnels(&self) -> Vec<TunnelInfo> {
        self.registry
            .iter()
            .into_iter()
            .map(|s| TunnelInfo {
                client_id: s.agent_id.clone(),
                protocol: s.protocol.clone(),
                local_host: s.remote_ip.to_string(),
                public_port: s.public_port,
                bytes_up: s.bytes_up.load(std::sync::atomic::Ordering::Relaxed),
                bytes_down: s.bytes_down.load(std::sync::atomic::Ordering::Relaxed),
            })
            .collect()
    }
}

/// Process-wide counters exposed to the (out-of-scope) HTTP dashboard.
#[derive(Debug, Clone, Copy)]
pub struct Metrics {
    pub active_agents: usize,
}

/// Read-only per-agent view exposed to the (out-of-scope) HTTP dashboard.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub client_id: String,
    pub protocol: String,
    pub local_host: String,
    pub public_port: u16,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn metrics_and_list_tunnels_start_empty() {
        let udp_relay = UdpRelay::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let state = SharedState::new(udp_relay);

        assert_eq!(state.metrics().active_agents, 0);
        assert!(state.list_tunnels().is_empty());
    }
}
