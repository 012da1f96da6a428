pub mod control;
pub mod copier;
pub mod dest_policy;
pub mod ids;
pub mod port_allocator;
pub mod protocol;
pub mod public_listener;
pub mod registry;
pub mod rendezvous;
pub mod state;
pub mod stream;
pub mod udp_protocol;
pub mod udp_relay;
