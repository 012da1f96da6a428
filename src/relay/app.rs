//! Process wiring (C11): binds the TLS control listener and the UDP relay
//! socket, wires up the shared registries, and runs until a shutdown
//! signal or the control listener dies.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::relay::tls;
use crate::relay::tunnel::control;
use crate::relay::tunnel::state::SharedState;
use crate::relay::tunnel::udp_relay::UdpRelay;

pub async fn run(port: u16) -> anyhow::Result<()> {
    let tunnel_port = port + 1;
    let tunnel_addr: SocketAddr = format!("0.0.0.0:{tunnel_port}").parse()?;

    let identity = tls::load_or_generate(&std::env::current_dir()?)
        .context("tls: failed to load or generate server identity")?;
    tracing::info!(fingerprint = %identity.fingerprint, "tls: identity ready");

    let server_config = tls::server_config(&identity)?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let tcp_listener = TcpListener::bind(tunnel_addr)
        .await
        .with_context(|| format!("control: failed to bind tunnel port {tunnel_addr}"))?;

    let udp_relay = UdpRelay::bind(tunnel_addr)
        .await
        .with_context(|| format!("udp relay: failed to bind tunnel port {tunnel_addr}"))?;

    let state = SharedState::new(udp_relay.clone());

    tracing::info!(control_port = port, tunnel_port, "tunnelrelay: starting");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    {
        let state = state.clone();
        let shutdown_rx = shutdown_rx.clone();
        tasks.spawn(async move {
            control::accept_loop(tcp_listener, acceptor, state, shutdown_rx).await;
            Ok(())
        });
    }

    tasks.spawn(async move {
        udp_relay.run_ingress().await;
        Ok(())
    });

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("tunnelrelay: shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(std::time::Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    tracing::info!("tunnelrelay: shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
