//! Bidirectional copier (C7): pairs a public connection with an agent's
//! reverse-dialed connection and shuttles bytes until either side closes.
//!
//! The two directions run as independent copy loops rather than a single
//! `tokio::io::copy_bidirectional` call, so a half-close in one direction
//! doesn't have to wait on traffic in the other, and each direction's byte
//! count is observable independently through the caller's atomics.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

use super::stream::BoxedConn;

const COPY_BUF_BYTES: usize = 32 * 1024;

/// Copies from `public` to `agent` and `agent` to `public` concurrently,
/// returning once both directions have finished.
///
/// Termination is symmetric: whichever direction finishes first (clean EOF,
/// read error, or write error) signals a shared stop watch, which cancels
/// the other direction's in-flight read immediately rather than waiting for
/// the remote peer to notice its writer half closed. No half-open TCP
/// propagation.
///
/// The counters are borrowed rather than owned: callers hold them inside a
/// longer-lived `AgentSession` and this call is always awaited directly,
/// never detached into its own task.
pub async fn pair(public: BoxedConn, agent: BoxedConn, bytes_up: &AtomicU64, bytes_down: &AtomicU64) {
    let (mut pub_r, mut pub_w) = tokio::io::split(public);
    let (mut agent_r, mut agent_w) = tokio::io::split(agent);

    let (stop_tx, stop_rx) = watch::channel(false);

    let up = async {
        let mut stop = stop_rx.clone();
        if let Err(e) = copy_loop(&mut pub_r, &mut agent_w, bytes_up, &mut stop).await {
            tracing::debug!(error = %e, "upstream copy ended");
        }
        let _ = stop_tx.send(true);
        let _ = agent_w.shutdown().await;
    };
    let down = async {
        let mut stop = stop_rx.clone();
        if let Err(e) = copy_loop(&mut agent_r, &mut pub_w, bytes_down, &mut stop).await {
            tracing::debug!(error = %e, "downstream copy ended");
        }
        let _ = stop_tx.send(true);
        let _ = pub_w.shutdown().await;
    };

    tokio::join!(up, down);
}

async fn copy_loop<R, W>(
    r: &mut R,
    w: &mut W,
    counter: &AtomicU64,
    stop: &mut watch::Receiver<bool>,
) -> std::io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_BYTES];
    loop {
        let n = tokio::select! {
            biased;
            _ = stop.changed() => return Ok(()),
            res = r.read(&mut buf) => res?,
        };
        if n == 0 {
            return Ok(());
        }
        w.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn bytes_flow_both_directions_and_counters_update() {
        let (public, mut public_peer) = duplex(1024);
        let (agent, mut agent_peer) = duplex(1024);

        let bytes_up = std::sync::Arc::new(AtomicU64::new(0));
        let bytes_down = std::sync::Arc::new(AtomicU64::new(0));

        let pair_task = {
            let bytes_up = bytes_up.clone();
            let bytes_down = bytes_down.clone();
            tokio::spawn(async move { pair(Box::new(public), Box::new(agent), &bytes_up, &bytes_down).await })
        };

        public_peer.write_all(b"hello-agent").await.unwrap();
        let mut buf = [0u8; 32];
        let n = agent_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello-agent");

        agent_peer.write_all(b"hello-public").await.unwrap();
        let n = public_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello-public");

        drop(public_peer);
        drop(agent_peer);
        pair_task.await.unwrap();

        assert_eq!(bytes_up.load(Ordering::Relaxed), "hello-agent".len() as u64);
        assert_eq!(bytes_down.load(Ordering::Relaxed), "hello-public".len() as u64);
    }

    #[tokio::test]
    async fn one_side_closing_unblocks_the_other_direction() {
        // agent_peer never writes or closes; only public_peer hangs up.
        // pair() must still return promptly instead of waiting on agent_r.
        let (public, public_peer) = duplex(1024);
        let (agent, _agent_peer) = duplex(1024);

        let bytes_up = AtomicU64::new(0);
        let bytes_down = AtomicU64::new(0);

        drop(public_peer);

        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            pair(Box::new(public), Box::new(agent), &bytes_up, &bytes_down),
        )
        .await
        .expect("pair() should terminate once either direction closes");
    }
}
