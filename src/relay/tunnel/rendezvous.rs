//! Rendezvous table (C4): pairs one public-client connection with one
//! reverse-dialed agent connection by a shared proxy id.
//!
//! Each slot is a one-shot, single-producer-single-consumer channel of
//! capacity 1. The entry is removed from the table before the value is
//! surfaced to the waiter, so a late deliver/cancel sees "not present"
//! rather than racing a stale slot.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use super::stream::BoxedConn;

/// Terminal outcome of a rendezvous wait.
pub enum Outcome {
    Delivered(BoxedConn),
    Cancelled,
}

pub struct RendezvousTable {
    slots: Mutex<HashMap<String, oneshot::Sender<Outcome>>>,
}

impl Default for RendezvousTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RendezvousTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts a fresh one-shot slot for `proxy_id` and returns the receiving
    /// half. Overwrites any stale entry with the same id (should not happen
    /// in practice since ids are random).
    pub fn register(&self, proxy_id: String) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().unwrap().insert(proxy_id, tx);
        rx
    }

    /// Delivers the reverse-dialed connection. Returns `false` if no slot
    /// (or an already-consumed one) was found.
    pub fn deliver(&self, proxy_id: &str, conn: BoxedConn) -> bool {
        let tx = self.slots.lock().unwrap().remove(proxy_id);
        match tx {
            Some(tx) => tx.send(Outcome::Delivered(conn)).is_ok(),
            None => false,
        }
    }

    /// Cancels a pending slot, e.g. on `proxy_error` from the agent. Never
    /// blocks; a missing slot is a no-op.
    pub fn cancel(&self, proxy_id: &str) {
        if let Some(tx) = self.slots.lock().unwrap().remove(proxy_id) {
            let _ = tx.send(Outcome::Cancelled);
        }
    }

    /// Removes the slot without signalling anyone; used when a waiter gives
    /// up (timeout) and wants to evict its own entry.
    pub fn remove(&self, proxy_id: &str) {
        self.slots.lock().unwrap().remove(proxy_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn boxed_pair() -> (BoxedConn, BoxedConn) {
        let (a, b) = duplex(64);
        (Box::new(a), Box::new(b))
    }

    #[tokio::test]
    async fn deliver_wakes_the_waiter() {
        let table = RendezvousTable::new();
        let rx = table.register("p1".into());

        let (conn, _peer) = boxed_pair();
        assert!(table.deliver("p1", conn));

        match rx.await.unwrap() {
            Outcome::Delivered(_) => {}
            Outcome::Cancelled => panic!("expected delivery"),
        }
    }

    #[tokio::test]
    async fn cancel_wakes_the_waiter_with_cancelled() {
        let table = RendezvousTable::new();
        let rx = table.register("p2".into());
        table.cancel("p2");

        match rx.await.unwrap() {
            Outcome::Cancelled => {}
            Outcome::Delivered(_) => panic!("expected cancellation"),
        }
    }

    #[tokio::test]
    async fn deliver_and_cancel_are_mutually_exclusive() {
        let table = RendezvousTable::new();
        let _rx = table.register("p3".into());

        let (conn, _peer) = boxed_pair();
        assert!(table.deliver("p3", conn));

        // The slot is gone: a second deliver or a cancel is a no-op.
        let (conn2, _peer2) = boxed_pair();
        assert!(!table.deliver("p3", conn2));
        table.cancel("p3"); // must not panic
    }

    #[tokio::test]
    async fn unknown_id_deliver_returns_false() {
        let table = RendezvousTable::new();
        let (conn, _peer) = boxed_pair();
        assert!(!table.deliver("missing", conn));
    }
}
