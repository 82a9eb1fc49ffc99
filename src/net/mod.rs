//! Websocket connection framework
//!
//! Shared connection core for ingress and egress sockets: every connection
//! carries a close signal that fires at most once and an owner-supplied
//! removal callback invoked exactly once, whichever path (read/write
//! failure, explicit removal, racing double-close) requests shutdown first.

pub mod incoming;
pub mod outgoing;
pub mod puller;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

/// Opaque per-connection identifier used in logs and registries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn generate() -> Self {
        ConnectionId(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Invoked exactly once when the connection reaches Closed.
pub type RemovalCallback = Box<dyn FnOnce() + Send + 'static>;

/// One websocket connection with idempotent close semantics.
///
/// The close gate is a compare-and-swap latch: all paths that may request
/// shutdown go through [`WsConnection::close`], and only the first caller
/// fires the close signal and the removal callback.
pub struct WsConnection {
    id: ConnectionId,
    close_gate: AtomicBool,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    on_close: Mutex<Option<RemovalCallback>>,
}

impl WsConnection {
    pub fn new(id: ConnectionId, on_close: RemovalCallback) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            id,
            close_gate: AtomicBool::new(false),
            closed_tx,
            closed_rx,
            on_close: Mutex::new(Some(on_close)),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Transition to Closed. Safe to call from any number of paths; only
    /// the first call fires the signal and the removal callback.
    pub fn close(&self) {
        if self
            .close_gate
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.closed_tx.send(true);
            if let Some(callback) = self.on_close.lock().take() {
                callback();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close_gate.load(Ordering::SeqCst)
    }

    /// A receiver that resolves once the connection closes; clone per waiter.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counted_connection() -> (Arc<WsConnection>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let cb_count = Arc::clone(&count);
        let conn = Arc::new(WsConnection::new(
            ConnectionId::generate(),
            Box::new(move || {
                cb_count.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        (conn, count)
    }

    #[test]
    fn close_fires_callback_exactly_once() {
        let (conn, count) = counted_connection();
        assert!(!conn.is_closed());

        conn.close();
        conn.close();
        conn.close();

        assert!(conn.is_closed());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_closes_fire_callback_once() {
        let (conn, count) = counted_connection();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let conn = Arc::clone(&conn);
                std::thread::spawn(move || conn.close())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_signal_resolves_after_close() {
        let (conn, _count) = counted_connection();
        let mut signal = conn.closed_signal();
        conn.close();
        signal.changed().await.unwrap();
        assert!(*signal.borrow());
    }
}
