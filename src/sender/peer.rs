//! Per-receiver liveness tracking.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

/// A receiver the sender is currently streaming to.
///
/// Each peer owns a small timer task. Any acknowledgment resets the timer;
/// if it ever expires, the peer's address is emitted on the eviction
/// channel and the task ends.
pub struct Peer {
    addr: SocketAddr,
    reset: mpsc::Sender<()>,
    stop: watch::Sender<bool>,
}

impl Peer {
    /// Start tracking liveness for `addr`.
    pub fn spawn(addr: SocketAddr, timeout: Duration, evictions: mpsc::Sender<SocketAddr>) -> Peer {
        let (reset_tx, mut reset_rx) = mpsc::channel::<()>(1);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(timeout) => {
                        let _ = evictions.send(addr).await;
                        break;
                    }
                    reset = reset_rx.recv() => {
                        if reset.is_none() {
                            break;
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        Peer {
            addr,
            reset: reset_tx,
            stop: stop_tx,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Restart the timer. A reset already in flight is enough, so this
    /// never blocks.
    pub fn reset(&self) {
        let _ = self.reset.try_send(());
    }

    /// End tracking without eviction.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}
