//! Periodic retransmission of a single segment.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tracing::{debug, warn};

use crate::segment::Segment;

/// Rebroadcasts one segment on a fixed period until stopped.
///
/// The first transmission happens immediately; every later tick is a
/// retransmission, meaning the segment has gone one full period without
/// being fully acknowledged.
pub struct TimeoutSender {
    socket: Arc<UdpSocket>,
    segment: Segment,
    period: Duration,
    stop: watch::Sender<bool>,
}

impl TimeoutSender {
    pub fn new(socket: Arc<UdpSocket>, segment: Segment, period: Duration) -> TimeoutSender {
        let (stop, _) = watch::channel(false);
        TimeoutSender {
            socket,
            segment,
            period,
            stop,
        }
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Spawn the periodic task.
    ///
    /// With `addr` of `None` the segment goes out on the connected
    /// broadcast socket; otherwise it is unicast to `addr`.
    pub fn start(&self, addr: Option<SocketAddr>) {
        let socket = Arc::clone(&self.socket);
        let wire = self.segment.serialize();
        let header = self.segment.header;
        let period = self.period;
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            // A stop issued before the task started is visible immediately
            // as the current value of the watch channel.
            if *stop.borrow() {
                return;
            }
            let mut ticker = interval_at(Instant::now(), period);
            let mut retransmit = false;
            loop {
                tokio::select! {
                    biased;
                    // changed() resolves once the value is updated (or the
                    // handle is dropped, which also stops the task).
                    changed = stop.changed() => {
                        match changed {
                            Ok(()) => {
                                if *stop.borrow() { break; }
                            }
                            Err(_) => break,
                        }
                    }
                    _ = ticker.tick() => {
                        let sent = match addr {
                            None => socket.send(&wire).await,
                            Some(addr) => socket.send_to(&wire, addr).await,
                        };
                        match sent {
                            Ok(_) if retransmit => warn!(%header, "timeout: retransmit segment"),
                            Ok(_) => debug!(%header, "transmit segment"),
                            Err(e) => warn!(%header, error = %e, "segment transmission failed"),
                        }
                        retransmit = true;
                    }
                }
            }
        });
    }

    /// Cancel the periodic task. Safe to call repeatedly, after the task
    /// has already stopped, or before it has started.
    pub fn stop(&self) {
        // send_replace stores the flag even while no task is subscribed.
        self.stop.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Flag;
    use bytes::Bytes;
    use tokio::time::timeout;

    async fn pair() -> (Arc<UdpSocket>, UdpSocket) {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.connect(target).await.unwrap();
        (Arc::new(sender), listener)
    }

    #[tokio::test]
    async fn first_transmission_is_immediate() {
        let (socket, listener) = pair().await;
        let segment = Segment::new(Flag::RED, 1, Bytes::from_static(b"tick"));
        let sender = TimeoutSender::new(socket, segment, Duration::from_secs(60));
        sender.start(None);

        let mut buf = [0u8; 64];
        let (len, _) = timeout(Duration::from_secs(1), listener.recv_from(&mut buf))
            .await
            .expect("no immediate transmission")
            .unwrap();
        let received = Segment::parse(Bytes::copy_from_slice(&buf[..len])).unwrap();
        assert_eq!(received.header.seq, 1);
        assert_eq!(&received.payload[..], b"tick");
        sender.stop();
    }

    #[tokio::test]
    async fn stop_halts_retransmission() {
        let (socket, listener) = pair().await;
        let segment = Segment::new(Flag::BLUE, 2, Bytes::new());
        let sender = TimeoutSender::new(socket, segment, Duration::from_millis(30));
        sender.start(None);

        // Swallow the immediate transmission, then stop.
        let mut buf = [0u8; 64];
        listener.recv_from(&mut buf).await.unwrap();
        sender.stop();
        sender.stop(); // idempotent

        tokio::time::sleep(Duration::from_millis(120)).await;
        // At most one tick can have raced the stop; afterwards, silence.
        let mut drained = 0;
        while timeout(Duration::from_millis(60), listener.recv_from(&mut buf))
            .await
            .is_ok()
        {
            drained += 1;
        }
        assert!(drained <= 1, "timer kept firing after stop");
    }

    #[tokio::test]
    async fn unicast_targets_the_given_address() {
        let (socket, listener) = pair().await;
        let other = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let other_addr = other.local_addr().unwrap();

        let segment = Segment::new(Flag::RED, 3, Bytes::new());
        let sender = TimeoutSender::new(socket, segment, Duration::from_secs(60));
        sender.start(Some(other_addr));

        let mut buf = [0u8; 64];
        timeout(Duration::from_secs(1), other.recv_from(&mut buf))
            .await
            .expect("no unicast transmission")
            .unwrap();
        // Nothing on the connected target.
        assert!(
            timeout(Duration::from_millis(60), listener.recv_from(&mut buf))
                .await
                .is_err()
        );
        sender.stop();
    }
}
