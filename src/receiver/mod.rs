//! Receive-side protocol state machine.
//!
//! A receiver binds the broadcast port, acknowledges every accepted
//! datagram before dispatching it, reorders out-of-order segments through a
//! cache keyed by pure header, and streams in-order payloads to a per-file
//! reconstructor task. Acknowledging first means the sender observes
//! progress even when local file I/O is slow.

mod reconstruct;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ReceiverConfig;
use crate::error::TransferError;
use crate::header::{Flag, Header};
use crate::net;
use crate::protocol;
use crate::segment::Segment;

/// What the main loop should do after a datagram was processed.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// The file currently being reconstructed.
struct OpenFile {
    path: PathBuf,
    payloads: mpsc::Sender<Bytes>,
    task: JoinHandle<Result<(), TransferError>>,
}

/// Receives one broadcast session: a sequence of files ended by EXIT.
pub struct FileReceiver {
    config: ReceiverConfig,
    socket: UdpSocket,
    sender_addr: Option<SocketAddr>,
    expected: Header,
    cache: HashMap<Header, Segment>,
    current: Option<OpenFile>,
}

impl FileReceiver {
    /// Bind the broadcast port and prepare the output directory.
    pub fn new(config: ReceiverConfig) -> Result<FileReceiver, TransferError> {
        config.validate()?;
        std::fs::create_dir_all(&config.output_dir)?;
        let socket = net::receiver_socket(config.broadcast_port)?;
        Ok(FileReceiver {
            config,
            socket,
            sender_addr: None,
            expected: Header::new(Flag::RED, 0),
            cache: HashMap::new(),
            current: None,
        })
    }

    /// The locally bound address, useful when the port was ephemeral.
    pub fn local_addr(&self) -> Result<SocketAddr, TransferError> {
        Ok(self.socket.local_addr()?)
    }

    /// Run until an EXIT segment arrives or the sender goes silent.
    pub async fn run(mut self) -> Result<(), TransferError> {
        info!(
            port = self.config.broadcast_port,
            out = %self.config.output_dir,
            "receiver listening"
        );
        let mut buf = vec![0u8; protocol::SEGMENT_SIZE + 64];
        loop {
            let received = timeout(
                self.config.unresponsive_timeout(),
                self.socket.recv_from(&mut buf),
            )
            .await;
            let (len, addr) = match received {
                Err(_) => {
                    warn!("sender is unresponsive or does not exist, exiting");
                    break;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "receive error");
                    continue;
                }
                Ok(Ok(pair)) => pair,
            };
            let wire = Bytes::copy_from_slice(&buf[..len]);
            if self.process(wire, addr).await? == Flow::Exit {
                info!("EXIT received, shutting down");
                break;
            }
        }
        self.close_current_file().await
    }

    /// Handle one datagram. Returns whether the session is over.
    async fn process(&mut self, wire: Bytes, from: SocketAddr) -> Result<Flow, TransferError> {
        let segment = match Segment::parse(wire) {
            Ok(segment) => segment,
            Err(e) => {
                warn!(addr = %from, error = %e, "dropping malformed datagram");
                return Ok(Flow::Continue);
            }
        };

        // The first datagram identifies the sender; replies go to its
        // listening port, not the port it broadcast from.
        let sender_addr = match self.sender_addr {
            Some(addr) => addr,
            None => {
                let mut addr = from;
                addr.set_port(self.config.sender_port);
                info!(sender = %addr, "new sender detected");
                self.sender_addr = Some(addr);
                addr
            }
        };
        if from.ip() != sender_addr.ip() {
            warn!(
                got = %from,
                expected = %sender_addr,
                "broadcast datagram from unknown host"
            );
        }

        if self.should_drop() {
            warn!(header = %segment.header, "pseudo packet drop");
            return Ok(Flow::Continue);
        }
        if segment.header.flag.color().is_none() {
            warn!(header = %segment.header, "dropping segment without a valid color");
            return Ok(Flow::Continue);
        }

        self.acknowledge(&segment, sender_addr).await;

        // FILE segments are file boundaries: handled immediately, never
        // cached, and `expected` only ever moves forward. Accepting a FILE
        // advances `expected` past its header, so every retransmit of it
        // lands here as stale.
        if segment.is_file() {
            if segment.header.compare(self.expected) == Ordering::Less {
                debug!(header = %segment.header, "stale FILE segment");
                return Ok(Flow::Continue);
            }
            if self.handle_file_segment(&segment).await? {
                self.expected = segment.header.next();
            }
            return Ok(Flow::Continue);
        }

        match segment.header.compare(self.expected) {
            Ordering::Equal => {
                let next = segment.header.next();
                if self.dispatch(segment).await? == Flow::Exit {
                    return Ok(Flow::Exit);
                }
                self.expected = next;
                // Drain everything contiguous from the cache.
                while let Some(cached) = self.cache.remove(&self.expected) {
                    let next = cached.header.next();
                    if self.dispatch(cached).await? == Flow::Exit {
                        return Ok(Flow::Exit);
                    }
                    self.expected = next;
                }
            }
            Ordering::Greater => {
                let key = segment.header.pure();
                self.cache.entry(key).or_insert(segment);
            }
            Ordering::Less => {
                // Duplicate of something already dispatched; the ACK above
                // is all the sender needs.
                debug!(header = %segment.header, "duplicate segment");
            }
        }
        Ok(Flow::Continue)
    }

    /// Echo the segment's flags with ACK added, zero payload.
    async fn acknowledge(&self, segment: &Segment, sender: SocketAddr) {
        let ack = Segment::new(
            segment.header.flag | Flag::ACK,
            segment.header.seq,
            Bytes::new(),
        );
        if let Err(e) = self.socket.send_to(&ack.serialize(), sender).await {
            warn!(header = %segment.header, error = %e, "failed to send ACK");
        }
    }

    /// Open the file named by a FILE payload. Returns whether a new file
    /// was created.
    ///
    /// Only FILE headers at or past `expected` get here; retransmits of an
    /// already-accepted FILE are stale by then and never reach this point.
    /// A FILE arriving while a file is still open is therefore a protocol
    /// violation, whatever name it carries.
    async fn handle_file_segment(&mut self, segment: &Segment) -> Result<bool, TransferError> {
        let name = String::from_utf8_lossy(&segment.payload);
        let base = match Path::new(name.as_ref()).file_name() {
            Some(base) => base.to_owned(),
            None => {
                warn!(payload = %name, "FILE segment without a usable file name");
                return Ok(false);
            }
        };
        let path = Path::new(&self.config.output_dir).join(base);
        match &self.current {
            None => {
                let file = tokio::fs::File::create(&path).await?;
                info!(path = %path.display(), "new file, spawning reconstructor");
                let (tx, rx) = mpsc::channel(64);
                let task = tokio::spawn(reconstruct::reconstruct(file, rx));
                self.current = Some(OpenFile {
                    path,
                    payloads: tx,
                    task,
                });
                Ok(true)
            }
            Some(open) => {
                warn!(
                    open = %open.path.display(),
                    requested = %path.display(),
                    "FILE received before the previous file was closed"
                );
                Ok(false)
            }
        }
    }

    /// Handle an in-order non-FILE segment.
    async fn dispatch(&mut self, segment: Segment) -> Result<Flow, TransferError> {
        debug!(%segment, "handle segment");
        if segment.is_exit() {
            self.close_current_file().await?;
            return Ok(Flow::Exit);
        }
        if segment.is_eof() {
            self.close_current_file().await?;
            return Ok(Flow::Continue);
        }
        let failed = match self.current.as_ref() {
            None => {
                warn!(header = %segment.header, "data segment but no file is open");
                false
            }
            Some(open) => open.payloads.send(segment.payload).await.is_err(),
        };
        if failed {
            // The reconstructor only stops early on a write error.
            return match self.current.take() {
                Some(open) => Err(Self::join_reconstructor(open).await),
                None => Err(TransferError::Protocol(
                    "file reconstructor stopped early".to_string(),
                )),
            };
        }
        Ok(Flow::Continue)
    }

    /// Send the close signal and wait for the reconstructor to finish.
    async fn close_current_file(&mut self) -> Result<(), TransferError> {
        if let Some(open) = self.current.take() {
            let _ = open.payloads.send(Bytes::new()).await;
            let path = open.path.clone();
            match open.task.await {
                Ok(result) => result?,
                Err(join) => {
                    return Err(TransferError::Protocol(format!(
                        "file reconstructor failed: {join}"
                    )))
                }
            }
            info!(path = %path.display(), "file complete");
        }
        Ok(())
    }

    async fn join_reconstructor(open: OpenFile) -> TransferError {
        match open.task.await {
            Ok(Err(e)) => e,
            Ok(Ok(())) => TransferError::Protocol("file reconstructor stopped early".to_string()),
            Err(join) => TransferError::Protocol(format!("file reconstructor failed: {join}")),
        }
    }

    fn should_drop(&self) -> bool {
        self.config.drop_chance > 0
            && rand::thread_rng().gen_range(0..100u8) < self.config.drop_chance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// A receiver wired to a fake sender socket; `process` is driven
    /// directly with synthetic datagrams.
    struct Harness {
        receiver: FileReceiver,
        sender: UdpSocket,
        sender_addr: SocketAddr,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender_addr = sender.local_addr().unwrap();
        let config = ReceiverConfig {
            broadcast_port: 0,
            sender_port: sender_addr.port(),
            drop_chance: 0,
            output_dir: dir.path().to_string_lossy().into_owned(),
            unresponsive_timeout_ms: 5000,
        };
        let receiver = FileReceiver::new(config).unwrap();
        Harness {
            receiver,
            sender,
            sender_addr,
            _dir: dir,
        }
    }

    fn data(flag: Flag, seq: u32, payload: &'static [u8]) -> Bytes {
        Segment::new(flag, seq, Bytes::from_static(payload)).serialize()
    }

    async fn read_ack(sender: &UdpSocket) -> Header {
        let mut buf = [0u8; 32];
        let (len, _) = sender.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, Header::SIZE, "ACKs carry no payload");
        Segment::parse(Bytes::copy_from_slice(&buf[..len]))
            .unwrap()
            .header
    }

    #[tokio::test]
    async fn reorders_and_reconstructs_in_header_order() {
        let mut h = harness().await;
        let from = h.sender_addr;

        let file = data(Flag::FILE | Flag::RED, 0, b"out.txt");
        assert_eq!(h.receiver.process(file, from).await.unwrap(), Flow::Continue);
        assert!(read_ack(&h.sender).await.flag.is_file());

        // Inject 3, 1, 2: 3 is cached, 1 dispatches, 2 drains the cache.
        h.receiver
            .process(data(Flag::RED, 3, b"ccc"), from)
            .await
            .unwrap();
        assert_eq!(h.receiver.cache.len(), 1);
        h.receiver
            .process(data(Flag::RED, 1, b"aaa"), from)
            .await
            .unwrap();
        h.receiver
            .process(data(Flag::RED, 2, b"bbb"), from)
            .await
            .unwrap();
        assert!(h.receiver.cache.is_empty());
        assert_eq!(h.receiver.expected, Header::new(Flag::RED, 4));

        h.receiver
            .process(data(Flag::EOF | Flag::RED, 4, b""), from)
            .await
            .unwrap();
        let flow = h
            .receiver
            .process(data(Flag::EXIT | Flag::RED, 5, b""), from)
            .await
            .unwrap();
        assert_eq!(flow, Flow::Exit);

        let out = std::fs::read(h._dir.path().join("out.txt")).unwrap();
        assert_eq!(out, b"aaabbbccc");
    }

    #[tokio::test]
    async fn duplicates_are_acked_but_not_reprocessed() {
        let mut h = harness().await;
        let from = h.sender_addr;

        h.receiver
            .process(data(Flag::FILE | Flag::RED, 0, b"dup.txt"), from)
            .await
            .unwrap();
        h.receiver
            .process(data(Flag::RED, 1, b"x"), from)
            .await
            .unwrap();
        let expected_before = h.receiver.expected;

        // The same segment again: state unchanged, ACK still emitted.
        h.receiver
            .process(data(Flag::RED, 1, b"x"), from)
            .await
            .unwrap();
        assert_eq!(h.receiver.expected, expected_before);
        assert!(h.receiver.cache.is_empty());

        for _ in 0..3 {
            let ack = read_ack(&h.sender).await;
            assert!(ack.flag.is_ack());
        }
    }

    #[tokio::test]
    async fn retransmitted_file_is_caught_by_the_stale_guard() {
        let mut h = harness().await;
        let from = h.sender_addr;

        h.receiver
            .process(data(Flag::FILE | Flag::RED, 0, b"one.txt"), from)
            .await
            .unwrap();
        let expected = h.receiver.expected;

        // Accepting the FILE advanced `expected` past its header, so the
        // retransmit compares stale: no new reconstructor, no rewind.
        h.receiver
            .process(data(Flag::FILE | Flag::RED, 0, b"one.txt"), from)
            .await
            .unwrap();
        assert_eq!(h.receiver.expected, expected);
        assert!(h.receiver.current.is_some());
        assert!(h.receiver.cache.is_empty());
    }

    #[tokio::test]
    async fn file_while_another_is_open_is_rejected() {
        let mut h = harness().await;
        let from = h.sender_addr;

        h.receiver
            .process(data(Flag::FILE | Flag::RED, 0, b"one.txt"), from)
            .await
            .unwrap();
        h.receiver
            .process(data(Flag::RED, 1, b"body"), from)
            .await
            .unwrap();

        // A FILE at the expected sequence while one.txt is still open:
        // logged and ignored, no second file, `expected` not advanced.
        h.receiver
            .process(data(Flag::FILE | Flag::RED, 2, b"two.txt"), from)
            .await
            .unwrap();
        assert_eq!(h.receiver.expected, Header::new(Flag::RED, 2));
        let open = h.receiver.current.as_ref().unwrap();
        assert!(open.path.ends_with("one.txt"));
        assert!(!h._dir.path().join("two.txt").exists());
    }

    #[tokio::test]
    async fn stale_file_after_close_does_not_rewind() {
        let mut h = harness().await;
        let from = h.sender_addr;

        h.receiver
            .process(data(Flag::FILE | Flag::RED, 0, b"quick.txt"), from)
            .await
            .unwrap();
        h.receiver
            .process(data(Flag::RED, 1, b"payload"), from)
            .await
            .unwrap();
        h.receiver
            .process(data(Flag::EOF | Flag::RED, 2, b""), from)
            .await
            .unwrap();
        assert!(h.receiver.current.is_none());
        let expected = h.receiver.expected;

        // A late FILE retransmit for the closed file must not truncate it
        // or move `expected` backwards.
        h.receiver
            .process(data(Flag::FILE | Flag::RED, 0, b"quick.txt"), from)
            .await
            .unwrap();
        assert_eq!(h.receiver.expected, expected);
        assert!(h.receiver.current.is_none());
        let out = std::fs::read(h._dir.path().join("quick.txt")).unwrap();
        assert_eq!(out, b"payload");
    }

    #[tokio::test]
    async fn crosses_the_color_flip_in_order() {
        let mut h = harness().await;
        let from = h.sender_addr;

        h.receiver
            .process(data(Flag::FILE | Flag::RED, u32::MAX - 3, b"wrap.bin"), from)
            .await
            .unwrap();
        assert_eq!(h.receiver.expected, Header::new(Flag::RED, u32::MAX - 2));

        h.receiver
            .process(data(Flag::RED, u32::MAX - 2, b"11"), from)
            .await
            .unwrap();
        h.receiver
            .process(data(Flag::RED, u32::MAX - 1, b"22"), from)
            .await
            .unwrap();
        h.receiver
            .process(data(Flag::RED, u32::MAX, b"33"), from)
            .await
            .unwrap();
        assert_eq!(h.receiver.expected, Header::new(Flag::BLUE, 0));

        h.receiver
            .process(data(Flag::BLUE, 0, b"44"), from)
            .await
            .unwrap();
        h.receiver
            .process(data(Flag::EOF | Flag::BLUE, 1, b""), from)
            .await
            .unwrap();
        let flow = h
            .receiver
            .process(data(Flag::EXIT | Flag::BLUE, 2, b""), from)
            .await
            .unwrap();
        assert_eq!(flow, Flow::Exit);

        let out = std::fs::read(h._dir.path().join("wrap.bin")).unwrap();
        assert_eq!(out, b"11223344");
    }

    #[tokio::test]
    async fn colorless_segments_are_dropped() {
        let mut h = harness().await;
        let from = h.sender_addr;

        h.receiver
            .process(data(Flag::EXIT, 0, b""), from)
            .await
            .unwrap();
        // Not acknowledged, not processed.
        assert_eq!(h.receiver.expected, Header::new(Flag::RED, 0));
        assert!(h.receiver.current.is_none());
    }

    #[tokio::test]
    async fn short_datagrams_are_dropped() {
        let mut h = harness().await;
        let from = h.sender_addr;
        let flow = h
            .receiver
            .process(Bytes::from_static(&[1, 2]), from)
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(h.receiver.expected, Header::new(Flag::RED, 0));
    }
}
