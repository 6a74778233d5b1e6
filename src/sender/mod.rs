//! Broadcast-side protocol state machine.
//!
//! For every file the sender runs two phases. Setup advertises the file
//! name on a retransmit timer and registers every receiver that
//! acknowledges it before the setup timer fires. Broadcast then streams
//! the file in payload-sized segments through the window, one batch at a
//! time, while a dedicated task aggregates acknowledgments and tracks
//! receiver liveness. A segment leaves the window once every registered
//! receiver has acknowledged its header; receivers that stay silent for
//! the unresponsive timeout are evicted instead.

pub mod peer;
pub mod timeout;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::SenderConfig;
use crate::error::TransferError;
use crate::header::{Flag, Header};
use crate::net;
use crate::progress::TransferProgress;
use crate::segment::Segment;
use crate::window::{Window, WindowSlot};

use peer::Peer;
use timeout::TimeoutSender;

/// An acknowledgment header paired with who sent it.
#[derive(Debug, Clone, Copy)]
struct AckResponse {
    addr: SocketAddr,
    header: Header,
}

/// A window slot: a segment on a retransmit timer plus the set of
/// receivers that have acknowledged it so far.
pub struct TimedSegment {
    timer: TimeoutSender,
    acked: Mutex<HashSet<SocketAddr>>,
    removed: watch::Sender<bool>,
}

impl TimedSegment {
    fn new(socket: Arc<UdpSocket>, segment: Segment, period: Duration) -> Arc<TimedSegment> {
        let (removed, _) = watch::channel(false);
        Arc::new(TimedSegment {
            timer: TimeoutSender::new(socket, segment, period),
            acked: Mutex::new(HashSet::new()),
            removed,
        })
    }

    fn start(&self) {
        self.timer.start(None);
    }

    /// Record an acknowledgment from `addr`.
    fn ack(&self, addr: SocketAddr) {
        let mut acked = match self.acked.lock() {
            Ok(acked) => acked,
            Err(poisoned) => poisoned.into_inner(),
        };
        acked.insert(addr);
    }

    /// Whether every address in `peers` has acknowledged this segment.
    fn acked_by_all<'a>(&self, mut peers: impl Iterator<Item = &'a SocketAddr>) -> bool {
        let acked = match self.acked.lock() {
            Ok(acked) => acked,
            Err(poisoned) => poisoned.into_inner(),
        };
        peers.all(|addr| acked.contains(addr))
    }

    fn is_removed(&self) -> bool {
        *self.removed.borrow()
    }

    /// Stop the retransmit timer and signal the window to evict the slot.
    fn mark_removable(&self) {
        self.timer.stop();
        self.removed.send_replace(true);
    }
}

impl WindowSlot for TimedSegment {
    fn header(&self) -> Header {
        self.timer.segment().header.pure()
    }

    fn removed(&self) -> watch::Receiver<bool> {
        self.removed.subscribe()
    }
}

/// Interrupts a running [`FileSender`] before its next file.
pub struct DoneHandle {
    tx: watch::Sender<bool>,
}

impl DoneHandle {
    /// Ask the sender to stop after the file currently in flight.
    pub fn signal(&self) {
        self.tx.send_replace(true);
    }
}

/// Broadcasts a sequence of files to every receiver that joins setup.
pub struct FileSender {
    config: SenderConfig,
    broadcast: Arc<UdpSocket>,
    window: Window<TimedSegment>,
    responses: Option<mpsc::Receiver<AckResponse>>,
    reader: JoinHandle<()>,
    done: watch::Receiver<bool>,
    head: Header,
}

impl FileSender {
    /// Open the broadcast and listening sockets and start aggregating
    /// acknowledgment replies.
    pub async fn new(config: SenderConfig) -> Result<(FileSender, DoneHandle), TransferError> {
        config.validate()?;
        let ip = config.broadcast_addr.parse().map_err(|_| {
            TransferError::Protocol(format!(
                "invalid broadcast address: {}",
                config.broadcast_addr
            ))
        })?;
        let broadcast_to = SocketAddr::new(ip, config.broadcast_port);
        let broadcast = Arc::new(net::broadcast_socket(broadcast_to)?);
        let listen = net::listen_socket(config.listen_port).await?;

        let (response_tx, response_rx) = mpsc::channel(128);
        let reader = tokio::spawn(read_responses(listen, response_tx, config.drop_chance));
        let (done_tx, done_rx) = watch::channel(false);

        let window = Window::new(config.window_size);
        Ok((
            FileSender {
                config,
                broadcast,
                window,
                responses: Some(response_rx),
                reader,
                done: done_rx,
                head: Header::new(Flag::RED, 0),
            },
            DoneHandle { tx: done_tx },
        ))
    }

    /// Override the starting header. Mainly useful for exercising the
    /// red/blue sequence wrap.
    pub fn start_at(&mut self, header: Header) {
        self.head = header.pure();
    }

    /// Broadcast `files` in order, then announce EXIT.
    pub async fn run(mut self, files: Vec<PathBuf>) -> Result<(), TransferError> {
        let total = files.len();
        for (index, path) in files.iter().enumerate() {
            if *self.done.borrow() {
                info!("stop requested, skipping remaining files");
                break;
            }
            let last = index + 1 == total;
            match self.broadcast_one(path, last).await {
                Ok(()) => {}
                Err(TransferError::Cancelled) => break,
                Err(e) => {
                    self.reader.abort();
                    return Err(e);
                }
            }
        }
        self.exit_broadcast().await;
        self.reader.abort();
        Ok(())
    }

    async fn broadcast_one(&mut self, path: &Path, last: bool) -> Result<(), TransferError> {
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TransferError::FileNotFound(path.to_path_buf())
            } else {
                TransferError::Io(e)
            }
        })?;
        let receivers = self.setup(path).await?;
        self.stream_file(file, path, receivers, last).await
    }

    /// Advertise the file until at least one receiver has joined and the
    /// setup timer fires.
    async fn setup(&mut self, path: &Path) -> Result<HashSet<SocketAddr>, TransferError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(file = %name, "setup: advertising file");

        let advertise = TimeoutSender::new(
            Arc::clone(&self.broadcast),
            Segment::with_header(self.head.with(Flag::FILE), Bytes::from(name.into_bytes())),
            self.config.segment_timeout(),
        );
        advertise.start(None);

        let setup_timeout = self.config.setup_timeout();
        let responses = match self.responses.as_mut() {
            Some(responses) => responses,
            None => {
                advertise.stop();
                return Err(TransferError::Protocol(
                    "acknowledgment channel unavailable".to_string(),
                ));
            }
        };

        let mut receivers = HashSet::new();
        let timer = sleep(setup_timeout);
        tokio::pin!(timer);
        let result = loop {
            tokio::select! {
                response = responses.recv() => {
                    let Some(response) = response else {
                        break Err(TransferError::Protocol(
                            "acknowledgment channel closed".to_string(),
                        ));
                    };
                    // Only FILE acknowledgments register a receiver.
                    if response.header.flag.is_file() && response.header.flag.is_ack() {
                        if receivers.insert(response.addr) {
                            info!(addr = %response.addr, "setup: new receiver accepted");
                        }
                    }
                }
                _ = timer.as_mut() => {
                    if receivers.is_empty() {
                        info!("setup: no receivers yet, still advertising");
                        timer.as_mut().reset(Instant::now() + setup_timeout);
                    } else {
                        info!(count = receivers.len(), "setup: finished");
                        break Ok(receivers);
                    }
                }
                _ = wait_done(&mut self.done) => {
                    break Err(TransferError::Cancelled);
                }
            }
        };
        advertise.stop();
        self.head = self.head.next();
        result
    }

    /// Stream the opened file through the window while the ACK handler
    /// drains it.
    async fn stream_file(
        &mut self,
        file: tokio::fs::File,
        path: &Path,
        receivers: HashSet<SocketAddr>,
        last: bool,
    ) -> Result<(), TransferError> {
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let progress = TransferProgress::new(&name, size, self.config.progress_bar);
        info!(
            file = %path.display(),
            bytes = size,
            receivers = receivers.len(),
            "broadcast: start streaming"
        );

        let (evict_tx, evict_rx) = mpsc::channel(16);
        let peers: HashMap<SocketAddr, Peer> = receivers
            .into_iter()
            .map(|addr| {
                (
                    addr,
                    Peer::spawn(addr, self.config.unresponsive_timeout(), evict_tx.clone()),
                )
            })
            .collect();
        drop(evict_tx);

        let (stop_tx, stop_rx) = watch::channel(false);
        let responses = match self.responses.take() {
            Some(responses) => responses,
            None => {
                return Err(TransferError::Protocol(
                    "acknowledgment channel unavailable".to_string(),
                ))
            }
        };
        let mut ack_task = tokio::spawn(ack_loop(
            responses,
            self.window.clone(),
            peers,
            evict_rx,
            stop_rx,
        ));

        let fed = tokio::select! {
            fed = self.feed_window(file, &progress, last) => fed,
            joined = &mut ack_task => {
                // The handler only returns early on a fatal condition.
                let (responses, ack_result) = joined.map_err(|e| {
                    TransferError::Protocol(format!("ack handler failed: {e}"))
                })?;
                self.responses = Some(responses);
                ack_result?;
                return Err(TransferError::Protocol(
                    "ack handler stopped unexpectedly".to_string(),
                ));
            }
        };

        // Everything is in the window; let the handler drain it.
        stop_tx.send_replace(true);
        let (responses, ack_result) = ack_task
            .await
            .map_err(|e| TransferError::Protocol(format!("ack handler failed: {e}")))?;
        self.responses = Some(responses);
        progress.finish();
        fed?;
        ack_result?;
        info!(file = %path.display(), "broadcast: file fully acknowledged");
        Ok(())
    }

    /// Chunk the file into timed segments and load them window batch by
    /// window batch. Ends with an EOF segment, and an EXIT segment after
    /// the final file.
    async fn feed_window(
        &mut self,
        mut file: tokio::fs::File,
        progress: &TransferProgress,
        last: bool,
    ) -> Result<(), TransferError> {
        let mut batch = Vec::with_capacity(self.config.window_size);
        while let Some(payload) = next_payload(&mut file, self.config.payload_size).await? {
            let len = payload.len() as u64;
            self.push_segment(&mut batch, Segment::with_header(self.head, payload))
                .await?;
            progress.update(len);
        }
        self.push_segment(
            &mut batch,
            Segment::with_header(self.head.with(Flag::EOF), Bytes::new()),
        )
        .await?;
        if last {
            self.push_segment(
                &mut batch,
                Segment::with_header(self.head.with(Flag::EXIT), Bytes::new()),
            )
            .await?;
        }
        self.flush_batch(&mut batch).await
    }

    async fn push_segment(
        &mut self,
        batch: &mut Vec<Arc<TimedSegment>>,
        segment: Segment,
    ) -> Result<(), TransferError> {
        debug!(%segment, "broadcast: queue segment");
        batch.push(TimedSegment::new(
            Arc::clone(&self.broadcast),
            segment,
            self.config.segment_timeout(),
        ));
        self.head = self.head.next();
        if batch.len() == self.config.window_size {
            self.flush_batch(batch).await?;
        }
        Ok(())
    }

    /// Load the batch, which blocks until the previous batch has fully
    /// drained, then start every retransmit timer.
    async fn flush_batch(&mut self, batch: &mut Vec<Arc<TimedSegment>>) -> Result<(), TransferError> {
        if batch.is_empty() {
            return Ok(());
        }
        let segments = std::mem::take(batch);
        self.window.load(segments.clone()).await?;
        for segment in &segments {
            segment.start();
        }
        Ok(())
    }

    /// Best-effort EXIT announcement; no acknowledgment is expected.
    async fn exit_broadcast(&self) {
        info!("broadcasting EXIT");
        let exit = Segment::with_header(self.head.with(Flag::EXIT), Bytes::new());
        if let Err(e) = self.broadcast.send(&exit.serialize()).await {
            warn!(error = %e, "EXIT broadcast failed");
        }
    }
}

/// Resolve once the done signal arrives; pend forever if it never can.
async fn wait_done(done: &mut watch::Receiver<bool>) {
    if done.wait_for(|done| *done).await.is_err() {
        // The handle is gone, so the signal can never fire.
        std::future::pending::<()>().await;
    }
}

/// Pull acknowledgment headers off the listening socket into a channel,
/// applying the sender-side artificial drop.
async fn read_responses(socket: UdpSocket, tx: mpsc::Sender<AckResponse>, drop_chance: u8) {
    let mut buf = [0u8; 64];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "ack socket read failed");
                continue;
            }
        };
        let header = match Header::decode(&mut &buf[..len]) {
            Ok(header) => header,
            Err(_) => {
                debug!(addr = %addr, len, "undersized datagram on the reply port");
                continue;
            }
        };
        if drop_chance > 0 && rand::thread_rng().gen_range(0..100u8) < drop_chance {
            continue;
        }
        if !header.flag.is_ack() {
            debug!(addr = %addr, %header, "non-ACK datagram on the reply port");
            continue;
        }
        if tx.send(AckResponse { addr, header }).await.is_err() {
            break;
        }
    }
}

/// Serialized acknowledgment handling for one file.
///
/// Owns the receiver map for the duration of the broadcast phase, so ACK
/// bookkeeping and eviction are race-free. Returns the response channel to
/// the caller along with the outcome.
async fn ack_loop(
    mut responses: mpsc::Receiver<AckResponse>,
    window: Window<TimedSegment>,
    mut peers: HashMap<SocketAddr, Peer>,
    mut evictions: mpsc::Receiver<SocketAddr>,
    mut stop: watch::Receiver<bool>,
) -> (mpsc::Receiver<AckResponse>, Result<(), TransferError>) {
    let mut stopping = false;
    let result = loop {
        tokio::select! {
            response = responses.recv() => {
                let Some(response) = response else {
                    break Err(TransferError::Protocol(
                        "acknowledgment channel closed".to_string(),
                    ));
                };
                handle_response(&window, &peers, response);
            }
            Some(addr) = evictions.recv() => {
                if peers.remove(&addr).is_some() {
                    warn!(%addr, "receiver unresponsive, evicting");
                    if peers.is_empty() {
                        break Err(TransferError::NoReceivers);
                    }
                    // The survivors may already cover some slots.
                    for slot in window.slots() {
                        if !slot.is_removed() && slot.acked_by_all(peers.keys()) {
                            slot.mark_removable();
                        }
                    }
                }
            }
            changed = stop.changed(), if !stopping => {
                if changed.is_err() || *stop.borrow() {
                    stopping = true;
                }
            }
            _ = window.wait_empty(), if stopping => break Ok(()),
        }
    };
    for peer in peers.values() {
        peer.stop();
    }
    (responses, result)
}

fn handle_response(
    window: &Window<TimedSegment>,
    peers: &HashMap<SocketAddr, Peer>,
    response: AckResponse,
) {
    let Some(peer) = peers.get(&response.addr) else {
        info!(addr = %response.addr, "ack from unknown receiver, ignoring");
        return;
    };
    peer.reset();
    match window.get(response.header) {
        None => {
            // Already removable, or from a batch long gone.
            debug!(header = %response.header, "stale ack");
        }
        Some(slot) => {
            slot.ack(response.addr);
            if slot.acked_by_all(peers.keys()) {
                slot.mark_removable();
            }
        }
    }
}

/// Read the next payload of at most `size` bytes; `None` at end of file.
async fn next_payload(
    file: &mut tokio::fs::File,
    size: usize,
) -> Result<Option<Bytes>, TransferError> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(None);
    }
    buf.truncate(filled);
    Ok(Some(Bytes::from(buf)))
}
