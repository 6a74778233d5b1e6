//! The sending window: a fixed number of in-flight segment slots.
//!
//! The window is loaded in batches. A batch occupies slots `[0..n)` at
//! sequence-contiguous headers, so a lookup is the red/blue distance from
//! the head slot. Each slot carries a "removed" signal; once every slot in
//! the batch has signaled, the batch is drained and the window accepts the
//! next load. This matches the sender's cadence of filling one window,
//! waiting for all acknowledgments, and refilling.

use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Semaphore};

use crate::error::TransferError;
use crate::header::Header;

/// An entry the window can hold and watch for removal.
pub trait WindowSlot: Send + Sync + 'static {
    /// The pure header identifying this slot.
    fn header(&self) -> Header;

    /// A receiver that observes `true` once the slot may be evicted.
    fn removed(&self) -> watch::Receiver<bool>;
}

/// Fixed-capacity window over in-flight segments.
///
/// Cheap to clone; all clones observe the same slots.
pub struct Window<S> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    capacity: usize,
    slots: Mutex<Vec<Arc<S>>>,
    /// One permit: held from load until the batch fully drains.
    gate: Arc<Semaphore>,
}

impl<S> Clone for Window<S> {
    fn clone(&self) -> Self {
        Window {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: WindowSlot> Window<S> {
    pub fn new(capacity: usize) -> Window<S> {
        Window {
            inner: Arc::new(Inner {
                capacity,
                slots: Mutex::new(Vec::with_capacity(capacity)),
                gate: Arc::new(Semaphore::new(1)),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Install a batch of segments at slots `[0..batch.len())`.
    ///
    /// Fails if the batch exceeds the capacity. Blocks while a previous
    /// batch is still draining; returns once the new batch is installed. A
    /// background task watches the batch and reopens the window when every
    /// slot has signaled removal.
    pub async fn load(&self, batch: Vec<Arc<S>>) -> Result<(), TransferError> {
        if batch.len() > self.inner.capacity {
            return Err(TransferError::WindowOverflow {
                given: batch.len(),
                capacity: self.inner.capacity,
            });
        }
        let permit = match self.inner.gate.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Err(TransferError::Cancelled),
        };

        let mut watchers: Vec<watch::Receiver<bool>> =
            batch.iter().map(|slot| slot.removed()).collect();
        {
            let mut slots = match self.inner.slots.lock() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            *slots = batch;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            for rx in &mut watchers {
                // A dropped sender counts as removed.
                let _ = rx.wait_for(|removed| *removed).await;
            }
            let mut slots = match inner.slots.lock() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            slots.clear();
            drop(slots);
            drop(permit);
        });
        Ok(())
    }

    /// Look up the slot whose pure header matches `header`.
    ///
    /// Slot zero anchors the batch; the index is the red/blue distance
    /// from its header. Headers before the head or beyond the batch yield
    /// `None`.
    pub fn get(&self, header: Header) -> Option<Arc<S>> {
        let slots = match self.inner.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        let head = slots.first()?;
        let target = header.pure();
        if target.compare(head.header()).is_lt() {
            return None;
        }
        let index = head.header().distance(target);
        if index >= slots.len() as u64 {
            return None;
        }
        Some(Arc::clone(&slots[index as usize]))
    }

    /// The segment at slot zero, if a batch is loaded.
    pub fn head(&self) -> Option<Arc<S>> {
        let slots = match self.inner.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.first().map(Arc::clone)
    }

    /// Every slot of the currently loaded batch.
    pub fn slots(&self) -> Vec<Arc<S>> {
        let slots = match self.inner.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.iter().map(Arc::clone).collect()
    }

    /// Whether no batch is currently loaded.
    pub fn empty(&self) -> bool {
        self.inner.gate.available_permits() == 1
    }

    /// Wait until the current batch (if any) has fully drained.
    pub async fn wait_empty(&self) {
        if let Ok(permit) = self.inner.gate.acquire().await {
            drop(permit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Flag;
    use std::time::Duration;

    struct TestSlot {
        header: Header,
        removed: watch::Sender<bool>,
    }

    impl TestSlot {
        fn new(header: Header) -> Arc<TestSlot> {
            let (removed, _) = watch::channel(false);
            Arc::new(TestSlot { header, removed })
        }

        fn remove(&self) {
            self.removed.send_replace(true);
        }
    }

    impl WindowSlot for TestSlot {
        fn header(&self) -> Header {
            self.header
        }

        fn removed(&self) -> watch::Receiver<bool> {
            self.removed.subscribe()
        }
    }

    fn batch_from(start: Header, len: usize) -> Vec<Arc<TestSlot>> {
        let mut headers = Vec::with_capacity(len);
        let mut h = start;
        for _ in 0..len {
            headers.push(TestSlot::new(h));
            h = h.next();
        }
        headers
    }

    #[tokio::test]
    async fn get_finds_loaded_segments() {
        let window: Window<TestSlot> = Window::new(4);
        let batch = batch_from(Header::new(Flag::RED, 10), 3);
        window.load(batch).await.unwrap();

        assert_eq!(
            window.head().unwrap().header(),
            Header::new(Flag::RED, 10)
        );
        let got = window.get(Header::new(Flag::RED, 12)).unwrap();
        assert_eq!(got.header(), Header::new(Flag::RED, 12));
    }

    #[tokio::test]
    async fn get_ignores_decorations_on_lookup() {
        let window: Window<TestSlot> = Window::new(4);
        window
            .load(batch_from(Header::new(Flag::RED, 0), 2))
            .await
            .unwrap();
        let decorated = Header::new(Flag::EOF | Flag::ACK | Flag::RED, 1);
        assert!(window.get(decorated).is_some());
    }

    #[tokio::test]
    async fn get_rejects_out_of_range_headers() {
        let window: Window<TestSlot> = Window::new(4);
        window
            .load(batch_from(Header::new(Flag::RED, 10), 3))
            .await
            .unwrap();

        // Before the head.
        assert!(window.get(Header::new(Flag::RED, 9)).is_none());
        // Beyond the batch.
        assert!(window.get(Header::new(Flag::RED, 13)).is_none());
    }

    #[tokio::test]
    async fn get_spans_the_color_flip() {
        let window: Window<TestSlot> = Window::new(4);
        window
            .load(batch_from(Header::new(Flag::RED, u32::MAX - 1), 4))
            .await
            .unwrap();

        let wrapped = window.get(Header::new(Flag::BLUE, 1)).unwrap();
        assert_eq!(wrapped.header(), Header::new(Flag::BLUE, 1));
    }

    #[tokio::test]
    async fn load_rejects_oversized_batch() {
        let window: Window<TestSlot> = Window::new(2);
        let err = window
            .load(batch_from(Header::new(Flag::RED, 0), 3))
            .await;
        assert!(matches!(
            err,
            Err(TransferError::WindowOverflow {
                given: 3,
                capacity: 2
            })
        ));
    }

    #[tokio::test]
    async fn load_blocks_until_previous_batch_drains() {
        let window: Window<TestSlot> = Window::new(2);
        let first = batch_from(Header::new(Flag::RED, 0), 2);
        window.load(first.clone()).await.unwrap();
        assert!(!window.empty());

        let second = batch_from(Header::new(Flag::RED, 2), 2);
        let blocked = {
            let window = window.clone();
            tokio::spawn(async move { window.load(second).await })
        };
        // The second load cannot proceed yet.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        for slot in &first {
            slot.remove();
        }
        blocked.await.unwrap().unwrap();
        assert_eq!(
            window.head().unwrap().header(),
            Header::new(Flag::RED, 2)
        );
    }

    #[tokio::test]
    async fn wait_empty_returns_after_drain() {
        let window: Window<TestSlot> = Window::new(2);
        let batch = batch_from(Header::new(Flag::BLUE, 5), 2);
        window.load(batch.clone()).await.unwrap();

        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.wait_empty().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        for slot in &batch {
            slot.remove();
        }
        waiter.await.unwrap();
        assert!(window.empty());
        assert!(window.head().is_none());
    }
}
