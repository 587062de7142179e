//! Storage event pipeline.
//!
//! Every local store publishes its mutations as [`StorageEvent`]s into a
//! bounded pipeline. A collector task coalesces them into batches and emits a
//! batch whenever the size threshold or the time window is reached, whichever
//! fires first. On overflow the oldest buffered event is dropped with a
//! warning rather than silently.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::warn;

/// Capacity of the intermediate event queue between a store and its collector.
const PIPELINE_QUEUE_CAPACITY: usize = 8192;

/// A mutation observed on a local store.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageEvent<K, V> {
    /// A key was inserted for the first time.
    Created { key: K, value: V },

    /// An existing key was overwritten.
    Updated { key: K, old_value: V, new_value: V },

    /// A key was deleted through the public API.
    Deleted { key: K, value: V },

    /// A key passed its expiration instant.
    Expired { key: K, value: V },

    /// A key was evicted (internal removal, not a logical delete).
    Evicted { key: K, value: V },

    /// A key was restored from a backup copy.
    Restored { key: K, value: V },

    /// The store is closing; the final event on the stream.
    Closing,
}

impl<K, V> StorageEvent<K, V> {
    /// The key this event concerns, if any.
    pub fn key(&self) -> Option<&K> {
        match self {
            StorageEvent::Created { key, .. }
            | StorageEvent::Updated { key, .. }
            | StorageEvent::Deleted { key, .. }
            | StorageEvent::Expired { key, .. }
            | StorageEvent::Evicted { key, .. }
            | StorageEvent::Restored { key, .. } => Some(key),
            StorageEvent::Closing => None,
        }
    }
}

/// A batch of coalesced storage events.
pub type EventBatch<K, V> = Arc<Vec<StorageEvent<K, V>>>;

struct PipelineShared<K, V> {
    queue: Mutex<VecDeque<StorageEvent<K, V>>>,
    notify: Notify,
    closed: AtomicBool,
}

/// Size- and time-windowed event collector for one local store.
pub struct EventPipeline<K, V> {
    shared: Arc<PipelineShared<K, V>>,
    sender: Mutex<Option<broadcast::Sender<EventBatch<K, V>>>>,
    storage_id: String,
}

impl<K, V> EventPipeline<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a pipeline and spawn its collector task.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(storage_id: impl Into<String>, max_events: usize, window: Duration) -> Self {
        let storage_id = storage_id.into();
        let shared = Arc::new(PipelineShared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let (tx, _) = broadcast::channel(64);

        let collector_shared = shared.clone();
        let collector_tx = tx.clone();
        tokio::spawn(run_collector(
            collector_shared,
            collector_tx,
            max_events.max(1),
            window,
        ));

        Self {
            shared,
            sender: Mutex::new(Some(tx)),
            storage_id,
        }
    }

    /// Queue an event for batching. Drops the oldest buffered event when the
    /// queue is full.
    pub fn publish(&self, event: StorageEvent<K, V>) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= PIPELINE_QUEUE_CAPACITY {
                queue.pop_front();
                warn!(
                    storage = %self.storage_id,
                    "event pipeline overflow, dropping oldest event"
                );
            }
            queue.push_back(event);
        }
        self.shared.notify.notify_one();
    }

    /// Subscribe to event batches. A closed pipeline yields a receiver that
    /// reports the stream as ended.
    pub fn subscribe(&self) -> broadcast::Receiver<EventBatch<K, V>> {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Whether the pipeline has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Emit the closing event, flush remaining batches and stop the collector.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.queue.lock().push_back(StorageEvent::Closing);
        self.shared.notify.notify_one();
        // The collector's sender clone keeps subscribers alive until the
        // final batch is emitted.
        self.sender.lock().take();
    }
}

async fn run_collector<K, V>(
    shared: Arc<PipelineShared<K, V>>,
    tx: broadcast::Sender<EventBatch<K, V>>,
    max_events: usize,
    window: Duration,
) where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    loop {
        // Wait for the first event of the next batch.
        loop {
            let empty = shared.queue.lock().is_empty();
            if !empty {
                break;
            }
            if shared.closed.load(Ordering::Acquire) {
                return;
            }
            shared.notify.notified().await;
        }

        let deadline = Instant::now() + window;
        loop {
            let closed = shared.closed.load(Ordering::Acquire);
            let ready = {
                let queue = shared.queue.lock();
                queue.len() >= max_events || closed
            };
            if ready || Instant::now() >= deadline {
                emit(&shared, &tx, max_events, closed);
                break;
            }
            tokio::select! {
                _ = shared.notify.notified() => {}
                _ = sleep_until(deadline) => {}
            }
        }
    }
}

fn emit<K, V>(
    shared: &PipelineShared<K, V>,
    tx: &broadcast::Sender<EventBatch<K, V>>,
    max_events: usize,
    flush_all: bool,
) where
    K: Clone,
    V: Clone,
{
    loop {
        let batch: Vec<StorageEvent<K, V>> = {
            let mut queue = shared.queue.lock();
            let take = queue.len().min(max_events);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }
        let _ = tx.send(Arc::new(batch));
        if !flush_all {
            return;
        }
    }
}
