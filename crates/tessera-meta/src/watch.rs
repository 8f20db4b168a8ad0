//! Ordered change notification.
//!
//! Every subscription owns a delivery task that pages through the durable
//! event history of the log, keeps the events its filter selects, and pushes
//! whole batches into a bounded queue. The task only reads history, so a slow
//! subscriber never holds up command application.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use tessera_consensus::ReplicatedLog;
use tessera_types::{MetaError, Revision, WatchBatch};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Batches buffered per subscription before backpressure kicks in.
    pub queue_capacity: usize,
    /// How long a full queue may stay full before the subscription overflows.
    pub overflow_wait_ms: u64,
    /// Batches fetched from history per read.
    pub page_size: usize,
}

impl WatchConfig {
    pub fn overflow_wait(&self) -> Duration {
        Duration::from_millis(self.overflow_wait_ms)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig { queue_capacity: 128, overflow_wait_ms: 1_000, page_size: 256 }
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
    Exact(Vec<u8>),
    Prefix(Vec<u8>),
    /// `start` inclusive, `end` exclusive; empty `end` is unbounded.
    Range { start: Vec<u8>, end: Vec<u8> },
}

impl KeySelector {
    pub fn matches(&self, key: &[u8]) -> bool {
        match self {
            KeySelector::Exact(k) => key == k.as_slice(),
            KeySelector::Prefix(p) => key.starts_with(p),
            KeySelector::Range { start, end } => {
                key >= start.as_slice() && (end.is_empty() || key < end.as_slice())
            }
        }
    }
}

/// Union of key selectors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchFilter {
    selectors: Vec<KeySelector>,
}

impl WatchFilter {
    /// Every key.
    pub fn all() -> Self {
        Self::prefix(Vec::new())
    }

    pub fn key(key: impl Into<Vec<u8>>) -> Self {
        WatchFilter { selectors: vec![KeySelector::Exact(key.into())] }
    }

    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        WatchFilter { selectors: vec![KeySelector::Prefix(prefix.into())] }
    }

    pub fn range(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        WatchFilter { selectors: vec![KeySelector::Range { start: start.into(), end: end.into() }] }
    }

    pub fn with(mut self, selector: KeySelector) -> Self {
        self.selectors.push(selector);
        self
    }

    pub fn selectors(&self) -> &[KeySelector] {
        &self.selectors
    }

    pub fn matches(&self, key: &[u8]) -> bool {
        self.selectors.iter().any(|s| s.matches(key))
    }

    /// Keep only the events of `batch` this filter selects.
    pub fn select(&self, mut batch: WatchBatch) -> Option<WatchBatch> {
        batch.events.retain(|e| self.matches(&e.key));
        if batch.events.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}

// ---------------------------------------------------------------------------
// WatchDispatcher
// ---------------------------------------------------------------------------

/// Registry entry of a live subscription.
struct WatchHandle {
    abort: AbortHandle,
    /// Shared with the subscription so queued batches are discarded once set.
    cancelled: Arc<AtomicBool>,
}

impl WatchHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.abort.abort();
    }
}

type Registry = Arc<Mutex<HashMap<u64, WatchHandle>>>;

fn lock_registry(registry: &Registry) -> std::sync::MutexGuard<'_, HashMap<u64, WatchHandle>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct WatchDispatcher<R> {
    log: Arc<R>,
    config: WatchConfig,
    registry: Registry,
    next_id: Arc<AtomicU64>,
}

impl<R> Clone for WatchDispatcher<R> {
    fn clone(&self) -> Self {
        WatchDispatcher {
            log: self.log.clone(),
            config: self.config.clone(),
            registry: self.registry.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<R: ReplicatedLog> WatchDispatcher<R> {
    pub fn new(log: Arc<R>, config: WatchConfig) -> Self {
        WatchDispatcher {
            log,
            config,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Deliver every batch with revision `> from_exclusive` that touches a
    /// key selected by `filter`.
    pub fn subscribe(&self, filter: WatchFilter, from_exclusive: Revision) -> WatchSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let task = tokio::spawn(deliver(
            self.log.clone(),
            filter,
            from_exclusive,
            tx,
            self.config.clone(),
            id,
        ));
        let cancelled = Arc::new(AtomicBool::new(false));
        lock_registry(&self.registry)
            .insert(id, WatchHandle { abort: task.abort_handle(), cancelled: cancelled.clone() });
        debug!(watch_id = id, from = from_exclusive, "watch registered");

        WatchSubscription {
            id,
            rx,
            handle: WatchHandle { abort: task.abort_handle(), cancelled },
            registry: self.registry.clone(),
            last_delivered: from_exclusive,
            state: SubscriptionState::Open,
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        lock_registry(&self.registry).len()
    }

    /// Cancel every live subscription. Batches already queued are discarded.
    pub fn shutdown(&self) {
        let handles: Vec<WatchHandle> = lock_registry(&self.registry).drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.cancel();
        }
        debug!(cancelled = handles.len(), "watch dispatcher shut down");
    }
}

async fn deliver<R: ReplicatedLog>(
    log: Arc<R>,
    filter: WatchFilter,
    mut after: Revision,
    tx: mpsc::Sender<Result<WatchBatch, MetaError>>,
    config: WatchConfig,
    id: u64,
) {
    let mut applied = log.subscribe_applied();
    loop {
        let head = *applied.borrow_and_update();
        while after < head {
            let batches = match log.batches_after(after, config.page_size).await {
                Ok(batches) => batches,
                Err(e) => {
                    debug!(watch_id = id, after, error = %e, "watch terminated");
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            if batches.is_empty() {
                after = head;
                break;
            }
            for batch in batches {
                after = batch.revision;
                let Some(batch) = filter.select(batch) else {
                    continue;
                };
                match tx.send_timeout(Ok(batch), config.overflow_wait()).await {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(_)) => {
                        warn!(watch_id = id, revision = after, "watch queue overflowed");
                        // Queued batches are drained before the overflow signal.
                        let _ = tx.send(Err(MetaError::Overflow)).await;
                        return;
                    }
                    Err(SendTimeoutError::Closed(_)) => return,
                }
            }
        }
        if applied.changed().await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// WatchSubscription
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum SubscriptionState {
    Open,
    Terminated(MetaError),
    Cancelled,
}

/// Handle to a live watch. Dropping it cancels the watch.
pub struct WatchSubscription {
    id: u64,
    rx: mpsc::Receiver<Result<WatchBatch, MetaError>>,
    handle: WatchHandle,
    registry: Registry,
    last_delivered: Revision,
    state: SubscriptionState,
}

impl WatchSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next batch, in strictly increasing revision order.
    ///
    /// Terminal outcomes are `Overflow` and `Compacted` (resubscribe from
    /// [`last_delivered`](Self::last_delivered) or fall back to a range read)
    /// and `Cancelled`. Once terminal, every further call repeats the error.
    pub async fn recv(&mut self) -> Result<WatchBatch, MetaError> {
        match &self.state {
            SubscriptionState::Open => {}
            SubscriptionState::Terminated(e) => return Err(e.clone()),
            SubscriptionState::Cancelled => return Err(MetaError::Cancelled),
        }
        let next = self.rx.recv().await;
        if self.handle.cancelled.load(Ordering::Acquire) {
            self.cancel();
            return Err(MetaError::Cancelled);
        }
        match next {
            Some(Ok(batch)) => {
                self.last_delivered = batch.revision;
                Ok(batch)
            }
            Some(Err(e)) => {
                self.state = SubscriptionState::Terminated(e.clone());
                Err(e)
            }
            None => {
                self.state = SubscriptionState::Cancelled;
                Err(MetaError::Cancelled)
            }
        }
    }

    /// Revision of the last batch returned by `recv`, or the starting point.
    pub fn last_delivered(&self) -> Revision {
        self.last_delivered
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == SubscriptionState::Cancelled || self.handle.cancelled.load(Ordering::Acquire)
    }

    /// Stop delivery. Batches already queued are discarded.
    pub fn cancel(&mut self) {
        if self.state == SubscriptionState::Cancelled {
            return;
        }
        self.state = SubscriptionState::Cancelled;
        self.handle.cancel();
        self.rx.close();
        lock_registry(&self.registry).remove(&self.id);
        debug!(watch_id = self.id, "watch cancelled");
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
