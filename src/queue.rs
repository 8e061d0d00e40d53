//! Queued requests for Queue-mode (sleepy) devices
//!
//! A device whose binding contains `Q` only listens right after contacting the
//! server. Operations issued for it more than the threshold after its
//! registration are held here until [`QueuedRequestManager::deliver`] is called
//! on its next update, or dropped when its lifetime elapses first.

use crate::codec::Content;
use crate::error::{Lwm2mError, Result};
use crate::registry::{Device, DeviceRegistry};
use crate::types::{DeviceId, Operation};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;

/// Delay after registration beyond which queue-mode devices get queued requests
pub const DEFAULT_QUEUE_DELAY_THRESHOLD: Duration = Duration::from_millis(1000);

/// Deferred body of an operation
pub type Execute = Box<dyn FnOnce() -> BoxFuture<'static, Result<Content>> + Send>;

/// Receives the outcome of an operation executed on wake-up
pub type ResultHandler = Box<dyn FnOnce(Operation, Result<Content>) + Send>;

/// Notified with every operation dropped because the device lifetime elapsed
pub type EvictionListener = Arc<dyn Fn(Operation) + Send + Sync>;

struct QueuedRequest {
    operation: Operation,
    execute: Execute,
    result_handler: ResultHandler,
    timeout: JoinHandle<()>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    entries: BTreeMap<u64, QueuedRequest>,
}

/// Pending operations of queue-mode devices, in enqueue order
#[derive(Clone)]
pub struct QueuedRequestManager {
    state: Arc<Mutex<QueueState>>,
    threshold: Duration,
    eviction_listener: Arc<Mutex<Option<EvictionListener>>>,
}

impl Default for QueuedRequestManager {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DELAY_THRESHOLD)
    }
}

impl QueuedRequestManager {
    pub fn new(threshold: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            threshold,
            eviction_listener: Arc::new(Mutex::new(None)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a listener called after an entry is evicted
    pub fn set_eviction_listener(&self, listener: impl Fn(Operation) + Send + Sync + 'static) {
        *self
            .eviction_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
    }

    /// Whether an operation for `device` issued at `now` must wait for its next wake-up
    pub fn should_queue(&self, device: &Device, now: SystemTime) -> bool {
        device.is_queue_mode()
            && now
                .duration_since(device.creation_date)
                .map(|since_registration| since_registration > self.threshold)
                .unwrap_or(false)
    }

    /// Execute `operation` now, or queue it and return `RequestInQueue`
    ///
    /// When queued, `result_handler` later receives the outcome produced on
    /// delivery. When executed immediately the outcome is returned directly.
    pub async fn handle(
        &self,
        registry: &dyn DeviceRegistry,
        operation: Operation,
        execute: Execute,
        result_handler: ResultHandler,
    ) -> Result<Content> {
        let device = registry.get(operation.device_id).await?;

        if self.should_queue(&device, SystemTime::now()) {
            self.enqueue(operation, device.lifetime_duration(), execute, result_handler);
            tracing::info!(device_id = operation.device_id, %operation, "Request queued until device wakes up");
            return Err(Lwm2mError::RequestInQueue);
        }

        execute().await
    }

    fn enqueue(
        &self,
        operation: Operation,
        lifetime: Duration,
        execute: Execute,
        result_handler: ResultHandler,
    ) {
        // Held while spawning so the timer cannot fire before the entry exists
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;

        let manager = self.clone();
        let timeout = tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            manager.evict(seq);
        });

        state.entries.insert(
            seq,
            QueuedRequest {
                operation,
                execute,
                result_handler,
                timeout,
                enqueued_at: Instant::now(),
            },
        );
    }

    fn evict(&self, seq: u64) {
        let Some(entry) = self.lock().entries.remove(&seq) else {
            return;
        };
        tracing::warn!(
            device_id = entry.operation.device_id,
            operation = %entry.operation,
            queued_for = ?entry.enqueued_at.elapsed(),
            "Device lifetime elapsed, queued request dropped"
        );

        let listener = self
            .eviction_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener(entry.operation);
        }
    }

    fn take_device_entries(&self, device_id: DeviceId) -> Vec<QueuedRequest> {
        let mut state = self.lock();
        let seqs: Vec<u64> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.operation.device_id == device_id)
            .map(|(seq, _)| *seq)
            .collect();
        seqs.iter()
            .filter_map(|seq| state.entries.remove(seq))
            .collect()
    }

    /// Run every queued operation of `device_id` in enqueue order
    ///
    /// Each outcome goes to the result handler stored with it. Returns how many
    /// operations were delivered.
    pub async fn deliver(&self, device_id: DeviceId) -> usize {
        let entries = self.take_device_entries(device_id);
        for entry in &entries {
            entry.timeout.abort();
        }

        let delivered = entries.len();
        if delivered > 0 {
            tracing::debug!(device_id, delivered, "Delivering queued requests");
        }
        for entry in entries {
            let result = (entry.execute)().await;
            (entry.result_handler)(entry.operation, result);
        }
        delivered
    }

    /// Drop every queued operation of `device_id` without running it
    pub fn discard(&self, device_id: DeviceId) -> usize {
        let entries = self.take_device_entries(device_id);
        for entry in &entries {
            entry.timeout.abort();
        }
        entries.len()
    }

    /// Snapshot of all queued operations, in enqueue order
    pub fn pending(&self) -> Vec<Operation> {
        self.lock()
            .entries
            .values()
            .map(|entry| entry.operation)
            .collect()
    }

    /// Snapshot of the queued operations of one device, in enqueue order
    pub fn pending_for(&self, device_id: DeviceId) -> Vec<Operation> {
        self.lock()
            .entries
            .values()
            .filter(|entry| entry.operation.device_id == device_id)
            .map(|entry| entry.operation)
            .collect()
    }
}
