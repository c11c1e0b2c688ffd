//! In-process broker with fault injection.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{BrokerChannel, BrokerConnector, BrokerError};

/// A message as it sits on an in-memory queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub payload: Vec<u8>,
    pub content_type: String,
    pub persistent: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    durable: bool,
    messages: Vec<Delivery>,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<HashMap<String, QueueState>>,
    /// Bumped by `sever`; channels from an older generation report closed.
    generation: AtomicU64,
    fail_next_connects: AtomicU32,
    fail_declares: AtomicBool,
    reject_publishes: AtomicBool,
    connect_count: AtomicU32,
    publish_attempts: AtomicU32,
}

/// Connector and queue storage in one. Cloning the `Arc` shares the queues.
#[derive(Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.fail_next_connects.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_declares(&self, fail: bool) {
        self.shared.fail_declares.store(fail, Ordering::SeqCst);
    }

    pub fn set_reject_publishes(&self, reject: bool) {
        self.shared.reject_publishes.store(reject, Ordering::SeqCst);
    }

    /// Drop every open channel, as a broker restart would.
    pub fn sever(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Successful connections so far.
    pub fn connect_count(&self) -> u32 {
        self.shared.connect_count.load(Ordering::SeqCst)
    }

    /// Publish calls that reached the broker, accepted or not.
    pub fn publish_attempts(&self) -> u32 {
        self.shared.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn messages(&self, queue: &str) -> Vec<Delivery> {
        self.lock_queues()
            .get(queue)
            .map(|q| q.messages.clone())
            .unwrap_or_default()
    }

    pub fn queue_is_durable(&self, queue: &str) -> bool {
        self.lock_queues()
            .get(queue)
            .map(|q| q.durable)
            .unwrap_or(false)
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, HashMap<String, QueueState>> {
        lock(&self.shared.queues)
    }
}

// A poisoned lock only means a panicking test thread; the map is still usable.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let remaining = self.shared.fail_next_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.shared
                .fail_next_connects
                .store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::Connection("connection refused".to_string()));
        }
        self.shared.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryChannel {
            shared: self.shared.clone(),
            generation: self.shared.generation.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    generation: u64,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::NotReady)
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_durable(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if self.shared.fail_declares.load(Ordering::SeqCst) {
            return Err(BrokerError::Declare {
                queue: queue.to_string(),
                message: "injected declare failure".to_string(),
            });
        }
        lock(&self.shared.queues)
            .entry(queue.to_string())
            .or_default()
            .durable = true;
        Ok(())
    }

    async fn publish_persistent(
        &self,
        queue: &str,
        payload: &[u8],
        content_type: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.shared.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if self.shared.reject_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish {
                queue: queue.to_string(),
                message: "injected publish rejection".to_string(),
            });
        }
        let mut queues = lock(&self.shared.queues);
        let state = queues.get_mut(queue).ok_or_else(|| BrokerError::Publish {
            queue: queue.to_string(),
            message: "queue not declared".to_string(),
        })?;
        state.messages.push(Delivery {
            payload: payload.to_vec(),
            content_type: content_type.to_string(),
            persistent: true,
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.generation == self.shared.generation.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
