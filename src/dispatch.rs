//! Change notifications for observers.
//!
//! Delivery is at-most-once and best effort. `QueueDispatcher` never blocks
//! the caller: when its bounded queue is full the oldest pending notification
//! is dropped to make room. Observers that need the truth read the document
//! store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{Collection, Operation};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub collection: Collection,
    pub operation: Operation,
    pub ids: Vec<String>,
}

pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, collection: Collection, operation: Operation, ids: Vec<String>);
}

pub trait Observer: Send + Sync {
    fn notify(&self, notification: &Notification);
}

impl<F> Observer for F
where
    F: Fn(&Notification) + Send + Sync,
{
    fn notify(&self, notification: &Notification) {
        self(notification)
    }
}

/// Writes every notification to the log.
pub struct LogObserver;

impl Observer for LogObserver {
    fn notify(&self, notification: &Notification) {
        info!(
            collection = %notification.collection,
            operation = %notification.operation,
            ids = ?notification.ids,
            "dispatch"
        );
    }
}

/// Discards everything.
pub struct NullDispatcher;

impl Dispatcher for NullDispatcher {
    fn dispatch(&self, _collection: Collection, _operation: Operation, _ids: Vec<String>) {}
}

struct Queue {
    items: VecDeque<Notification>,
    closed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    capacity: usize,
    dropped: AtomicU64,
    observers: RwLock<Vec<Arc<dyn Observer>>>,
}

impl Shared {
    fn deliver(&self, notification: &Notification) {
        let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner);
        for observer in observers.iter() {
            observer.notify(notification);
        }
    }
}

pub struct QueueDispatcher {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueueDispatcher {
    /// Starts the fan-out worker. `capacity` is clamped to at least 1.
    pub fn start(capacity: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                items: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            observers: RwLock::new(Vec::new()),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("kira-dispatch".to_string())
            .spawn(move || fan_out(worker_shared))
            .map_err(|err| warn!(error = %err, "failed to spawn dispatch worker"))
            .ok();

        Self {
            shared,
            worker: Mutex::new(worker),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) {
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Notifications discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Delivers what is still queued and stops the worker.
    pub fn shutdown(&self) {
        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            queue.closed = true;
        }
        self.shared.available.notify_all();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("dispatch worker panicked");
            }
        }
    }
}

impl Dispatcher for QueueDispatcher {
    fn dispatch(&self, collection: Collection, operation: Operation, ids: Vec<String>) {
        let notification = Notification {
            collection,
            operation,
            ids,
        };
        let mut queue = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if queue.closed {
            debug!(collection = %collection, "dispatcher closed; notification discarded");
            return;
        }
        if queue.items.len() >= self.shared.capacity {
            if let Some(oldest) = queue.items.pop_front() {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    collection = %oldest.collection,
                    operation = %oldest.operation,
                    "dispatch queue full; dropped oldest notification"
                );
            }
        }
        queue.items.push_back(notification);
        drop(queue);
        self.shared.available.notify_one();
    }
}

impl Drop for QueueDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn fan_out(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut queue = shared.queue.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if let Some(item) = queue.items.pop_front() {
                    break Some(item);
                }
                if queue.closed {
                    break None;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        match next {
            Some(notification) => shared.deliver(&notification),
            None => return,
        }
    }
}
