//! Bounded asynchronous hand-off between callers and the tracking pipeline
//!
//! Callers never wait: `try_dispatch` either places the item on a bounded
//! channel or reports why it could not. A fixed pool of worker tasks drains
//! the channel.

use crate::error::DispatchError;
use log::{debug, warn};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Fixed-size worker pool fed by a bounded queue
pub struct Dispatcher<T> {
    sender: Mutex<Option<mpsc::Sender<T>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
}

impl<T: Send + 'static> Dispatcher<T> {
    /// Start `workers` tasks on `runtime`, each running `handler` per item
    ///
    /// # Arguments
    ///
    /// * `runtime` - Runtime the worker tasks are spawned on
    /// * `workers` - Number of worker tasks (at least 1)
    /// * `capacity` - Queue capacity (at least 1)
    /// * `handler` - Async function run for every dispatched item
    pub fn spawn<F, Fut>(runtime: &Handle, workers: usize, capacity: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let handler = Arc::new(handler);

        let handles = (0..workers.max(1))
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                let handler = Arc::clone(&handler);
                runtime.spawn(async move {
                    loop {
                        // The lock is released before the item is handled
                        let item = receiver.lock().await.recv().await;
                        match item {
                            Some(item) => (*handler)(item).await,
                            None => break,
                        }
                    }
                    debug!("Dispatch worker {} stopped", id);
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            capacity,
        }
    }

    /// Queue an item without waiting
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::QueueFull` when the queue is at capacity and
    /// `DispatchError::Closed` after shutdown.
    pub fn try_dispatch(&self, item: T) -> Result<(), DispatchError> {
        let guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let sender = guard.as_ref().ok_or(DispatchError::Closed)?;
        sender.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
        })
    }

    /// Items currently waiting in the queue
    pub fn queued(&self) -> usize {
        match self.sender.lock() {
            Ok(guard) => guard
                .as_ref()
                .map_or(0, |s| s.max_capacity() - s.capacity()),
            Err(_) => 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Close the queue and wait for the workers to drain it
    pub async fn shutdown(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        let handles = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(target: "errwatch::internal", "Dispatch worker ended abnormally: {}", e);
            }
        }
    }
}

impl<T> std::fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("capacity", &self.capacity)
            .finish()
    }
}
