//! Typed publish/subscribe bus for admin notifications

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::error;

use crate::panic_message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Synchronous event bus.
///
/// `publish` calls every subscriber in registration order on the caller's
/// thread. A panicking subscriber is logged and skipped.
pub struct EventBus<E> {
    subscribers: Arc<Mutex<Vec<(SubscriptionId, Subscriber<E>)>>>,
    next_id: Arc<AtomicU64>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.lock().len())
            .finish()
    }
}

impl<E: fmt::Debug + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(subscriber)));
        id
    }

    /// Forward every event into an unbounded channel
    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<E>
    where
        E: Clone,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(move |event: &E| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    pub fn publish(&self, event: E) {
        let subscribers: Vec<Subscriber<E>> = self
            .lock()
            .iter()
            .map(|(_, subscriber)| subscriber.clone())
            .collect();

        for subscriber in subscribers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| subscriber(&event))) {
                error!(
                    ?event,
                    "Event subscriber panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }
}

impl<E> EventBus<E> {
    fn lock(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Subscriber<E>)>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
