//! Message bus with per-tunnel mailboxes
//!
//! Every live tunnel owns one [`Mailbox`]: a bounded outbound queue drained by
//! the tunnel's writer task. Publishers address mailboxes by broadcast, by the
//! owner's address, or through filters. Inbound messages read off a tunnel are
//! handed to [`MailboxReader`]s, each in its own task.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::{panic_message, Addressable};

/// Default outbound queue capacity
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Identifies one mailbox for its whole life, even if its address is reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MailboxId(u64);

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mailbox-{}", self.0)
    }
}

/// Receiving end of a mailbox, owned by one tunnel
pub struct Mailbox<M, T> {
    id: MailboxId,
    token: T,
    receiver: mpsc::Receiver<M>,
    dropped: Arc<AtomicU64>,
}

impl<M, T> Mailbox<M, T> {
    pub fn id(&self) -> MailboxId {
        self.id
    }

    pub fn token(&self) -> &T {
        &self.token
    }

    /// Next queued message; `None` once the mailbox has been closed
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Messages discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<M, T: fmt::Debug> fmt::Debug for Mailbox<M, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Sending side of a registered mailbox
#[derive(Clone)]
pub struct MailboxHandle<M, T> {
    id: MailboxId,
    token: T,
    sender: mpsc::Sender<M>,
    dropped: Arc<AtomicU64>,
}

impl<M, T: Addressable> MailboxHandle<M, T> {
    pub fn id(&self) -> MailboxId {
        self.id
    }

    pub fn token(&self) -> &T {
        &self.token
    }

    /// Non-blocking enqueue; a full queue drops the new message
    pub fn offer(&self, message: M) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    address = %self.token.address(),
                    dropped,
                    "Mailbox full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(address = %self.token.address(), "Mailbox receiver gone");
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Handles messages read off a tunnel
#[async_trait]
pub trait MailboxReader<M, T>: Send + Sync + 'static {
    async fn on_message(&self, message: M, from: T);
}

/// Adapts an async closure into a [`MailboxReader`]
pub struct FnReader<F>(F);

/// Wrap `f` as a reader
pub fn reader_fn<F>(f: F) -> FnReader<F> {
    FnReader(f)
}

#[async_trait]
impl<M, T, F, Fut> MailboxReader<M, T> for FnReader<F>
where
    M: Send + 'static,
    T: Send + 'static,
    F: Fn(M, T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn on_message(&self, message: M, from: T) {
        (self.0)(message, from).await
    }
}

type Filter<M, T> = Arc<dyn Fn(&M, &T) -> bool + Send + Sync>;
type Hook<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<M, T> {
    mailboxes: Mutex<HashMap<MailboxId, MailboxHandle<M, T>>>,
    readers: RwLock<Vec<Arc<dyn MailboxReader<M, T>>>>,
    filters: RwLock<Vec<Filter<M, T>>>,
    on_created: RwLock<Option<Hook<T>>>,
    on_closed: RwLock<Option<Hook<T>>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// Message bus over the live tunnels.
///
/// The live set is guarded by one mutex which is only held to copy out the
/// handles; filters, hooks, readers and enqueues all run without it.
pub struct MessageBus<M, T> {
    inner: Arc<Inner<M, T>>,
}

impl<M, T> Clone for MessageBus<M, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M, T> fmt::Debug for MessageBus<M, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl<M, T> Default for MessageBus<M, T>
where
    M: Clone + Send + 'static,
    T: Addressable,
{
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX_CAPACITY)
    }
}

impl<M, T> MessageBus<M, T>
where
    M: Clone + Send + 'static,
    T: Addressable,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                mailboxes: Mutex::new(HashMap::new()),
                readers: RwLock::new(Vec::new()),
                filters: RwLock::new(Vec::new()),
                on_created: RwLock::new(None),
                on_closed: RwLock::new(None),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Register a new mailbox owned by `token`
    pub fn create_mailbox(&self, token: T) -> Mailbox<M, T> {
        let id = MailboxId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        let handle = MailboxHandle {
            id,
            token: token.clone(),
            sender,
            dropped: dropped.clone(),
        };
        self.lock_mailboxes().insert(id, handle);

        debug!(%id, address = %token.address(), "Mailbox created");

        let hook = read(&self.inner.on_created).clone();
        if let Some(hook) = hook {
            hook(&token);
        }

        Mailbox {
            id,
            token,
            receiver,
            dropped,
        }
    }

    /// Unregister a mailbox. Returns false if it was already gone.
    pub fn close_mailbox(&self, id: MailboxId) -> bool {
        let removed = self.lock_mailboxes().remove(&id);

        let Some(handle) = removed else {
            return false;
        };

        debug!(%id, address = %handle.token.address(), "Mailbox closed");

        let hook = read(&self.inner.on_closed).clone();
        if let Some(hook) = hook {
            hook(&handle.token);
        }
        true
    }

    /// Deliver to every open mailbox except `exclude`, subject to the filters.
    /// Returns how many mailboxes accepted the message.
    pub fn broadcast(&self, message: M, exclude: Option<&str>) -> usize {
        let targets: Vec<MailboxHandle<M, T>> = self.lock_mailboxes().values().cloned().collect();
        let filters = read(&self.inner.filters).clone();

        let mut delivered = 0;
        for handle in targets {
            if exclude == Some(handle.token.address()) {
                continue;
            }
            if !filters.iter().all(|allow| allow(&message, &handle.token)) {
                trace!(address = %handle.token.address(), "Broadcast vetoed by filter");
                continue;
            }
            if handle.offer(message.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver to the mailbox owned by `address`
    pub fn unicast(&self, message: M, address: &str) -> bool {
        match self.handle(address) {
            Some(handle) => handle.offer(message),
            None => {
                debug!(address, "Unicast to unknown mailbox");
                false
            }
        }
    }

    /// Run every registered reader on `message` in its own task.
    ///
    /// A panicking reader is logged and does not affect the others.
    pub fn dispatch_inbound(&self, message: M, from: T) -> Vec<JoinHandle<()>> {
        let readers = read(&self.inner.readers).clone();

        readers
            .into_iter()
            .map(|reader| {
                let message = message.clone();
                let from = from.clone();
                tokio::spawn(async move {
                    let address = from.address().to_string();
                    let outcome = AssertUnwindSafe(reader.on_message(message, from))
                        .catch_unwind()
                        .await;
                    if let Err(panic) = outcome {
                        error!(
                            from = %address,
                            "Mailbox reader panicked: {}",
                            panic_message(panic.as_ref())
                        );
                    }
                })
            })
            .collect()
    }

    pub fn add_reader<R>(&self, reader: R)
    where
        R: MailboxReader<M, T>,
    {
        write(&self.inner.readers).push(Arc::new(reader));
    }

    /// Add a broadcast filter; returning false vetoes the (message, mailbox) pair
    pub fn add_filter<F>(&self, filter: F)
    where
        F: Fn(&M, &T) -> bool + Send + Sync + 'static,
    {
        write(&self.inner.filters).push(Arc::new(filter));
    }

    pub fn set_on_created<F>(&self, hook: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        *write(&self.inner.on_created) = Some(Arc::new(hook));
    }

    pub fn set_on_closed<F>(&self, hook: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        *write(&self.inner.on_closed) = Some(Arc::new(hook));
    }

    pub fn handle(&self, address: &str) -> Option<MailboxHandle<M, T>> {
        self.lock_mailboxes()
            .values()
            .find(|handle| handle.token.address() == address)
            .cloned()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.lock_mailboxes()
            .values()
            .any(|handle| handle.token.address() == address)
    }

    pub fn tokens(&self) -> Vec<T> {
        self.lock_mailboxes()
            .values()
            .map(|handle| handle.token.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock_mailboxes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_mailboxes(&self) -> MutexGuard<'_, HashMap<MailboxId, MailboxHandle<M, T>>> {
        self.inner
            .mailboxes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn read<V>(lock: &RwLock<V>) -> std::sync::RwLockReadGuard<'_, V> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<V>(lock: &RwLock<V>) -> std::sync::RwLockWriteGuard<'_, V> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
