//! In-process messaging for Outpost
//!
//! - [`MessageBus`]: per-tunnel mailboxes with broadcast, unicast and
//!   filtered delivery, plus inbound dispatch to readers
//! - [`EventBus`]: typed publish/subscribe used for admin notifications
//!
//! Both isolate panics in user callbacks: a failing reader or subscriber is
//! logged and never takes down the publisher.

pub mod events;
pub mod mailbox;

pub use events::{EventBus, SubscriptionId};
pub use mailbox::{
    reader_fn, FnReader, Mailbox, MailboxHandle, MailboxId, MailboxReader, MessageBus,
    DEFAULT_MAILBOX_CAPACITY,
};

use outpost_proto::NodeIdentity;
use std::any::Any;

/// Something a mailbox can be addressed by
pub trait Addressable: Clone + Send + Sync + 'static {
    fn address(&self) -> &str;
}

impl Addressable for String {
    fn address(&self) -> &str {
        self
    }
}

/// Nodes are addressed by their per-connection instance id
impl Addressable for NodeIdentity {
    fn address(&self) -> &str {
        &self.instance_id
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
