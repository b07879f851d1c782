//! Message listeners: the observers a node notifies for every message.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::message::{Message, MessageKind};

/// A callback invoked synchronously, on the receiving reader task, for each
/// post-handshake message. Returning an error (or panicking) is logged and
/// does not affect other listeners or the reader.
pub type MessageListener = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as a [`MessageListener`].
pub fn listener<F>(f: F) -> MessageListener
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A listener that only fires for one message kind.
pub fn on_kind<F>(kind: MessageKind, f: F) -> MessageListener
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(move |message: &Message| {
        if message.kind() == kind {
            f(message)
        } else {
            Ok(())
        }
    })
}

/// The set of listeners owned by one node.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<MessageListener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: MessageListener) {
        let mut listeners = self.listeners.write();
        listeners.push(listener);
        debug!("Registered message listener #{}", listeners.len());
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deliver `message` to every listener in registration order. Returns the
    /// number of listeners that failed.
    ///
    /// The list is snapshotted first, so a listener may register further
    /// listeners without deadlocking; those see the next message.
    pub fn notify(&self, message: &Message) -> usize {
        let listeners: Vec<MessageListener> = self.listeners.read().clone();
        let mut failures = 0;

        for (index, listener) in listeners.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| listener(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!("Listener #{index} failed on {}: {e:#}", message.kind());
                }
                Err(_) => {
                    failures += 1;
                    warn!("Listener #{index} panicked on {}", message.kind());
                }
            }
        }
        failures
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
