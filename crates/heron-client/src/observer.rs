// Observer registries for consumer and producer events.
use bytes::Bytes;
use heron_wire::{AuthResponse, MessageId};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::RwLock;
use std::time::Duration;

use crate::backoff::BackoffMode;
use crate::{Error, Message, PeerAddress};

type Slot<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Callbacks for one event type, invoked in registration order.
///
/// A panicking callback is caught and logged; later callbacks still run.
///
/// ```
/// use heron_client::Signal;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let signal: Signal<u32> = Signal::new("example");
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = seen.clone();
/// signal.connect(move |value| {
///     counter.fetch_add(*value as usize, Ordering::SeqCst);
/// });
/// signal.emit(&3);
/// assert_eq!(seen.load(Ordering::SeqCst), 3);
/// ```
pub struct Signal<T> {
    name: &'static str,
    slots: RwLock<Vec<Slot<T>>>,
}

impl<T> Signal<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: RwLock::new(Vec::new()),
        }
    }

    pub fn connect<F>(&self, callback: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut slots = self
            .slots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.push(Box::new(callback));
    }

    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn emit(&self, value: &T) {
        let slots = self
            .slots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (index, slot) in slots.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| slot(value))).is_err() {
                tracing::warn!(signal = self.name, index, "observer panicked");
            }
        }
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("slots", &self.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub addr: PeerAddress,
    pub payload: Bytes,
}

#[derive(Debug)]
pub struct ErrorEvent {
    pub addr: PeerAddress,
    pub error: Error,
}

/// A handler returned an error for `message`; it is requeued with backoff.
#[derive(Debug)]
pub struct ExceptionEvent {
    pub message: Message,
    pub error: anyhow::Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeueEvent {
    pub id: MessageId,
    pub delay: Duration,
    pub backoff: bool,
}

#[derive(Debug, Clone)]
pub struct AuthEvent {
    pub addr: PeerAddress,
    pub response: AuthResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffEvent {
    pub mode: BackoffMode,
    pub level: u32,
}

/// Every event a consumer reports.
#[derive(Debug)]
pub struct Observers {
    pub message: Signal<Message>,
    pub response: Signal<ResponseEvent>,
    pub error: Signal<ErrorEvent>,
    pub giving_up: Signal<Message>,
    pub exception: Signal<ExceptionEvent>,
    pub finish: Signal<MessageId>,
    pub requeue: Signal<RequeueEvent>,
    pub auth: Signal<AuthEvent>,
    pub backoff: Signal<BackoffEvent>,
    pub close: Signal<()>,
}

impl Default for Observers {
    fn default() -> Self {
        Self {
            message: Signal::new("message"),
            response: Signal::new("response"),
            error: Signal::new("error"),
            giving_up: Signal::new("giving_up"),
            exception: Signal::new("exception"),
            finish: Signal::new("finish"),
            requeue: Signal::new("requeue"),
            auth: Signal::new("auth"),
            backoff: Signal::new("backoff"),
            close: Signal::new("close"),
        }
    }
}
