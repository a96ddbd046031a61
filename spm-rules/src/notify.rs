//! Rule change notifications.
//!
//! At most one [`RuleObserver`] is registered with a [`NotifyHub`] at a time. It is invoked
//! synchronously, on the updating thread, after every successful add, modify or remove. The
//! observer reference is published through an [`ArcSwapOption`]: a notification in flight
//! keeps the observer it loaded alive even if it is unregistered concurrently.

use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use arc_swap::ArcSwapOption;
use futures::Stream;
use parking_lot::Mutex;
use spm_wire::{MatchFlags, Rule};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Remove,
    Modify,
}

/// A rule table change.
#[derive(Debug, Clone)]
pub struct RuleEvent {
    pub kind: ChangeKind,
    /// The predicate flags of `rule`.
    pub flags: MatchFlags,
    /// The new rule content, or the last content of a removed rule.
    pub rule: Arc<Rule>,
    /// The precedence the rule had before a modify.
    pub previous_precedence: Option<u8>,
    /// Whether a modify changed anything besides the precedence.
    pub fields_changed: bool,
}

/// Receives rule table changes.
pub trait RuleObserver: Send + Sync + 'static {
    fn on_event(&self, event: &RuleEvent);
}

impl<F> RuleObserver for F
where
    F: Fn(&RuleEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &RuleEvent) {
        self(event)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("An observer is already registered")]
    AlreadyRegistered,
}

/// Holds the registered observer, if any.
#[derive(Default)]
pub struct NotifyHub {
    current: ArcSwapOption<Box<dyn RuleObserver>>,
    /// Serializes register against register.
    lock: Mutex<()>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `observer`. Fails if one is already registered.
    pub fn register<O: RuleObserver>(&self, observer: O) -> Result<(), RegisterError> {
        let _guard = self.lock.lock();

        if self.current.load().is_some() {
            warn!("Observer registration rejected, slot busy");
            return Err(RegisterError::AlreadyRegistered);
        }

        self.current.store(Some(Arc::new(Box::new(observer))));
        debug!("Observer registered");
        Ok(())
    }

    /// Clears the observer slot. Returns whether an observer was registered.
    pub fn unregister(&self) -> bool {
        let _guard = self.lock.lock();
        let prev = self.current.swap(None);
        debug!(was_registered = prev.is_some(), "Observer unregistered");
        prev.is_some()
    }

    pub fn is_registered(&self) -> bool {
        self.current.load().is_some()
    }

    /// Invokes the current observer with `event`, if one is registered.
    pub fn notify(&self, event: &RuleEvent) {
        if let Some(observer) = self.current.load_full() {
            observer.on_event(event);
        }
    }
}

impl std::fmt::Debug for NotifyHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyHub").field("registered", &self.is_registered()).finish()
    }
}

/// Creates an observer that forwards events into a bounded channel, and the stream that
/// receives them.
pub fn channel(buffer: usize) -> (ChannelObserver, RuleEvents) {
    let (tx, rx) = mpsc::channel(buffer);
    let dropped = Arc::new(AtomicU64::new(0));

    (
        ChannelObserver { tx, dropped: Arc::clone(&dropped) },
        RuleEvents { inner: ReceiverStream::new(rx), dropped },
    )
}

/// An observer that forwards events into a bounded channel. Never blocks the updater: events
/// that don't fit are dropped and counted.
#[derive(Debug)]
pub struct ChannelObserver {
    tx: mpsc::Sender<RuleEvent>,
    dropped: Arc<AtomicU64>,
}

impl RuleObserver for ChannelObserver {
    fn on_event(&self, event: &RuleEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(id = event.rule.id, "Event channel full, dropping rule event");
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// The receiving end of a [`ChannelObserver`].
#[derive(Debug)]
pub struct RuleEvents {
    inner: ReceiverStream<RuleEvent>,
    dropped: Arc<AtomicU64>,
}

impl RuleEvents {
    /// The number of events that could not be delivered.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Stream for RuleEvents {
    type Item = RuleEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
