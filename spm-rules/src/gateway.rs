use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use spm_wire::{Command, Rule, RuleOutput};
use tracing::{debug, error, warn};

use crate::{
    error::{UpdateError, UpdateOutcome},
    notify::{ChangeKind, NotifyHub, RuleEvent},
    store::{RuleNode, RuleStore},
    DEFAULT_PRECEDENCE,
};

/// The single entry point for rule table mutation.
///
/// At most one update is in flight: a caller that finds another update in progress fails
/// immediately with [`UpdateError::WriterBusy`] instead of waiting.
#[derive(Debug)]
pub struct UpdateGateway {
    store: Arc<RuleStore>,
    hub: Arc<NotifyHub>,
    busy: AtomicBool,
}

/// Releases the writer flag on drop.
struct WriterGuard<'a>(&'a AtomicBool);

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl UpdateGateway {
    pub fn new(store: Arc<RuleStore>, hub: Arc<NotifyHub>) -> Self {
        Self { store, hub, busy: AtomicBool::new(false) }
    }

    /// Applies one add, modify or delete. The observer, if any, is notified before this
    /// returns.
    pub fn apply_update(&self, rule: &Rule) -> Result<UpdateOutcome, UpdateError> {
        let _writer = self.acquire()?;

        let result = match rule.command {
            Command::Add => self.add(rule),
            Command::Delete => self.delete(rule.id),
            Command::Unknown(cmd) => Err(UpdateError::UnknownCommand(cmd)),
        };

        match result {
            Ok(outcome) => debug!(id = rule.id, ?outcome, "Rule update applied"),
            Err(UpdateError::AllocFailed(what)) => {
                error!(id = rule.id, ?what, "Rule update failed, out of memory")
            }
            Err(ref e) => warn!(id = rule.id, "Rule update rejected: {e}"),
        }

        result
    }

    /// Decodes one admin payload and applies it. An empty payload fails with
    /// [`UpdateError::NullRule`].
    pub fn apply_encoded(&self, mut payload: &[u8]) -> Result<UpdateOutcome, UpdateError> {
        match Rule::decode(&mut payload)? {
            Some(rule) => self.apply_update(&rule),
            None => {
                warn!("Rule update carries no rule");
                Err(UpdateError::NullRule)
            }
        }
    }

    /// Empties the table. Not serialized against [`Self::apply_update`] by the writer flag.
    pub fn flush(&self) -> Result<usize, UpdateError> {
        match self.store.flush() {
            Ok(count) => {
                debug!(count, "Rule table flushed");
                Ok(count)
            }
            Err(e) => {
                warn!("Rule table flush skipped: {e}");
                Err(e)
            }
        }
    }

    fn acquire(&self) -> Result<WriterGuard<'_>, UpdateError> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| WriterGuard(&self.busy))
            .map_err(|_| UpdateError::WriterBusy)
    }

    fn add(&self, rule: &Rule) -> Result<UpdateOutcome, UpdateError> {
        if self.store.is_full_for(rule.id) {
            return Err(UpdateError::TableFull { capacity: self.store.capacity() });
        }

        let output = RuleOutput::try_from(rule.inner.output).map_err(UpdateError::InvalidOutput)?;

        if rule.precedence == DEFAULT_PRECEDENCE && !self.store.load().bucket(0).is_empty() {
            warn!(id = rule.id, "Default precedence shares bucket 0 with existing rules");
        }

        let node = Arc::new(RuleNode::new(*rule, output));
        let prev = self.store.insert(Arc::clone(&node))?;

        let event = match prev {
            None => RuleEvent {
                kind: ChangeKind::Add,
                flags: node.inner.flags,
                rule: Arc::clone(node.rule()),
                previous_precedence: None,
                fields_changed: false,
            },
            Some(ref prev) => RuleEvent {
                kind: ChangeKind::Modify,
                flags: node.inner.flags,
                rule: Arc::clone(node.rule()),
                previous_precedence: Some(prev.precedence),
                fields_changed: prev.inner != node.inner,
            },
        };
        self.hub.notify(&event);

        Ok(if prev.is_some() { UpdateOutcome::Modified } else { UpdateOutcome::Added })
    }

    fn delete(&self, id: u32) -> Result<UpdateOutcome, UpdateError> {
        let node = self.store.remove(id)?;

        self.hub.notify(&RuleEvent {
            kind: ChangeKind::Remove,
            flags: node.inner.flags,
            rule: Arc::clone(node.rule()),
            previous_precedence: None,
            fields_changed: false,
        });

        Ok(UpdateOutcome::Deleted)
    }
}
