use std::sync::Arc;

use spm_wire::{LatencyParams, Packet, Rule};
use tracing::debug;

use crate::{
    error::{UpdateError, UpdateOutcome},
    gateway::UpdateGateway,
    notify::{NotifyHub, RegisterError, RuleObserver},
    store::{RuleNode, RuleStore, Scan, TableSnapshot},
    TableOptions, MAX_RULES,
};

/// A service prioritization rule database: the rule table, its update gateway and the
/// observer slot. The table starts empty and is flushed when the database is dropped.
///
/// All methods take `&self`; share the database across threads with an [`Arc`].
#[derive(Debug)]
pub struct RuleDb {
    store: Arc<RuleStore>,
    hub: Arc<NotifyHub>,
    gateway: UpdateGateway,
    options: TableOptions,
}

impl Default for RuleDb {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleDb {
    pub fn new() -> Self {
        Self::with_options(TableOptions::default())
    }

    pub fn with_options(options: TableOptions) -> Self {
        let options = TableOptions { capacity: options.capacity.min(MAX_RULES), ..options };
        let store = Arc::new(RuleStore::new(options.capacity));
        let hub = Arc::new(NotifyHub::new());
        let gateway = UpdateGateway::new(Arc::clone(&store), Arc::clone(&hub));

        debug!(capacity = options.capacity, "Rule database initialized");
        Self { store, hub, gateway, options }
    }

    pub fn options(&self) -> &TableOptions {
        &self.options
    }

    /// Marks `packet` with its priority. Lock-free and allocation-free.
    #[inline]
    pub fn apply(&self, packet: &mut Packet) {
        self.store.load().apply(packet, self.options.default_priority);
    }

    /// The priority `packet` would be marked with.
    #[inline]
    pub fn classify(&self, packet: &Packet) -> u32 {
        self.store.load().classify(packet, self.options.default_priority)
    }

    /// The latency parameters of the rule `packet` matches, or [`LatencyParams::INVALID`].
    #[inline]
    pub fn latency_params(&self, packet: &Packet) -> LatencyParams {
        self.store.load().latency_params(packet)
    }

    pub fn apply_update(&self, rule: &Rule) -> Result<UpdateOutcome, UpdateError> {
        self.gateway.apply_update(rule)
    }

    pub fn apply_encoded(&self, payload: &[u8]) -> Result<UpdateOutcome, UpdateError> {
        self.gateway.apply_encoded(payload)
    }

    /// Removes every rule. Fails with [`UpdateError::TableEmpty`] if there is nothing to remove.
    pub fn flush(&self) -> Result<usize, UpdateError> {
        self.gateway.flush()
    }

    pub fn lookup(&self, id: u32) -> Option<Arc<RuleNode>> {
        self.store.lookup(id)
    }

    /// A consistent snapshot of the table, for enumeration and printing.
    pub fn snapshot(&self) -> Arc<TableSnapshot> {
        self.store.snapshot()
    }

    /// Iterates one consistent snapshot of the table, highest precedence first.
    pub fn scan(&self) -> Scan {
        self.store.scan_by_precedence_desc()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn register<O: RuleObserver>(&self, observer: O) -> Result<(), RegisterError> {
        self.hub.register(observer)
    }

    pub fn unregister(&self) -> bool {
        self.hub.unregister()
    }
}

impl Drop for RuleDb {
    fn drop(&mut self) {
        if let Ok(count) = self.store.flush() {
            debug!(count, "Rule database dropped, table flushed");
        }
    }
}
