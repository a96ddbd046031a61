//! Service prioritization rule engine.
//!
//! A [`RuleDb`] owns a precedence-ordered table of classification rules. The per-packet path
//! ([`RuleDb::apply`]) walks a lock-free snapshot of the table and marks the packet with the
//! priority of the first matching rule. Table updates go through a single-writer gateway and
//! are reported to at most one registered [`RuleObserver`].

mod db;
mod engine;
pub mod error;
mod gateway;
mod matcher;
pub mod notify;
pub mod store;

pub use db::RuleDb;
pub use error::{ResultCode, UpdateError, UpdateOutcome};
pub use gateway::UpdateGateway;
pub use matcher::rule_matches;
pub use notify::{ChangeKind, NotifyHub, RegisterError, RuleEvent, RuleObserver};
pub use store::{RuleNode, RuleStore, TableSnapshot};

/// The number of precedence buckets (0 to 254).
pub const PRECEDENCE_LEVELS: usize = 255;

/// The "default" precedence sentinel. Rules carrying it are stored at precedence 0.
pub const DEFAULT_PRECEDENCE: u8 = 255;

/// The maximum number of live rules.
pub const MAX_RULES: usize = 255;

/// The priority assigned to non-IP packets that no rule derives a priority for.
pub const DEFAULT_PRIORITY: u8 = 0;

/// Options for a rule table.
#[derive(Debug, Clone, Copy)]
pub struct TableOptions {
    /// The maximum number of live rules. Clamped to [`MAX_RULES`] by the builder and by the
    /// store.
    pub capacity: usize,
    /// The fallback priority for packets without a DSCP-bearing header.
    pub default_priority: u8,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self { capacity: MAX_RULES, default_priority: DEFAULT_PRIORITY }
    }
}

impl TableOptions {
    /// Sets the maximum number of live rules. Values above [`MAX_RULES`] are clamped.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.min(MAX_RULES);
        self
    }

    pub fn default_priority(mut self, priority: u8) -> Self {
        self.default_priority = priority;
        self
    }
}
