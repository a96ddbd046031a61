use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use spm_rules::{RuleDb, UpdateError};
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, BridgeOptions, Frame, HookPoint, Skip, Verdict};

/// The runtime on/off switch for service prioritization.
///
/// Starts disabled. Enabling flushes the rule table and attaches a [`Bridge`]; disabling
/// detaches it. Frames processed while disabled pass through untouched.
#[derive(Debug)]
pub struct Service {
    db: Arc<RuleDb>,
    options: BridgeOptions,
    bridge: ArcSwapOption<Bridge>,
    /// Serializes state transitions.
    lock: Mutex<()>,
}

impl Service {
    pub fn new(db: Arc<RuleDb>, options: BridgeOptions) -> Self {
        Self { db, options, bridge: ArcSwapOption::empty(), lock: Mutex::new(()) }
    }

    pub fn db(&self) -> &Arc<RuleDb> {
        &self.db
    }

    pub fn is_enabled(&self) -> bool {
        self.bridge.load().is_some()
    }

    /// Switches the service on or off. Returns false, and does nothing, if it is already in the
    /// requested state.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        let _guard = self.lock.lock();

        if enabled == self.is_enabled() {
            warn!(enabled, "Service already in requested state");
            return false;
        }

        if enabled {
            match self.db.flush() {
                Ok(count) => debug!(count, "Flushed rule table before enabling"),
                Err(UpdateError::TableEmpty) => {}
                Err(e) => warn!("Rule table flush failed: {e}"),
            }

            self.bridge.store(Some(Arc::new(Bridge::new(Arc::clone(&self.db), self.options))));
            info!(options = ?self.options, "Service prioritization enabled");
        } else {
            self.bridge.store(None);
            info!("Service prioritization disabled");
        }

        true
    }

    pub fn enable(&self) -> bool {
        self.set_enabled(true)
    }

    pub fn disable(&self) -> bool {
        self.set_enabled(false)
    }

    /// Runs the attached bridge hook over `frame`, if the service is enabled.
    pub fn process(&self, hook: HookPoint, frame: &mut Frame<'_>) -> Verdict {
        match &*self.bridge.load() {
            Some(bridge) => bridge.process(hook, frame),
            None => Verdict::Skipped(Skip::HookDisabled),
        }
    }

    /// Renders the current rule table.
    pub fn dump(&self) -> String {
        self.db.snapshot().to_string()
    }
}
