//! Live limits: operator-tunable values read on every decision.
//!
//! Handlers hold a clone and consult it per dispatch step / per version
//! check, so a SIGHUP reload or a status-endpoint update takes effect on
//! the next send without reconnecting anyone.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use morechunks_core::config::LimitsConfig;

#[derive(Clone, Debug)]
pub struct LiveLimits {
    max_chunks_per_second: Arc<AtomicU32>,
    allowed_versions: Arc<RwLock<Option<BTreeSet<String>>>>,
}

impl LiveLimits {
    pub fn new(config: &LimitsConfig) -> Self {
        let limits = Self {
            max_chunks_per_second: Arc::new(AtomicU32::new(config.max_chunks_per_second)),
            allowed_versions: Arc::new(RwLock::new(None)),
        };
        limits.set_allowed_versions(config.allowed_versions.clone());
        limits
    }

    /// Replace every value from a freshly loaded config.
    pub fn apply(&self, config: &LimitsConfig) {
        self.set_max_chunks_per_second(config.max_chunks_per_second);
        self.set_allowed_versions(config.allowed_versions.clone());
    }

    pub fn max_chunks_per_second(&self) -> u32 {
        self.max_chunks_per_second.load(Ordering::Relaxed)
    }

    pub fn set_max_chunks_per_second(&self, rate: u32) {
        self.max_chunks_per_second.store(rate, Ordering::Relaxed);
    }

    /// `None` disables version enforcement.
    pub fn set_allowed_versions(&self, versions: Option<Vec<String>>) {
        let set = versions.map(|v| v.into_iter().collect());
        match self.allowed_versions.write() {
            Ok(mut guard) => *guard = set,
            Err(poisoned) => *poisoned.into_inner() = set,
        }
    }

    pub fn allowed_versions(&self) -> Option<Vec<String>> {
        let guard = self
            .allowed_versions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.as_ref().map(|set| set.iter().cloned().collect())
    }

    /// True when enforcement is off or `version` is on the list.
    pub fn version_allowed(&self, version: &str) -> bool {
        let guard = self
            .allowed_versions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            None => true,
            Some(set) => set.contains(version),
        }
    }
}

impl Default for LiveLimits {
    fn default() -> Self {
        Self::new(&LimitsConfig::default())
    }
}
