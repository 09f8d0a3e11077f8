use std::time::Duration;

use berth_core::{SANDBOX_MEMBER_LABEL, SERVICE_NAME_LABEL};
use berth_kubehub::MatchLabels;
use serde::{Deserialize, Serialize};

/// Runtime configuration for [`crate::StatusFetcher`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Pods carrying `<member_label>=true` belong to the sandbox.
    pub member_label: String,
    /// Label whose value names the service a pod implements.
    pub service_label: String,
    /// Deadline for the initial cache sync in `start`; `None` waits forever.
    pub sync_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            member_label: SANDBOX_MEMBER_LABEL.to_string(),
            service_label: SERVICE_NAME_LABEL.to_string(),
            sync_timeout: None,
        }
    }
}

impl Config {
    /// Read `BERTH_*` overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparsable or empty values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = lookup("BERTH_MEMBER_LABEL").filter(|s| !s.is_empty()) {
            cfg.member_label = v;
        }
        if let Some(v) = lookup("BERTH_SERVICE_LABEL").filter(|s| !s.is_empty()) {
            cfg.service_label = v;
        }
        cfg.sync_timeout = lookup("BERTH_SYNC_TIMEOUT_SECS").and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs);
        cfg
    }

    pub fn member_selector(&self) -> MatchLabels {
        MatchLabels::new().with(self.member_label.clone(), "true")
    }
}
