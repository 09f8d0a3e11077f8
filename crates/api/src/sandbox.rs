//! Sandbox aggregation: namespace lookup + member pods -> [`SandboxStatus`].

use std::collections::BTreeMap;

use berth_core::SandboxStatus;
use berth_kubehub::{MatchLabels, ResourceCache};
use k8s_openapi::api::core::v1::Namespace;
use tracing::{debug, warn};

use crate::{Config, StatusError};

const NAMESPACE_TERMINATING: &str = "Terminating";

pub struct SandboxAggregator {
    cache: ResourceCache,
    member: MatchLabels,
    service_label: String,
}

impl SandboxAggregator {
    pub fn new(cache: ResourceCache, config: &Config) -> Self {
        Self { cache, member: config.member_selector(), service_label: config.service_label.clone() }
    }

    /// Build a fresh status from the cache. Never blocks on the watch streams.
    pub fn get(&self, namespace: &str) -> Result<SandboxStatus, StatusError> {
        let Some(ns) = self.cache.get_namespace(namespace).map_err(|e| StatusError::cache("get sandbox", e))? else {
            return Ok(SandboxStatus::does_not_exist());
        };
        if is_terminating(&ns) {
            return Ok(SandboxStatus::terminating());
        }

        let mut pods = self.cache.list_pods(namespace, &self.member).map_err(|e| StatusError::cache("get services", e))?;
        // Name order makes duplicate service labels resolve the same way every time.
        pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        let events = self.cache.list_events(namespace).unwrap_or_else(|e| {
            warn!(ns = %namespace, error = %e, "failed to get events; pull detection disabled");
            Vec::new()
        });

        let mut services = BTreeMap::new();
        for pod in &pods {
            let Some(service) = pod.metadata.labels.as_ref().and_then(|l| l.get(&self.service_label)) else {
                debug!(ns = %namespace, pod = ?pod.metadata.name, label = %self.service_label, "member pod without service label; skipping");
                continue;
            };
            services.insert(service.clone(), berth_status::classify(pod, &events));
        }
        Ok(SandboxStatus::running(services))
    }
}

fn is_terminating(ns: &Namespace) -> bool {
    ns.status.as_ref().and_then(|s| s.phase.as_deref()) == Some(NAMESPACE_TERMINATING)
}
