//! Berth public API façade (in-process).
//!
//! [`StatusFetcher`] ties the watched cache, the classifier and the watch
//! registry together: `get` answers from the local cache, `watch` hands out
//! coalesced change wake-ups, `start` brings the watch streams up.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use berth_kubehub::{CacheError, ResourceCache, WatchTasks};
use berth_registry::{Notifier, StopHandle, WatchRegistry};
use metrics::histogram;
use tracing::{debug, info};

mod config;
mod sandbox;

pub use berth_core::{SandboxPhase, SandboxStatus, ServicePhase, ServiceStatus};
pub use config::Config;
pub use sandbox::SandboxAggregator;

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("{op}: {source}")]
    Cache {
        op: &'static str,
        #[source]
        source: CacheError,
    },
    #[error("initial cache sync did not complete within {0:?}")]
    SyncTimeout(Duration),
}

impl StatusError {
    pub(crate) fn cache(op: &'static str, source: CacheError) -> Self {
        StatusError::Cache { op, source }
    }
}

pub type StatusResult<T> = Result<T, StatusError>;

pub struct StatusFetcher {
    aggregator: SandboxAggregator,
    registry: WatchRegistry,
    /// Watch loops started by [`StatusFetcher::start`]; dropping aborts them.
    _tasks: Option<WatchTasks>,
}

impl StatusFetcher {
    /// Assemble a fetcher over an existing cache and registry. The caller is
    /// responsible for feeding the cache and routing its changes to `registry`.
    pub fn from_parts(cache: ResourceCache, registry: WatchRegistry, config: &Config) -> Self {
        Self { aggregator: SandboxAggregator::new(cache, config), registry, _tasks: None }
    }

    /// Start the pod, event and namespace watches and wait for their initial listing.
    pub async fn start(client: kube::Client, config: Config) -> StatusResult<Self> {
        let t0 = Instant::now();
        info!(member_label = %config.member_label, service_label = %config.service_label, "status fetcher starting");
        let registry = WatchRegistry::new();
        let (cache, feeds) = ResourceCache::new();
        let tasks = feeds.spawn(client, Arc::new(registry.clone()));

        let synced = cache.wait_until_synced();
        let res = match config.sync_timeout {
            Some(limit) => tokio::time::timeout(limit, synced).await.map_err(|_| StatusError::SyncTimeout(limit))?,
            None => synced.await,
        };
        res.map_err(|e| StatusError::cache("start", e))?;
        info!(took_ms = %t0.elapsed().as_millis(), "status caches synced");

        let mut me = Self::from_parts(cache, registry, &config);
        me._tasks = Some(tasks);
        Ok(me)
    }

    /// Current status of the sandbox in `namespace`, computed fresh.
    pub fn get(&self, namespace: &str) -> StatusResult<SandboxStatus> {
        let t0 = Instant::now();
        let res = self.aggregator.get(namespace);
        histogram!("status_get_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(s) => debug!(ns = %namespace, phase = %s.phase, services = s.services.len(), "get ok"),
            Err(e) => debug!(ns = %namespace, error = %e, "get failed"),
        }
        res
    }

    /// Subscribe to changes in `namespace`. Re-`get` after every wake-up.
    pub fn watch(&self, namespace: &str) -> (Notifier, StopHandle) {
        self.registry.watch(namespace)
    }
}
