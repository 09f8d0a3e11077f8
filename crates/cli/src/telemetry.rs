use std::net::SocketAddr;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Crates whose log level `-v` raises; everything else stays at `warn`.
const BERTH_TARGETS: &[&str] = &["berthctl", "berth_api", "berth_kubehub", "berth_registry", "berth_status"];

/// Logging and metrics settings read from `BERTH_LOG` / `BERTH_METRICS_ADDR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telemetry {
    /// Explicit filter; wins over `-v` when set.
    pub log: Option<String>,
    pub metrics_addr: Option<SocketAddr>,
}

impl Telemetry {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log = lookup("BERTH_LOG").filter(|s| !s.is_empty());
        let metrics_addr = match lookup("BERTH_METRICS_ADDR").filter(|s| !s.is_empty()) {
            Some(addr) => Some(addr.parse().with_context(|| format!("BERTH_METRICS_ADDR={addr}: expected host:port"))?),
            None => None,
        };
        Ok(Self { log, metrics_addr })
    }

    /// Kube client chatter stays at `warn`; berth crates log at `info`, or `debug`/`trace` with `-v`/`-vv`.
    pub fn filter_directives(&self, verbose: u8) -> String {
        if let Some(log) = &self.log {
            return log.clone();
        }
        let level = match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        let mut directives = vec!["warn".to_string()];
        directives.extend(BERTH_TARGETS.iter().map(|t| format!("{t}={level}")));
        directives.join(",")
    }

    /// Logs go to stderr so `-o json` output on stdout stays machine-readable.
    pub fn init_tracing(&self, verbose: u8) -> Result<()> {
        let directives = self.filter_directives(verbose);
        let filter = EnvFilter::try_new(&directives).with_context(|| format!("invalid log filter {directives:?}"))?;
        tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
        Ok(())
    }

    pub fn init_metrics(&self) -> Result<()> {
        let Some(addr) = self.metrics_addr else { return Ok(()) };
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .with_context(|| format!("installing Prometheus exporter on {addr}"))?;
        tracing::info!(%addr, "Prometheus metrics exporter listening");
        Ok(())
    }
}
