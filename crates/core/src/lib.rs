//! Berth core types: the sandbox/service status vocabulary shared by every crate.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Label that marks a pod as a member of a sandbox (value must be `"true"`).
pub const SANDBOX_MEMBER_LABEL: &str = "blimp.customerPod";
/// Label carrying the service name a sandbox pod implements.
pub const SERVICE_NAME_LABEL: &str = "blimp.service";

/// Shown when the platform reports the user's image could not be fetched.
/// Clients match on this text.
pub const IMAGE_PULL_FAILURE_MSG: &str =
    "Failed to pull image. Make sure that the image exists, and that Blimp has access to it.";
/// Shown while an image pull is in flight. Clients match on this text.
pub const IMAGE_PULLING_MSG: &str = "Pulling image";

/// Well-known init container names injected into sandbox pods.
pub mod init_containers {
    pub const COPY_BUSYBOX: &str = "copy-busybox";
    pub const COPY_VCP: &str = "copy-vcp";
    pub const INITIALIZE_VOLUME_FROM_IMAGE: &str = "initialize-volume-from-image";
    pub const WAIT_DEPENDS_ON: &str = "wait-depends-on";
    pub const WAIT_INITIAL_SYNC: &str = "wait-initial-sync";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxPhase {
    DoesNotExist,
    Terminating,
    Running,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServicePhase {
    InitializingVolumes,
    WaitDependsOn,
    WaitSyncBind,
    Pending,
    Running,
    Unhealthy,
    Exited,
    Unknown,
}

impl ServicePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServicePhase::InitializingVolumes => "INITIALIZING_VOLUMES",
            ServicePhase::WaitDependsOn => "WAIT_DEPENDS_ON",
            ServicePhase::WaitSyncBind => "WAIT_SYNC_BIND",
            ServicePhase::Pending => "PENDING",
            ServicePhase::Running => "RUNNING",
            ServicePhase::Unhealthy => "UNHEALTHY",
            ServicePhase::Exited => "EXITED",
            ServicePhase::Unknown => "UNKNOWN",
        }
    }
}

impl SandboxPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxPhase::DoesNotExist => "DOES_NOT_EXIST",
            SandboxPhase::Terminating => "TERMINATING",
            SandboxPhase::Running => "RUNNING",
        }
    }
}

impl fmt::Display for ServicePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl fmt::Display for SandboxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Derived status of one service (pod) in a sandbox. Recomputed on every read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceStatus {
    pub phase: ServicePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub has_started: bool,
}

impl ServiceStatus {
    pub fn new(phase: ServicePhase) -> Self {
        Self { phase, message: None, has_started: false }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn started(mut self, has_started: bool) -> Self {
        self.has_started = has_started;
        self
    }
}

/// Composite status of a sandbox namespace.
///
/// `services` is only populated when `phase` is [`SandboxPhase::Running`];
/// build values through the constructors to keep it that way.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxStatus {
    pub phase: SandboxPhase,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ServiceStatus>,
}

impl SandboxStatus {
    pub fn does_not_exist() -> Self {
        Self { phase: SandboxPhase::DoesNotExist, services: BTreeMap::new() }
    }

    pub fn terminating() -> Self {
        Self { phase: SandboxPhase::Terminating, services: BTreeMap::new() }
    }

    pub fn running(services: BTreeMap<String, ServiceStatus>) -> Self {
        Self { phase: SandboxPhase::Running, services }
    }
}

/// Receiver of "namespace changed" signals raised by the watch loops.
///
/// Implementations must return quickly: the caller is a watch stream that
/// stalls until `notify` returns.
pub trait ChangeSink: Send + Sync {
    fn notify(&self, namespace: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_serialize_with_wire_names() {
        assert_eq!(serde_json::to_string(&ServicePhase::WaitSyncBind).unwrap(), "\"WAIT_SYNC_BIND\"");
        assert_eq!(serde_json::to_string(&SandboxPhase::DoesNotExist).unwrap(), "\"DOES_NOT_EXIST\"");
        assert_eq!(ServicePhase::InitializingVolumes.to_string(), "INITIALIZING_VOLUMES");
    }

    #[test]
    fn non_running_sandbox_omits_services() {
        let v = serde_json::to_value(SandboxStatus::terminating()).unwrap();
        assert_eq!(v, serde_json::json!({ "phase": "TERMINATING" }));
    }

    #[test]
    fn service_status_builder() {
        let s = ServiceStatus::new(ServicePhase::Pending).with_message(IMAGE_PULLING_MSG).started(true);
        assert_eq!(s.message.as_deref(), Some("Pulling image"));
        assert!(s.has_started);
    }
}
