//! Berth status classifier: maps one pod (plus its namespace's events) to a
//! [`ServiceStatus`].
//!
//! Classification is an ordered list of rules. Each rule either answers or
//! passes; the first answer wins and nothing is merged across rules.

#![forbid(unsafe_code)]

use std::borrow::Borrow;

use berth_core::{init_containers, ServicePhase, ServiceStatus, IMAGE_PULLING_MSG, IMAGE_PULL_FAILURE_MSG};
use k8s_openapi::api::core::v1::{ContainerStatus, Event, Pod};
use tracing::trace;

pub mod pull;

pub use pull::{is_pulling, PullTarget, PullWindow};

/// Source of "is this container slot currently pulling its image" answers.
pub trait PullHistory {
    fn is_pulling(&self, target: PullTarget<'_>) -> bool;
}

/// [`PullHistory`] over a cached event list.
pub struct EventLog<'a, E> {
    events: &'a [E],
}

impl<'a, E: Borrow<Event>> EventLog<'a, E> {
    pub fn new(events: &'a [E]) -> Self { Self { events } }
}

impl<E: Borrow<Event>> PullHistory for EventLog<'_, E> {
    fn is_pulling(&self, target: PullTarget<'_>) -> bool {
        pull::is_pulling(self.events, target)
    }
}

type Rule = fn(&Pod, &dyn PullHistory) -> Option<ServiceStatus>;

const RULES: [(&str, Rule); 3] = [
    ("init-containers", init_container_rule),
    ("main-container", main_container_rule),
    ("pod-phase", pod_phase_rule),
];

/// Classify `pod` against the events cached for its namespace.
pub fn classify<E: Borrow<Event>>(pod: &Pod, events: &[E]) -> ServiceStatus {
    classify_with(pod, &EventLog::new(events))
}

pub fn classify_with(pod: &Pod, pulls: &dyn PullHistory) -> ServiceStatus {
    for (name, rule) in RULES.iter() {
        if let Some(status) = rule(pod, pulls) {
            trace!(rule = %name, pod = ?pod.metadata.name, phase = %status.phase, "classified");
            return status;
        }
    }
    // pod_phase_rule always answers
    ServiceStatus::new(ServicePhase::Unknown)
}

/// Phase reported while a known init container is still blocking boot.
pub fn init_container_phase(name: &str) -> ServicePhase {
    match name {
        init_containers::COPY_BUSYBOX | init_containers::COPY_VCP | init_containers::INITIALIZE_VOLUME_FROM_IMAGE => {
            ServicePhase::InitializingVolumes
        }
        init_containers::WAIT_DEPENDS_ON => ServicePhase::WaitDependsOn,
        init_containers::WAIT_INITIAL_SYNC => ServicePhase::WaitSyncBind,
        _ => ServicePhase::Unknown,
    }
}

pub fn is_image_pull_failure(cs: &ContainerStatus) -> bool {
    let reason = cs.state.as_ref().and_then(|s| s.waiting.as_ref()).and_then(|w| w.reason.as_deref());
    matches!(reason, Some("ErrImagePull") | Some("ImagePullBackOff"))
}

fn pod_ref(pod: &Pod) -> (&str, &str) {
    (pod.metadata.namespace.as_deref().unwrap_or_default(), pod.metadata.name.as_deref().unwrap_or_default())
}

/// First init container that has not completed decides the status.
/// Later init containers are not looked at.
fn init_container_rule(pod: &Pod, pulls: &dyn PullHistory) -> Option<ServiceStatus> {
    let statuses = pod.status.as_ref()?.init_container_statuses.as_deref()?;
    let (namespace, pod_name) = pod_ref(pod);
    for c in statuses {
        let phase = init_container_phase(&c.name);
        if let Some(t) = c.state.as_ref().and_then(|s| s.terminated.as_ref()) {
            if t.reason.as_deref() == Some("Completed") {
                continue;
            }
            let msg = format!("Unexpected system error: {}", t.message.as_deref().unwrap_or_default());
            return Some(ServiceStatus::new(phase).with_message(msg));
        }

        // This one runs the user's image, so its pull problems are the user's.
        if c.name == init_containers::INITIALIZE_VOLUME_FROM_IMAGE {
            if is_image_pull_failure(c) {
                return Some(ServiceStatus::new(ServicePhase::Pending).with_message(IMAGE_PULL_FAILURE_MSG));
            }
            let field_path = pull::init_container_field_path(&c.name);
            if pulls.is_pulling(PullTarget { namespace, pod: pod_name, field_path: &field_path }) {
                return Some(ServiceStatus::new(ServicePhase::Pending).with_message(IMAGE_PULLING_MSG));
            }
        }
        return Some(ServiceStatus::new(phase));
    }
    None
}

/// Detailed status when the pod runs exactly one main container.
fn main_container_rule(pod: &Pod, pulls: &dyn PullHistory) -> Option<ServiceStatus> {
    let [cs] = pod.status.as_ref()?.container_statuses.as_deref()? else { return None; };
    let state = cs.state.as_ref()?;
    if state.running.is_some() {
        let phase = if cs.ready { ServicePhase::Running } else { ServicePhase::Unhealthy };
        return Some(ServiceStatus::new(phase).started(true));
    }
    if let Some(waiting) = state.waiting.as_ref() {
        if is_image_pull_failure(cs) {
            return Some(ServiceStatus::new(ServicePhase::Pending).with_message(IMAGE_PULL_FAILURE_MSG));
        }
        let restarted = cs.restart_count > 0;
        let (namespace, pod_name) = pod_ref(pod);
        let field_path = pull::container_field_path(&cs.name);
        let mut status = ServiceStatus::new(ServicePhase::Pending).started(restarted);
        if pulls.is_pulling(PullTarget { namespace, pod: pod_name, field_path: &field_path }) {
            status.message = Some(IMAGE_PULLING_MSG.to_string());
        } else {
            status.message = waiting.message.clone();
        }
        return Some(status);
    }
    if let Some(terminated) = state.terminated.as_ref() {
        let mut status = ServiceStatus::new(ServicePhase::Exited).started(true);
        status.message = terminated.message.clone();
        return Some(status);
    }
    None
}

fn pod_phase_rule(pod: &Pod, _pulls: &dyn PullHistory) -> Option<ServiceStatus> {
    let phase = match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Running") => ServicePhase::Running,
        Some("Pending") => ServicePhase::Pending,
        Some("Succeeded") | Some("Failed") => ServicePhase::Exited,
        _ => ServicePhase::Unknown,
    };
    Some(ServiceStatus::new(phase))
}
