//! Image pull detection from the namespace's event history.

use std::borrow::Borrow;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Event;

const REASON_PULLING: &str = "Pulling";
const REASON_PULLED: &str = "Pulled";

/// Event field path naming an init container slot.
pub fn init_container_field_path(name: &str) -> String {
    format!("spec.initContainers{{{}}}", name)
}

/// Event field path naming a main container slot.
pub fn container_field_path(name: &str) -> String {
    format!("spec.containers{{{}}}", name)
}

/// Container slot whose pulls are tracked.
#[derive(Debug, Clone, Copy)]
pub struct PullTarget<'a> {
    pub namespace: &'a str,
    pub pod: &'a str,
    pub field_path: &'a str,
}

impl PullTarget<'_> {
    fn matches(&self, ev: &Event) -> bool {
        let o = &ev.involved_object;
        o.kind.as_deref() == Some("Pod")
            && o.namespace.as_deref() == Some(self.namespace)
            && o.name.as_deref() == Some(self.pod)
            && o.field_path.as_deref() == Some(self.field_path)
    }
}

/// Latest pull start and completion seen for one container slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullWindow {
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
}

impl PullWindow {
    pub fn scan<E: Borrow<Event>>(events: &[E], target: PullTarget<'_>) -> Self {
        let mut w = PullWindow::default();
        for ev in events.iter().map(Borrow::borrow) {
            if !target.matches(ev) { continue; }
            let Some(at) = event_time(ev) else { continue; };
            let slot = match ev.reason.as_deref() {
                Some(REASON_PULLING) => &mut w.started,
                Some(REASON_PULLED) => &mut w.completed,
                _ => continue,
            };
            if slot.map_or(true, |prev| prev < at) {
                *slot = Some(at);
            }
        }
        w
    }

    /// A pull is in flight when one started and none completed after it.
    pub fn in_progress(&self) -> bool {
        match (self.started, self.completed) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(started), Some(completed)) => completed < started,
        }
    }
}

pub fn is_pulling<E: Borrow<Event>>(events: &[E], target: PullTarget<'_>) -> bool {
    PullWindow::scan(events, target).in_progress()
}

/// `lastTimestamp`, then `eventTime`, then `firstTimestamp`.
fn event_time(ev: &Event) -> Option<DateTime<Utc>> {
    ev.last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| ev.event_time.as_ref().map(|t| t.0))
        .or_else(|| ev.first_timestamp.as_ref().map(|t| t.0))
}
