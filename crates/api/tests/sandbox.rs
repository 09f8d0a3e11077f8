#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use berth_api::{Config, SandboxPhase, SandboxStatus, ServicePhase, StatusError, StatusFetcher};
use berth_core::{init_containers, IMAGE_PULL_FAILURE_MSG};
use berth_kubehub::{CacheFeeds, ResourceCache};
use berth_registry::WatchRegistry;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus,
    Event, Namespace, NamespaceStatus, Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::watcher::Event as WatchEvent;

struct Fixture {
    fetcher: StatusFetcher,
    feeds: CacheFeeds,
    registry: WatchRegistry,
}

impl Fixture {
    fn new() -> Self {
        let registry = WatchRegistry::new();
        let (cache, mut feeds) = ResourceCache::new();
        for_each_restart(&mut feeds, &registry);
        let fetcher = StatusFetcher::from_parts(cache, registry.clone(), &Config::default());
        Self { fetcher, feeds, registry }
    }

    fn namespace(&mut self, ns: Namespace) { self.feeds.namespaces.apply(WatchEvent::Applied(ns), &self.registry); }
    fn pod(&mut self, pod: Pod) { self.feeds.pods.apply(WatchEvent::Applied(pod), &self.registry); }
}

fn for_each_restart(feeds: &mut CacheFeeds, registry: &WatchRegistry) {
    feeds.pods.apply(WatchEvent::Restarted(Vec::<Pod>::new()), registry);
    feeds.events.apply(WatchEvent::Restarted(Vec::<Event>::new()), registry);
    feeds.namespaces.apply(WatchEvent::Restarted(Vec::<Namespace>::new()), registry);
}

fn ns(name: &str, phase: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
        status: Some(NamespaceStatus { phase: Some(phase.into()), ..Default::default() }),
        ..Default::default()
    }
}

fn member_pod(name: &str, namespace: &str, service: Option<&str>, main: Vec<ContainerStatus>) -> Pod {
    let mut labels = BTreeMap::from([("blimp.customerPod".to_string(), "true".to_string())]);
    if let Some(s) = service {
        labels.insert("blimp.service".into(), s.into());
    }
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            labels: Some(labels),
            ..Default::default()
        },
        status: Some(PodStatus { container_statuses: Some(main), phase: Some("Pending".into()), ..Default::default() }),
        ..Default::default()
    }
}

fn running_ready(name: &str) -> ContainerStatus {
    ContainerStatus {
        name: name.into(),
        ready: true,
        state: Some(ContainerState { running: Some(ContainerStateRunning::default()), ..Default::default() }),
        ..Default::default()
    }
}

fn waiting(name: &str, reason: &str) -> ContainerStatus {
    ContainerStatus {
        name: name.into(),
        state: Some(ContainerState {
            waiting: Some(ContainerStateWaiting { reason: Some(reason.into()), message: None }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn missing_namespace_does_not_exist() {
    let fx = Fixture::new();
    assert_eq!(fx.fetcher.get("nope").unwrap(), SandboxStatus::does_not_exist());
}

#[tokio::test]
async fn terminating_namespace_hides_pods() {
    let mut fx = Fixture::new();
    fx.namespace(ns("ns1", "Terminating"));
    fx.pod(member_pod("web", "ns1", Some("web"), vec![running_ready("web")]));
    let status = fx.fetcher.get("ns1").unwrap();
    assert_eq!(status.phase, SandboxPhase::Terminating);
    assert!(status.services.is_empty());
}

#[tokio::test]
async fn running_sandbox_keys_services_by_label() {
    let mut fx = Fixture::new();
    fx.namespace(ns("ns1", "Active"));
    fx.pod(member_pod("web-1", "ns1", Some("web"), vec![running_ready("web")]));
    fx.pod(member_pod("db-1", "ns1", Some("db"), vec![waiting("db", "ImagePullBackOff")]));
    fx.pod(member_pod("unlabelled", "ns1", None, vec![running_ready("x")]));
    let mut outsider = member_pod("sys", "ns1", Some("sys"), vec![running_ready("sys")]);
    outsider.metadata.labels.as_mut().unwrap().insert("blimp.customerPod".into(), "false".into());
    fx.pod(outsider);
    fx.pod(member_pod("other", "ns2", Some("other"), vec![running_ready("other")]));

    let status = fx.fetcher.get("ns1").unwrap();
    assert_eq!(status.phase, SandboxPhase::Running);
    assert_eq!(status.services.keys().cloned().collect::<Vec<_>>(), vec!["db", "web"]);
    assert_eq!(status.services["web"].phase, ServicePhase::Running);
    assert!(status.services["web"].has_started);
    assert_eq!(status.services["db"].message.as_deref(), Some(IMAGE_PULL_FAILURE_MSG));
}

#[tokio::test]
async fn init_container_pull_failure_end_to_end() {
    let mut fx = Fixture::new();
    fx.namespace(ns("ns1", "Active"));
    let mut pod = member_pod("web-1", "ns1", Some("web"), vec![waiting("web", "PodInitializing")]);
    let done = ContainerStatus {
        name: init_containers::COPY_BUSYBOX.into(),
        state: Some(ContainerState {
            terminated: Some(ContainerStateTerminated { reason: Some("Completed".into()), ..Default::default() }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let pulling = waiting(init_containers::INITIALIZE_VOLUME_FROM_IMAGE, "ErrImagePull");
    pod.status.as_mut().unwrap().init_container_statuses = Some(vec![done, pulling]);
    fx.pod(pod);

    let status = fx.fetcher.get("ns1").unwrap();
    let web = &status.services["web"];
    assert_eq!(web.phase, ServicePhase::Pending);
    assert!(web.message.as_deref().unwrap().starts_with("Failed to pull image"));
}

#[tokio::test]
async fn unsynced_cache_error_is_wrapped() {
    let (cache, _feeds) = ResourceCache::new();
    let fetcher = StatusFetcher::from_parts(cache, WatchRegistry::new(), &Config::default());
    let err = fetcher.get("ns1").unwrap_err();
    assert!(matches!(err, StatusError::Cache { op: "get sandbox", .. }));
    assert!(err.to_string().starts_with("get sandbox: "));
}

#[tokio::test]
async fn pod_change_wakes_namespace_watcher() {
    let mut fx = Fixture::new();
    fx.namespace(ns("ns1", "Active"));
    let (mut notifier, stop) = fx.fetcher.watch("ns1");
    let (mut other, _other_stop) = fx.fetcher.watch("ns2");

    fx.pod(member_pod("web-1", "ns1", Some("web"), vec![waiting("web", "ContainerCreating")]));
    fx.pod(member_pod("web-1", "ns1", Some("web"), vec![running_ready("web")]));
    assert!(tokio::time::timeout(Duration::from_secs(1), notifier.changed()).await.unwrap());
    assert!(!notifier.try_changed(), "two changes must coalesce into one wake-up");
    assert!(!other.try_changed());
    assert_eq!(fx.fetcher.get("ns1").unwrap().services["web"].phase, ServicePhase::Running);

    stop.stop();
    for _ in 0..100 {
        if fx.registry.subscriber_count("ns1") == 0 { break; }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(fx.registry.subscriber_count("ns1"), 0);
    fx.pod(member_pod("web-1", "ns1", Some("web"), vec![waiting("web", "CrashLoopBackOff")]));
}
