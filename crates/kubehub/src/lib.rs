//! Berth kubehub: list+watch wiring for pods, events and namespaces.
//!
//! Each kind gets a reflector store read synchronously by callers, and a feed
//! that a background watch loop drives. Every applied pod or namespace change
//! is turned into a [`ChangeSink::notify`] for the namespace it belongs to.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Debug};
use std::sync::{Arc, PoisonError, RwLock};

use berth_core::ChangeSink;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event, Namespace, Pod};
use kube::{
    api::Api,
    runtime::{
        reflector::{self, ObjectRef, Store},
        watcher::{self, watcher},
        WatchStreamExt,
    },
    Client, Resource,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Metric names emitted by the watch loops.
pub mod metric {
    /// Watch events applied, labelled by kind.
    pub const EVENTS_TOTAL: &str = "kubehub_events_total";
    /// Pod or namespace changes dropped because the object had no scope.
    pub const EVENTS_DROPPED_TOTAL: &str = "kubehub_events_dropped_total";
    /// Errors surfaced by a watch stream; the stream retries with backoff.
    pub const WATCH_ERRORS_TOTAL: &str = "kubehub_watch_errors_total";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Pods,
    Events,
    Namespaces,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Pods => "pods",
            CacheKind::Events => "events",
            CacheKind::Namespaces => "namespaces",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("{0} cache has not completed its initial listing")]
    NotSynced(CacheKind),
    #[error("{0} watch ended before its initial listing completed")]
    FeedClosed(CacheKind),
}

/// Which namespace's subscribers hear about a change to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeScope<'a> {
    Namespace(&'a str),
    /// This kind never raises notifications.
    Untracked,
    /// The object lacks the field its scope is read from.
    Missing(&'static str),
}

/// A resource kind the cache watches.
pub trait Watched: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static {
    const KIND: CacheKind;
    fn change_scope(&self) -> ChangeScope<'_>;
}

impl Watched for Pod {
    const KIND: CacheKind = CacheKind::Pods;
    fn change_scope(&self) -> ChangeScope<'_> {
        match self.metadata.namespace.as_deref() {
            Some(ns) => ChangeScope::Namespace(ns),
            None => ChangeScope::Missing("metadata.namespace"),
        }
    }
}

impl Watched for Namespace {
    const KIND: CacheKind = CacheKind::Namespaces;
    fn change_scope(&self) -> ChangeScope<'_> {
        match self.metadata.name.as_deref() {
            Some(name) => ChangeScope::Namespace(name),
            None => ChangeScope::Missing("metadata.name"),
        }
    }
}

impl Watched for Event {
    const KIND: CacheKind = CacheKind::Events;
    fn change_scope(&self) -> ChangeScope<'_> { ChangeScope::Untracked }
}

/// Equality-based label selector (`k1=v1,k2=v2`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchLabels(BTreeMap<String, String>);

impl MatchLabels {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Empty selectors match everything.
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.0.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }
}

impl fmt::Display for MatchLabels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first { f.write_str(",")?; }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

/// namespace -> names of the cached objects in it.
#[derive(Default)]
struct NamespaceIndex(RwLock<HashMap<String, BTreeSet<String>>>);

impl NamespaceIndex {
    fn names(&self, namespace: &str) -> Vec<String> {
        let map = self.0.read().unwrap_or_else(PoisonError::into_inner);
        map.get(namespace).map(|names| names.iter().cloned().collect()).unwrap_or_default()
    }

    fn apply<K: Watched>(&self, event: &watcher::Event<K>) {
        let mut map = self.0.write().unwrap_or_else(PoisonError::into_inner);
        match event {
            watcher::Event::Applied(obj) => {
                if let Some((ns, name)) = namespaced_name(obj) {
                    map.entry(ns.to_string()).or_default().insert(name.to_string());
                }
            }
            watcher::Event::Deleted(obj) => {
                if let Some((ns, name)) = namespaced_name(obj) {
                    if let Some(names) = map.get_mut(ns) {
                        names.remove(name);
                        if names.is_empty() {
                            map.remove(ns);
                        }
                    }
                }
            }
            watcher::Event::Restarted(list) => {
                map.clear();
                for (ns, name) in list.iter().filter_map(namespaced_name) {
                    map.entry(ns.to_string()).or_default().insert(name.to_string());
                }
            }
        }
    }
}

fn namespaced_name<K: Watched>(obj: &K) -> Option<(&str, &str)> {
    let meta = obj.meta();
    Some((meta.namespace.as_deref()?, meta.name.as_deref()?))
}

/// Read side of one watched kind.
pub struct KindCache<K: Watched> {
    store: Store<K>,
    index: Arc<NamespaceIndex>,
    synced: watch::Receiver<bool>,
}

impl<K: Watched> Clone for KindCache<K> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), index: Arc::clone(&self.index), synced: self.synced.clone() }
    }
}

impl<K: Watched> KindCache<K> {
    pub fn is_synced(&self) -> bool { *self.synced.borrow() }

    fn synced_store(&self) -> Result<&Store<K>, CacheError> {
        if self.is_synced() { Ok(&self.store) } else { Err(CacheError::NotSynced(K::KIND)) }
    }

    /// Objects in `namespace`, ordered by name. Cost scales with the namespace, not the cluster.
    pub fn list_in(&self, namespace: &str) -> Result<Vec<Arc<K>>, CacheError> {
        let store = self.synced_store()?;
        let objects = self
            .index
            .names(namespace)
            .iter()
            .filter_map(|name| store.get(&ObjectRef::new(name).within(namespace)))
            .collect();
        Ok(objects)
    }

    pub async fn wait_until_synced(&self) -> Result<(), CacheError> {
        let mut rx = self.synced.clone();
        let res = rx.wait_for(|synced| *synced).await.map(|_| ());
        res.map_err(|_| CacheError::FeedClosed(K::KIND))
    }
}

/// Write side of one watched kind, owned by its watch loop.
pub struct KindFeed<K: Watched> {
    writer: reflector::store::Writer<K>,
    reader: Store<K>,
    index: Arc<NamespaceIndex>,
    synced: watch::Sender<bool>,
}

fn kind_pair<K: Watched>() -> (KindCache<K>, KindFeed<K>) {
    let (store, writer) = reflector::store::<K>();
    let (synced_tx, synced_rx) = watch::channel(false);
    let index = Arc::new(NamespaceIndex::default());
    (
        KindCache { store: store.clone(), index: Arc::clone(&index), synced: synced_rx },
        KindFeed { writer, reader: store, index, synced: synced_tx },
    )
}

impl<K: Watched> KindFeed<K> {
    /// Apply one watch event to the store, then notify every namespace it touched.
    ///
    /// A full relist notifies namespaces present before and after it, so
    /// deletions missed while disconnected still wake subscribers. Objects
    /// without a usable scope are logged and dropped.
    pub fn apply(&mut self, event: watcher::Event<K>, sink: &dyn ChangeSink) {
        counter!(metric::EVENTS_TOTAL, 1u64, "kind" => K::KIND.as_str());
        let mut touched = BTreeSet::new();
        match &event {
            watcher::Event::Applied(obj) | watcher::Event::Deleted(obj) => collect_scope(obj, &mut touched),
            watcher::Event::Restarted(list) => {
                debug!(kind = %K::KIND, count = list.len(), "watch restart");
                for obj in self.reader.state().iter() {
                    collect_scope(obj.as_ref(), &mut touched);
                }
                for obj in list {
                    collect_scope(obj, &mut touched);
                }
            }
        }
        self.writer.apply_watcher_event(&event);
        self.index.apply(&event);
        if matches!(event, watcher::Event::Restarted(_)) && !*self.synced.borrow() {
            info!(kind = %K::KIND, "initial listing complete");
            self.synced.send_replace(true);
        }
        for ns in touched {
            sink.notify(&ns);
        }
    }

    /// Drive the list+watch stream for this kind until it ends.
    pub async fn run(mut self, api: Api<K>, sink: Arc<dyn ChangeSink>) {
        let stream = watcher(api, watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);
        info!(kind = %K::KIND, "watcher started");
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => self.apply(event, sink.as_ref()),
                Err(e) => {
                    counter!(metric::WATCH_ERRORS_TOTAL, 1u64, "kind" => K::KIND.as_str());
                    warn!(kind = %K::KIND, error = %e, "watch error; continuing");
                }
            }
        }
        warn!(kind = %K::KIND, "watcher stream ended");
    }
}

fn collect_scope<K: Watched>(obj: &K, out: &mut BTreeSet<String>) {
    match obj.change_scope() {
        ChangeScope::Namespace(ns) => {
            out.insert(ns.to_string());
        }
        ChangeScope::Untracked => {}
        ChangeScope::Missing(field) => {
            counter!(metric::EVENTS_DROPPED_TOTAL, 1u64, "kind" => K::KIND.as_str());
            warn!(kind = %K::KIND, name = ?obj.meta().name, field, "failed to get namespace for object; dropping notification");
        }
    }
}

/// Locally cached view of pods, events and namespaces. Cheap to clone.
#[derive(Clone)]
pub struct ResourceCache {
    pods: KindCache<Pod>,
    events: KindCache<Event>,
    namespaces: KindCache<Namespace>,
}

/// Write halves matching a [`ResourceCache`]. Spawn them, or feed them by hand in tests.
pub struct CacheFeeds {
    pub pods: KindFeed<Pod>,
    pub events: KindFeed<Event>,
    pub namespaces: KindFeed<Namespace>,
}

impl ResourceCache {
    pub fn new() -> (Self, CacheFeeds) {
        let (pods, pods_feed) = kind_pair::<Pod>();
        let (events, events_feed) = kind_pair::<Event>();
        let (namespaces, namespaces_feed) = kind_pair::<Namespace>();
        (
            Self { pods, events, namespaces },
            CacheFeeds { pods: pods_feed, events: events_feed, namespaces: namespaces_feed },
        )
    }

    /// `Ok(None)` when the namespace is not in the cache.
    pub fn get_namespace(&self, name: &str) -> Result<Option<Arc<Namespace>>, CacheError> {
        Ok(self.namespaces.synced_store()?.get(&ObjectRef::new(name)))
    }

    /// Pods in `namespace` matching `selector`, ordered by name.
    pub fn list_pods(&self, namespace: &str, selector: &MatchLabels) -> Result<Vec<Arc<Pod>>, CacheError> {
        let mut pods = self.pods.list_in(namespace)?;
        pods.retain(|p| selector.matches(p.metadata.labels.as_ref()));
        Ok(pods)
    }

    pub fn list_events(&self, namespace: &str) -> Result<Vec<Arc<Event>>, CacheError> {
        self.events.list_in(namespace)
    }

    pub fn is_synced(&self) -> bool {
        self.pods.is_synced() && self.events.is_synced() && self.namespaces.is_synced()
    }

    /// Resolves once all three kinds delivered their initial listing.
    pub async fn wait_until_synced(&self) -> Result<(), CacheError> {
        self.pods.wait_until_synced().await?;
        self.events.wait_until_synced().await?;
        self.namespaces.wait_until_synced().await?;
        Ok(())
    }
}

impl CacheFeeds {
    /// Start one cluster-wide watch loop per kind on the current runtime.
    pub fn spawn(self, client: Client, sink: Arc<dyn ChangeSink>) -> WatchTasks {
        let handles = vec![
            tokio::spawn(self.pods.run(Api::all(client.clone()), Arc::clone(&sink))),
            tokio::spawn(self.events.run(Api::all(client.clone()), Arc::clone(&sink))),
            tokio::spawn(self.namespaces.run(Api::all(client), sink)),
        ];
        WatchTasks { handles }
    }
}

/// Running watch loops. Dropping the value aborts them.
pub struct WatchTasks {
    handles: Vec<JoinHandle<()>>,
}

impl Drop for WatchTasks {
    fn drop(&mut self) {
        for h in &self.handles {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn match_labels_requires_every_pair() {
        let sel = MatchLabels::new().with("a", "1").with("b", "2");
        assert!(sel.matches(Some(&labels(&[("a", "1"), ("b", "2"), ("c", "3")]))));
        assert!(!sel.matches(Some(&labels(&[("a", "1")]))));
        assert!(!sel.matches(None));
        assert!(MatchLabels::new().matches(None));
        assert_eq!(sel.to_string(), "a=1,b=2");
    }

    #[test]
    fn scopes_per_kind() {
        let mut pod = Pod::default();
        assert_eq!(pod.change_scope(), ChangeScope::Missing("metadata.namespace"));
        pod.metadata.namespace = Some("ns1".into());
        assert_eq!(pod.change_scope(), ChangeScope::Namespace("ns1"));

        let mut ns = Namespace::default();
        ns.metadata.name = Some("ns2".into());
        assert_eq!(ns.change_scope(), ChangeScope::Namespace("ns2"));

        assert_eq!(Event::default().change_scope(), ChangeScope::Untracked);
    }

    #[test]
    fn stream_errors_and_dropped_objects_count_separately() {
        let names = [metric::EVENTS_TOTAL, metric::EVENTS_DROPPED_TOTAL, metric::WATCH_ERRORS_TOTAL];
        let unique: BTreeSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
        assert_eq!(metric::WATCH_ERRORS_TOTAL, "kubehub_watch_errors_total");
    }

    fn named(ns: &str, name: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some(ns.into());
        pod.metadata.name = Some(name.into());
        pod
    }

    #[test]
    fn namespace_index_follows_events() {
        let index = NamespaceIndex::default();
        index.apply(&watcher::Event::Restarted(vec![named("ns1", "b"), named("ns1", "a"), named("ns2", "c")]));
        assert_eq!(index.names("ns1"), vec!["a", "b"]);
        index.apply(&watcher::Event::Applied(named("ns1", "a")));
        index.apply(&watcher::Event::Deleted(named("ns2", "c")));
        assert_eq!(index.names("ns1"), vec!["a", "b"]);
        assert!(index.names("ns2").is_empty());
        assert!(!index.0.read().unwrap().contains_key("ns2"));
        index.apply(&watcher::Event::Restarted(vec![named("ns3", "d")]));
        assert!(index.names("ns1").is_empty());
        assert_eq!(index.names("ns3"), vec!["d"]);
    }
}
