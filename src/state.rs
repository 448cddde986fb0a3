use crate::config::{ClusterPreferences, WatchTuning};
use crate::extension::{ExtensionRegistry, Pipeline};
use crate::k8s::{Cluster, ConnectError};
use crate::model::{Object, ResourceKey, ResourceKind, SearchFilter};
use crate::property::Property;
use crate::watch::{LiveObjects, ResourceWatch, WatchError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Live state bound to one cluster connection.
pub struct ClusterState {
    pub cluster: Arc<Cluster>,
    pub extensions: Pipeline,
    pub namespaces: LiveObjects,
    pub selected_resource: Property<Option<ResourceKind>>,
    pub search_text: Property<String>,
    pub search_filter: Property<SearchFilter>,
    pub selected_object: Property<Option<Object>>,
    runtime: Handle,
    tuning: WatchTuning,
    watches: Mutex<WatchSet>,
}

struct ActiveWatch {
    watch: ResourceWatch,
    objects: LiveObjects,
}

#[derive(Default)]
struct WatchSet {
    active: HashMap<ResourceKey, ActiveWatch>,
    // Most recently used last; never contains the namespaces kind.
    recent: Vec<ResourceKey>,
}

impl ClusterState {
    pub async fn connect(
        preferences: Property<ClusterPreferences>,
        registry: &ExtensionRegistry,
        tuning: WatchTuning,
    ) -> Result<Self, ConnectError> {
        let cluster = Cluster::connect(preferences).await?;
        Self::new(cluster, registry, tuning)
    }

    /// Must be called within a tokio runtime; watches started later run on
    /// it no matter which thread asks for them.
    pub fn new(
        cluster: Arc<Cluster>,
        registry: &ExtensionRegistry,
        tuning: WatchTuning,
    ) -> Result<Self, ConnectError> {
        let runtime = Handle::try_current().map_err(|error| {
            ConnectError::Client(format!("no async runtime for watches: {error}"))
        })?;
        let namespaces_kind = cluster
            .resource("", "v1", "namespaces")
            .cloned()
            .ok_or_else(|| {
                ConnectError::Discovery("cluster does not expose core/v1 namespaces".to_string())
            })?;

        let namespaces = Property::new(None);
        let watch = ResourceWatch::start(
            &runtime,
            Arc::clone(&cluster),
            namespaces_kind.clone(),
            namespaces.clone(),
            tuning,
        )
        .map_err(|error| ConnectError::Discovery(error.to_string()))?;

        let mut watches = WatchSet::default();
        watches.active.insert(
            namespaces_kind.key(),
            ActiveWatch {
                watch,
                objects: namespaces.clone(),
            },
        );

        let extensions = Pipeline::new(registry, &cluster);
        info!(
            cluster = %cluster.preferences.get().name,
            extensions = ?extensions.names(),
            "cluster state ready"
        );

        Ok(Self {
            cluster,
            extensions,
            namespaces,
            selected_resource: Property::new(None),
            search_text: Property::new(String::new()),
            search_filter: Property::new(SearchFilter::default()),
            selected_object: Property::new(None),
            runtime,
            tuning,
            watches: Mutex::new(watches),
        })
    }

    /// Changes the selected kind and returns its live object list.
    pub fn select_resource(&self, kind: Option<ResourceKind>) -> Option<LiveObjects> {
        let objects = match &kind {
            Some(kind) => match self.objects(kind) {
                Ok(objects) => Some(objects),
                Err(error) => {
                    warn!(%kind, "cannot watch selected resource: {error}");
                    None
                }
            },
            None => None,
        };
        if self.selected_resource.get() != kind {
            self.selected_object.set(None);
            self.selected_resource.set(kind);
            // The previous selection is no longer pinned.
            let evicted = self.evict_stale(&mut lock(&self.watches), None);
            retire(evicted);
        }
        objects
    }

    /// Live object list for a kind, starting its watch when needed.
    ///
    /// Watches beyond the recent limit are stopped, oldest first. The
    /// selected kind and the kind asked for here are never among them.
    pub fn objects(&self, kind: &ResourceKind) -> Result<LiveObjects, WatchError> {
        let key = kind.key();
        let mut watches = lock(&self.watches);
        if !kind.is("", "v1", "namespaces") {
            watches.recent.retain(|existing| existing != &key);
            watches.recent.push(key.clone());
        }

        let objects = match watches.active.get(&key) {
            Some(active) => active.objects.clone(),
            None => {
                let objects = Property::new(None);
                let watch = ResourceWatch::start(
                    &self.runtime,
                    Arc::clone(&self.cluster),
                    kind.clone(),
                    objects.clone(),
                    self.tuning,
                )?;
                watches.active.insert(
                    key.clone(),
                    ActiveWatch {
                        watch,
                        objects: objects.clone(),
                    },
                );
                objects
            }
        };
        let evicted = self.evict_stale(&mut watches, Some(&key));
        drop(watches);
        retire(evicted);
        Ok(objects)
    }

    // Stopping waits for in-flight publishes, so callers drop the returned
    // watches only after releasing the watch set lock.
    fn evict_stale(
        &self,
        watches: &mut WatchSet,
        requested: Option<&ResourceKey>,
    ) -> Vec<ResourceWatch> {
        let limit = self.tuning.recent_watches.max(1);
        let pinned = self.selected_resource.get().map(|kind| kind.key());
        let exempt = |key: &ResourceKey| Some(key) == pinned.as_ref() || Some(key) == requested;

        let mut evicted = Vec::new();
        while watches.recent.len() > limit {
            let Some(index) = watches.recent.iter().position(|key| !exempt(key)) else {
                break;
            };
            let key = watches.recent.remove(index);
            if let Some(stale) = watches.active.remove(&key) {
                evicted.push(stale.watch);
            }
        }
        evicted
    }

    pub fn select_object(&self, object: Option<Object>) {
        self.selected_object.set(object);
    }

    pub fn set_search_text(&self, text: &str) {
        self.search_filter.set(SearchFilter::parse(text));
        self.search_text.set(text.to_string());
    }

    pub fn filtered(&self, objects: &[Object]) -> Vec<Object> {
        let filter = self.search_filter.get();
        objects
            .iter()
            .filter(|object| filter.matches(object))
            .cloned()
            .collect()
    }

    pub fn is_watching(&self, kind: &ResourceKind) -> bool {
        lock(&self.watches).active.contains_key(&kind.key())
    }

    pub fn active_watches(&self) -> Vec<ResourceKind> {
        lock(&self.watches)
            .active
            .values()
            .map(|active| active.watch.kind().clone())
            .collect()
    }

    /// Stops every watch, the namespaces one included.
    pub fn shutdown(&self) {
        let stopped = {
            let mut watches = lock(&self.watches);
            watches.recent.clear();
            watches
                .active
                .drain()
                .map(|(_, active)| active.watch)
                .collect::<Vec<_>>()
        };
        for mut watch in stopped {
            watch.stop();
        }
    }
}

fn retire(evicted: Vec<ResourceWatch>) {
    for mut watch in evicted {
        watch.stop();
        debug!(kind = %watch.kind(), "evicted least recently used watch");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::ClusterState;
    use crate::config::{ClusterPreferences, WatchTuning};
    use crate::extension::ExtensionRegistry;
    use crate::k8s::{Cluster, ConnectError};
    use crate::model::{Object, ResourceKind, SearchFilter};
    use crate::property::Property;
    use crate::testing::{FakeCluster, deployments, ingresses, object, pods};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn tuning(recent_watches: usize) -> WatchTuning {
        WatchTuning {
            restart_delay_ms: 10,
            recent_watches,
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn listed(objects: &Property<Option<Vec<Object>>>) -> Option<usize> {
        objects.get().map(|objects| objects.len())
    }

    async fn state_with(kinds: Vec<ResourceKind>, recent: usize) -> (Arc<FakeCluster>, ClusterState) {
        let fake = Arc::new(FakeCluster::with_kinds(kinds));
        let cluster = Cluster::new(
            fake.clone(),
            Property::new(ClusterPreferences {
                name: "kind-dev".to_string(),
                ..ClusterPreferences::default()
            }),
        )
        .await
        .unwrap();
        let state = ClusterState::new(cluster, &ExtensionRegistry::with_defaults(), tuning(recent))
            .unwrap();
        (fake, state)
    }

    #[tokio::test]
    async fn starts_namespaces_watch_and_pods_lazily() {
        let (fake, state) = state_with(vec![ResourceKind::namespaces(), pods()], 4).await;
        assert!(state.is_watching(&ResourceKind::namespaces()));
        assert!(!state.is_watching(&pods()));
        assert_eq!(state.extensions.names(), vec!["networking", "workloads"]);
        assert_eq!(state.selected_resource.get(), None);
        assert_eq!(state.search_text.get(), "");
        assert_eq!(state.search_filter.get(), SearchFilter::default());
        assert!(state.selected_object.get().is_none());

        fake.insert(&pods(), object(Some("default"), "web", json!({})));
        let first = state.select_resource(Some(pods())).unwrap();
        let second = state.select_resource(Some(pods())).unwrap();
        assert_eq!(state.active_watches().len(), 2);
        assert_eq!(state.selected_resource.get(), Some(pods()));

        wait_until(|| listed(&first) == Some(1)).await;
        assert_eq!(listed(&second), Some(1));
        assert_eq!(fake.watch_calls(&pods()), 1);
    }

    #[tokio::test]
    async fn namespaces_property_is_populated() {
        let fake = Arc::new(FakeCluster::with_kinds(vec![ResourceKind::namespaces()]));
        fake.insert(&ResourceKind::namespaces(), object(None, "default", json!({})));
        fake.insert(&ResourceKind::namespaces(), object(None, "kube-system", json!({})));
        let cluster = Cluster::new(fake, Property::new(ClusterPreferences::default()))
            .await
            .unwrap();
        let state = ClusterState::new(cluster, &ExtensionRegistry::new(), tuning(4)).unwrap();

        let (_subscription, mut rx) = state.namespaces.subscribe_channel();
        let mut latest = rx.recv().await.unwrap();
        while latest.is_none() {
            latest = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        let latest = latest.unwrap_or_default();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[1].metadata.name.as_deref(), Some("kube-system"));
    }

    #[tokio::test]
    async fn missing_namespaces_kind_fails_construction() {
        let fake = Arc::new(FakeCluster::with_kinds(vec![pods()]));
        let cluster = Cluster::new(fake, Property::new(ClusterPreferences::default()))
            .await
            .unwrap();

        let result = ClusterState::new(cluster, &ExtensionRegistry::new(), tuning(4));
        assert!(matches!(result, Err(ConnectError::Discovery(_))));
    }

    #[tokio::test]
    async fn least_recently_selected_watch_is_evicted() {
        let kinds = vec![ResourceKind::namespaces(), pods(), ingresses(), deployments()];
        let (_fake, state) = state_with(kinds, 2).await;

        state.select_resource(Some(pods()));
        state.select_resource(Some(ingresses()));
        state.select_resource(Some(pods()));
        state.select_resource(Some(deployments()));

        assert!(state.is_watching(&ResourceKind::namespaces()));
        assert!(state.is_watching(&pods()));
        assert!(state.is_watching(&deployments()));
        assert!(!state.is_watching(&ingresses()));
        assert_eq!(state.active_watches().len(), 3);

        state.select_resource(None);
        assert_eq!(state.selected_resource.get(), None);
        assert_eq!(state.active_watches().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_selection_starts_one_watch() {
        let (fake, state) = state_with(vec![ResourceKind::namespaces(), pods()], 4).await;
        let state = Arc::new(state);

        let tasks = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                tokio::spawn(async move { state.objects(&pods()).is_ok() })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            assert!(task.await.unwrap());
        }
        wait_until(|| fake.watch_calls(&pods()) > 0).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(state.active_watches().len(), 2);
        assert_eq!(fake.watch_calls(&pods()), 1);
    }

    #[tokio::test]
    async fn selected_kind_is_never_evicted() {
        let kinds = vec![ResourceKind::namespaces(), pods(), ingresses(), deployments()];
        let (_fake, state) = state_with(kinds, 1).await;

        state.select_resource(Some(pods()));
        state.objects(&ingresses()).unwrap();
        assert!(state.is_watching(&pods()));
        assert!(state.is_watching(&ingresses()));

        state.objects(&deployments()).unwrap();
        assert!(state.is_watching(&pods()));
        assert!(state.is_watching(&deployments()));
        assert!(!state.is_watching(&ingresses()));

        state.select_resource(Some(deployments()));
        assert!(!state.is_watching(&pods()));
        assert!(state.is_watching(&deployments()));
        assert_eq!(state.active_watches().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn selection_from_a_plain_thread_starts_the_watch() {
        let (fake, state) = state_with(vec![ResourceKind::namespaces(), pods()], 4).await;
        fake.insert(&pods(), object(Some("default"), "web", json!({})));
        let state = Arc::new(state);

        let selector = Arc::clone(&state);
        let objects = std::thread::spawn(move || selector.select_resource(Some(pods())))
            .join()
            .unwrap()
            .unwrap();

        wait_until(|| listed(&objects) == Some(1)).await;
        assert_eq!(state.selected_resource.get(), Some(pods()));
    }

    #[tokio::test]
    async fn handler_may_request_a_kind_that_evicts_its_own_watch() {
        let kinds = vec![ResourceKind::namespaces(), pods(), ingresses()];
        let (fake, state) = state_with(kinds, 1).await;
        fake.insert(&pods(), object(Some("default"), "web", json!({})));
        let state = Arc::new(state);

        let pod_list = state.objects(&pods()).unwrap();
        let requested = Arc::new(AtomicBool::new(false));
        let once = Arc::clone(&requested);
        let weak = Arc::downgrade(&state);
        let _subscription = pod_list.subscribe(move |objects: &Option<Vec<Object>>| {
            if objects.is_some()
                && !once.swap(true, Ordering::SeqCst)
                && let Some(state) = weak.upgrade()
            {
                let _ = state.objects(&ingresses());
            }
        });

        wait_until(|| state.is_watching(&ingresses()) && !state.is_watching(&pods())).await;
        assert!(requested.load(Ordering::SeqCst));
        assert_eq!(listed(&pod_list), Some(1));
    }

    #[tokio::test]
    async fn selecting_a_new_kind_clears_selected_object() {
        let (_fake, state) = state_with(vec![ResourceKind::namespaces(), pods(), ingresses()], 4).await;
        state.select_resource(Some(pods()));
        state.select_object(Some(object(Some("default"), "web", json!({}))));
        assert!(state.selected_object.get().is_some());

        state.select_resource(Some(pods()));
        assert!(state.selected_object.get().is_some());
        state.select_resource(Some(ingresses()));
        assert!(state.selected_object.get().is_none());
    }

    #[tokio::test]
    async fn search_text_updates_filter() {
        let (_fake, state) = state_with(vec![ResourceKind::namespaces()], 4).await;
        state.set_search_text("ns:default web");

        assert_eq!(state.search_text.get(), "ns:default web");
        assert_eq!(state.search_filter.get().namespaces, vec!["default"]);
        let objects = vec![
            object(Some("default"), "web-1", json!({})),
            object(Some("default"), "db", json!({})),
            object(Some("other"), "web-2", json!({})),
        ];
        let filtered = state.filtered(&objects);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].metadata.name.as_deref(), Some("web-1"));
    }

    #[tokio::test]
    async fn shutdown_stops_all_watches() {
        let (_fake, state) = state_with(vec![ResourceKind::namespaces(), pods()], 4).await;
        state.select_resource(Some(pods()));
        state.shutdown();
        assert!(state.active_watches().is_empty());
    }
}
