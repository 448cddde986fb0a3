//! In-memory cluster used by the unit tests.

use crate::k8s::{ClusterApi, ClusterError, EventStream, ResourceEvent};
use crate::model::{Object, ObjectKey, ResourceKey, ResourceKind};
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::TypeMeta;
use kube::runtime::watcher::Event;
use std::collections::HashMap;
use std::sync::Mutex;

type Sender = mpsc::UnboundedSender<Result<ResourceEvent, ClusterError>>;

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    kinds: Vec<ResourceKind>,
    objects: HashMap<ResourceKey, Vec<Object>>,
    watchers: HashMap<ResourceKey, Vec<Sender>>,
    watch_calls: HashMap<ResourceKey, usize>,
    discovery_error: Option<String>,
    watch_error: Option<String>,
    create_error: Option<String>,
    create_calls: usize,
    update_calls: usize,
    revision: u64,
    next_uid: u64,
}

impl FakeCluster {
    pub fn with_kinds(kinds: Vec<ResourceKind>) -> Self {
        Self {
            state: Mutex::new(FakeState {
                kinds,
                revision: 100,
                ..FakeState::default()
            }),
        }
    }

    pub fn fail_discovery(&self, message: &str) {
        self.state.lock().unwrap().discovery_error = Some(message.to_string());
    }

    /// New watches yield one error and end while set.
    pub fn fail_watches(&self, message: Option<&str>) {
        self.state.lock().unwrap().watch_error = message.map(str::to_string);
    }

    pub fn fail_create(&self, message: &str) {
        self.state.lock().unwrap().create_error = Some(message.to_string());
    }

    /// Stores an object as if it already existed, assigning uid and version.
    pub fn insert(&self, kind: &ResourceKind, object: Object) -> Object {
        let mut state = self.state.lock().unwrap();
        let object = state.admit(kind, object);
        state
            .objects
            .entry(kind.key())
            .or_default()
            .push(object.clone());
        object
    }

    /// Changes a stored object behind the client's back.
    pub fn external_update(&self, kind: &ResourceKind, name: &str, change: impl FnOnce(&mut Object)) {
        let mut state = self.state.lock().unwrap();
        state.revision += 1;
        let revision = state.revision.to_string();
        if let Some(object) = state
            .objects
            .get_mut(&kind.key())
            .and_then(|objects| objects.iter_mut().find(|object| object.metadata.name.as_deref() == Some(name)))
        {
            change(object);
            object.metadata.resource_version = Some(revision);
        }
    }

    pub fn emit(&self, kind: &ResourceKind, event: ResourceEvent) {
        let state = self.state.lock().unwrap();
        if let Some(senders) = state.watchers.get(&kind.key()) {
            for sender in senders {
                let _ = sender.unbounded_send(Ok(event.clone()));
            }
        }
    }

    /// Replays a full list to every open watch, as after a desync.
    pub fn relist(&self, kind: &ResourceKind) {
        let state = self.state.lock().unwrap();
        let events = state.initial_events(kind);
        if let Some(senders) = state.watchers.get(&kind.key()) {
            for sender in senders {
                for event in &events {
                    let _ = sender.unbounded_send(Ok(event.clone()));
                }
            }
        }
    }

    pub fn emit_error(&self, kind: &ResourceKind, message: &str) {
        let state = self.state.lock().unwrap();
        if let Some(senders) = state.watchers.get(&kind.key()) {
            for sender in senders {
                let _ = sender.unbounded_send(Err(ClusterError::Watch(message.to_string())));
            }
        }
    }

    /// Ends every open watch stream for the kind.
    pub fn close_watches(&self, kind: &ResourceKind) {
        self.state.lock().unwrap().watchers.remove(&kind.key());
    }

    pub fn open_watches(&self, kind: &ResourceKind) -> usize {
        self.state
            .lock()
            .unwrap()
            .watchers
            .get(&kind.key())
            .map(|senders| senders.iter().filter(|sender| !sender.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn watch_calls(&self, kind: &ResourceKind) -> usize {
        self.state
            .lock()
            .unwrap()
            .watch_calls
            .get(&kind.key())
            .copied()
            .unwrap_or(0)
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().unwrap().create_calls
    }

    pub fn update_calls(&self) -> usize {
        self.state.lock().unwrap().update_calls
    }
}

impl FakeState {
    fn admit(&mut self, kind: &ResourceKind, mut object: Object) -> Object {
        self.revision += 1;
        self.next_uid += 1;
        object.metadata.uid = Some(format!("uid-{}", self.next_uid));
        object.metadata.resource_version = Some(self.revision.to_string());
        if object.types.is_none() {
            object.types = Some(TypeMeta {
                api_version: kind.api_version(),
                kind: kind.kind.clone(),
            });
        }
        object
    }

    fn initial_events(&self, kind: &ResourceKind) -> Vec<ResourceEvent> {
        let stored = self.objects.get(&kind.key()).cloned().unwrap_or_default();
        std::iter::once(Event::Init)
            .chain(stored.into_iter().map(Event::InitApply))
            .chain(std::iter::once(Event::InitDone))
            .collect()
    }

    fn find(&self, kind: &ResourceKind, key: &ObjectKey) -> Option<&Object> {
        self.objects.get(&kind.key())?.iter().find(|object| {
            object.metadata.name.as_deref() == Some(key.name.as_str())
                && object.metadata.namespace == key.namespace
        })
    }
}

impl ClusterApi for FakeCluster {
    fn discover(&self) -> BoxFuture<'_, Result<Vec<ResourceKind>, ClusterError>> {
        let state = self.state.lock().unwrap();
        let result = match &state.discovery_error {
            Some(message) => Err(ClusterError::Rejected(message.clone())),
            None => Ok(state.kinds.clone()),
        };
        futures::future::ready(result).boxed()
    }

    fn watch(&self, kind: &ResourceKind) -> EventStream {
        let mut state = self.state.lock().unwrap();
        *state.watch_calls.entry(kind.key()).or_default() += 1;
        if let Some(message) = &state.watch_error {
            let failure = Err(ClusterError::Watch(message.clone()));
            return futures::stream::iter(vec![failure]).boxed();
        }
        let (tx, rx) = mpsc::unbounded();
        for event in state.initial_events(kind) {
            let _ = tx.unbounded_send(Ok(event));
        }
        state.watchers.entry(kind.key()).or_default().push(tx);
        rx.boxed()
    }

    fn get<'a>(
        &'a self,
        kind: &'a ResourceKind,
        key: &'a ObjectKey,
    ) -> BoxFuture<'a, Result<Option<Object>, ClusterError>> {
        let state = self.state.lock().unwrap();
        futures::future::ready(Ok(state.find(kind, key).cloned())).boxed()
    }

    fn create<'a>(
        &'a self,
        kind: &'a ResourceKind,
        object: &'a Object,
    ) -> BoxFuture<'a, Result<Object, ClusterError>> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        let result = if let Some(message) = &state.create_error {
            Err(ClusterError::Rejected(message.clone()))
        } else if state.find(kind, &ObjectKey::of(object)).is_some() {
            Err(ClusterError::Rejected("already exists".to_string()))
        } else {
            let mut object = object.clone();
            object.metadata.resource_version = None;
            let created = state.admit(kind, object);
            state
                .objects
                .entry(kind.key())
                .or_default()
                .push(created.clone());
            Ok(created)
        };
        futures::future::ready(result).boxed()
    }

    fn update<'a>(
        &'a self,
        kind: &'a ResourceKind,
        object: &'a Object,
    ) -> BoxFuture<'a, Result<Object, ClusterError>> {
        let mut state = self.state.lock().unwrap();
        state.update_calls += 1;
        state.revision += 1;
        let revision = state.revision.to_string();
        let key = ObjectKey::of(object);
        let stored = state.objects.get_mut(&kind.key()).and_then(|objects| {
            objects.iter_mut().find(|stored| {
                stored.metadata.name.as_deref() == Some(key.name.as_str())
                    && stored.metadata.namespace == key.namespace
            })
        });
        let result = match stored {
            None => Err(ClusterError::Rejected(format!("{key} not found"))),
            Some(stored) if stored.metadata.resource_version != object.metadata.resource_version => {
                Err(ClusterError::Conflict(key.to_string()))
            }
            Some(stored) => {
                let uid = stored.metadata.uid.clone();
                *stored = object.clone();
                stored.metadata.uid = uid;
                stored.metadata.resource_version = Some(revision);
                stored
                    .metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .insert("petrel.test/normalized".to_string(), "true".to_string());
                Ok(stored.clone())
            }
        };
        futures::future::ready(result).boxed()
    }
}

pub fn object(namespace: Option<&str>, name: &str, data: serde_json::Value) -> Object {
    Object {
        types: None,
        metadata: ObjectMeta {
            namespace: namespace.map(str::to_string),
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        data,
    }
}

pub fn pods() -> ResourceKind {
    ResourceKind::new("", "v1", "Pod", "pods", true)
}

pub fn ingresses() -> ResourceKind {
    ResourceKind::new("networking.k8s.io", "v1", "Ingress", "ingresses", true)
}

pub fn deployments() -> ResourceKind {
    ResourceKind::new("apps", "v1", "Deployment", "deployments", true)
}
