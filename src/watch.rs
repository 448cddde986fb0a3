use crate::config::WatchTuning;
use crate::k8s::{Cluster, ResourceEvent};
use crate::model::{Object, ObjectKey, ResourceKind};
use crate::property::{Property, WriterClaim};
use futures::StreamExt;
use kube::runtime::watcher::Event;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Objects of one kind as seen by a watch. `None` until the first full list
/// has arrived, so an empty kind and a pending list stay distinguishable.
pub type LiveObjects = Property<Option<Vec<Object>>>;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("property for {0} is already bound to an active watch")]
    PropertyBound(String),
}

/// Keeps a property's list in sync with one resource kind.
///
/// The list is seeded from a full list and then maintained from watch
/// events. Whenever the source re-lists, the published list is replaced
/// wholesale, so a gap in events never leaves the property drifting.
pub struct ResourceWatch {
    kind: ResourceKind,
    gate: Arc<Gate>,
    task: Option<JoinHandle<()>>,
    claim: Option<WriterClaim>,
}

impl ResourceWatch {
    pub fn start(
        runtime: &Handle,
        cluster: Arc<Cluster>,
        kind: ResourceKind,
        property: LiveObjects,
        tuning: WatchTuning,
    ) -> Result<Self, WatchError> {
        let claim = property
            .claim_writer()
            .ok_or_else(|| WatchError::PropertyBound(kind.to_string()))?;
        let gate = Arc::new(Gate::open());
        let publisher = Publisher {
            property,
            gate: Arc::clone(&gate),
        };
        let task = runtime.spawn(run_watch(
            cluster,
            kind.clone(),
            publisher,
            tuning.restart_delay(),
        ));
        info!(%kind, "watch started");

        Ok(Self {
            kind,
            gate,
            task: Some(task),
            claim: Some(claim),
        })
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    /// Stops the watch. Once this returns the property is never written
    /// again by this watch. Safe to call more than once, from any thread,
    /// including from a handler the watch is currently notifying.
    pub fn stop(&mut self) {
        self.gate.close();
        if let Some(task) = self.task.take() {
            task.abort();
            info!(kind = %self.kind, "watch stopped");
        }
        self.claim = None;
    }
}

impl Drop for ResourceWatch {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Lets `stop` wait out a publish running on another thread. A publish on
/// the stopping thread itself is the caller's own stack and is not waited for.
struct Gate {
    state: Mutex<GateState>,
    idle: Condvar,
}

struct GateState {
    open: bool,
    publishing: Option<ThreadId>,
}

impl Gate {
    fn open() -> Self {
        Self {
            state: Mutex::new(GateState {
                open: true,
                publishing: None,
            }),
            idle: Condvar::new(),
        }
    }

    fn publish(&self, write: impl FnOnce()) {
        {
            let mut state = lock(&self.state);
            if !state.open {
                return;
            }
            state.publishing = Some(thread::current().id());
        }
        let _done = PublishDone(self);
        write();
    }

    fn close(&self) {
        let current = thread::current().id();
        let mut state = lock(&self.state);
        state.open = false;
        while state.publishing.is_some_and(|publisher| publisher != current) {
            state = self
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct PublishDone<'a>(&'a Gate);

impl Drop for PublishDone<'_> {
    fn drop(&mut self) {
        lock(&self.0.state).publishing = None;
        self.0.idle.notify_all();
    }
}

struct Publisher {
    property: LiveObjects,
    gate: Arc<Gate>,
}

impl Publisher {
    fn publish(&self, objects: &[Object]) {
        self.gate
            .publish(|| self.property.set(Some(objects.to_vec())));
    }
}

/// Applies one change event to the list, keyed by object identity.
/// Re-list events are assembled by the watch loop and ignored here.
pub fn apply_event(objects: &mut Vec<Object>, event: ResourceEvent) {
    match event {
        Event::Apply(object) => {
            let key = ObjectKey::of(&object);
            match objects
                .iter_mut()
                .find(|existing| ObjectKey::of(existing).same_object(&key))
            {
                Some(existing) => *existing = object,
                None => objects.push(object),
            }
        }
        Event::Delete(object) => {
            let key = ObjectKey::of(&object);
            objects.retain(|existing| !ObjectKey::of(existing).same_object(&key));
        }
        Event::Init | Event::InitApply(_) | Event::InitDone => {}
    }
}

async fn run_watch(
    cluster: Arc<Cluster>,
    kind: ResourceKind,
    publisher: Publisher,
    restart_delay: Duration,
) {
    loop {
        let mut events = cluster.api().watch(&kind);
        let mut objects = Vec::new();
        let mut relisted: Option<Vec<Object>> = None;

        while let Some(event) = events.next().await {
            match event {
                Ok(Event::Init) => relisted = Some(Vec::new()),
                Ok(Event::InitApply(object)) => {
                    relisted.get_or_insert_with(Vec::new).push(object);
                }
                Ok(Event::InitDone) => {
                    objects = relisted.take().unwrap_or_default();
                    debug!(%kind, count = objects.len(), "list re-seeded");
                    publisher.publish(&objects);
                }
                Ok(event) => {
                    apply_event(&mut objects, event);
                    publisher.publish(&objects);
                }
                Err(error) => warn!(%kind, "watch stream error: {error}"),
            }
        }

        debug!(
            %kind,
            delay_ms = restart_delay.as_millis() as u64,
            "watch stream ended, reopening"
        );
        tokio::time::sleep(restart_delay).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
