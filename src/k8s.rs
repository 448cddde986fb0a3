use crate::codec::YamlCodec;
use crate::config::ClusterPreferences;
use crate::model::{Object, ObjectKey, ResourceKind};
use crate::property::Property;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use kube::api::PostParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::TypeMeta;
use kube::discovery::{Scope, verbs};
use kube::runtime::watcher::Event;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Config, Discovery};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Kube API Error: {0}")]
    Kube(#[source] kube::Error),

    #[error("{0} was modified on the server since it was fetched")]
    Conflict(String),

    #[error("watch stream error: {0}")]
    Watch(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid cluster preferences: {0}")]
    Config(String),

    #[error("failed to initialize Kubernetes client: {0}")]
    Client(String),

    #[error("resource discovery failed: {0}")]
    Discovery(String),
}

/// A full re-list arrives as `Init`, one `InitApply` per object, then `InitDone`.
pub type ResourceEvent = Event<Object>;

pub type EventStream = BoxStream<'static, Result<ResourceEvent, ClusterError>>;

/// Cluster operations the core depends on.
pub trait ClusterApi: Send + Sync {
    fn discover(&self) -> BoxFuture<'_, Result<Vec<ResourceKind>, ClusterError>>;

    /// List then watch the kind. The stream re-lists on its own after
    /// desyncs and ends only when the source gives up.
    fn watch(&self, kind: &ResourceKind) -> EventStream;

    fn get<'a>(
        &'a self,
        kind: &'a ResourceKind,
        key: &'a ObjectKey,
    ) -> BoxFuture<'a, Result<Option<Object>, ClusterError>>;

    fn create<'a>(
        &'a self,
        kind: &'a ResourceKind,
        object: &'a Object,
    ) -> BoxFuture<'a, Result<Object, ClusterError>>;

    fn update<'a>(
        &'a self,
        kind: &'a ResourceKind,
        object: &'a Object,
    ) -> BoxFuture<'a, Result<Object, ClusterError>>;
}

/// Connection handle shared by everything bound to one cluster session.
pub struct Cluster {
    api: Arc<dyn ClusterApi>,
    pub resources: Vec<ResourceKind>,
    pub codec: YamlCodec,
    pub preferences: Property<ClusterPreferences>,
}

impl Cluster {
    pub async fn connect(
        preferences: Property<ClusterPreferences>,
    ) -> Result<Arc<Self>, ConnectError> {
        let gateway = KubeGateway::connect(&preferences.get()).await?;
        Self::new(Arc::new(gateway), preferences).await
    }

    pub async fn new(
        api: Arc<dyn ClusterApi>,
        preferences: Property<ClusterPreferences>,
    ) -> Result<Arc<Self>, ConnectError> {
        let resources = api
            .discover()
            .await
            .map_err(|error| ConnectError::Discovery(error.to_string()))?;
        info!(
            cluster = %preferences.get().name,
            kinds = resources.len(),
            "discovered resource kinds"
        );

        Ok(Arc::new(Self {
            api,
            resources,
            codec: YamlCodec,
            preferences,
        }))
    }

    pub fn api(&self) -> &dyn ClusterApi {
        self.api.as_ref()
    }

    pub fn resource(&self, group: &str, version: &str, plural: &str) -> Option<&ResourceKind> {
        self.resources
            .iter()
            .find(|resource| resource.is(group, version, plural))
    }

    pub fn resource_for(&self, api_version: &str, kind: &str) -> Option<&ResourceKind> {
        self.resources
            .iter()
            .find(|resource| resource.api_version() == api_version && resource.kind == kind)
    }

    pub fn resource_by_token(&self, token: &str) -> Option<&ResourceKind> {
        self.resources
            .iter()
            .find(|resource| resource.matches_token(token))
    }
}

/// [`ClusterApi`] backed by a live API server.
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    default_namespace: String,
}

impl KubeGateway {
    pub async fn connect(preferences: &ClusterPreferences) -> Result<Self, ConnectError> {
        preferences
            .validate()
            .map_err(|error| ConnectError::Config(format!("{error:#}")))?;

        let (config, context) = if preferences.in_cluster {
            let config =
                Config::incluster().map_err(|error| ConnectError::Config(error.to_string()))?;
            (config, "in-cluster".to_string())
        } else if let Some(reference) = &preferences.kubeconfig {
            let kubeconfig = Kubeconfig::read_from(&reference.path).map_err(|error| {
                ConnectError::Config(format!(
                    "failed to read kubeconfig {}: {error}",
                    reference.path.display()
                ))
            })?;
            let context = reference
                .context
                .clone()
                .or_else(|| kubeconfig.current_context.clone())
                .unwrap_or_else(|| "-".to_string());
            let options = KubeConfigOptions {
                context: reference.context.clone(),
                cluster: None,
                user: None,
            };
            let config = Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|error| ConnectError::Config(error.to_string()))?;
            (config, context)
        } else {
            let config = Config::infer()
                .await
                .map_err(|error| ConnectError::Config(error.to_string()))?;
            (config, "default".to_string())
        };

        let default_namespace = config.default_namespace.clone();
        let cluster_url = config.cluster_url.to_string();
        let client =
            Client::try_from(config).map_err(|error| ConnectError::Client(error.to_string()))?;
        info!(%cluster_url, %context, "connected to cluster");

        Ok(Self {
            client,
            default_namespace,
        })
    }

    fn dynamic_api(&self, kind: &ResourceKind, namespace: Option<&str>) -> Api<Object> {
        let resource = kind.to_api_resource();
        match namespace {
            Some(namespace) if kind.namespaced => {
                Api::namespaced_with(self.client.clone(), namespace, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        }
    }

    fn target_namespace<'a>(&'a self, kind: &ResourceKind, object: &'a Object) -> Option<&'a str> {
        if !kind.namespaced {
            return None;
        }
        object
            .metadata
            .namespace
            .as_deref()
            .or(Some(self.default_namespace.as_str()))
    }
}

impl ClusterApi for KubeGateway {
    fn discover(&self) -> BoxFuture<'_, Result<Vec<ResourceKind>, ClusterError>> {
        async move {
            let discovery = Discovery::new(self.client.clone())
                .run()
                .await
                .map_err(ClusterError::Kube)?;

            let mut resources = Vec::new();
            for group in discovery.groups() {
                for (resource, capabilities) in group.recommended_resources() {
                    if !capabilities.supports_operation(verbs::LIST)
                        || !capabilities.supports_operation(verbs::WATCH)
                    {
                        continue;
                    }
                    resources.push(ResourceKind {
                        group: resource.group.clone(),
                        version: resource.version.clone(),
                        kind: resource.kind.clone(),
                        plural: resource.plural.clone(),
                        namespaced: capabilities.scope == Scope::Namespaced,
                    });
                }
            }
            resources.sort_by_key(|resource| !resource.group.is_empty());
            Ok(resources)
        }
        .boxed()
    }

    fn watch(&self, kind: &ResourceKind) -> EventStream {
        let kind = kind.clone();
        watcher(self.dynamic_api(&kind, None), watcher::Config::default())
            .default_backoff()
            .map(move |event| {
                event
                    .map(|event| with_type_meta_event(&kind, event))
                    .map_err(|error| ClusterError::Watch(error.to_string()))
            })
            .boxed()
    }

    fn get<'a>(
        &'a self,
        kind: &'a ResourceKind,
        key: &'a ObjectKey,
    ) -> BoxFuture<'a, Result<Option<Object>, ClusterError>> {
        async move {
            let namespace = key
                .namespace
                .as_deref()
                .or(Some(self.default_namespace.as_str()));
            let object = self
                .dynamic_api(kind, namespace)
                .get_opt(&key.name)
                .await
                .map_err(ClusterError::Kube)?;
            Ok(object.map(|object| with_type_meta(kind, object)))
        }
        .boxed()
    }

    fn create<'a>(
        &'a self,
        kind: &'a ResourceKind,
        object: &'a Object,
    ) -> BoxFuture<'a, Result<Object, ClusterError>> {
        async move {
            let namespace = self.target_namespace(kind, object);
            self.dynamic_api(kind, namespace)
                .create(&PostParams::default(), object)
                .await
                .map_err(|error| write_error(&ObjectKey::of(object), error))
        }
        .boxed()
    }

    fn update<'a>(
        &'a self,
        kind: &'a ResourceKind,
        object: &'a Object,
    ) -> BoxFuture<'a, Result<Object, ClusterError>> {
        async move {
            let namespace = self.target_namespace(kind, object);
            let key = ObjectKey::of(object);
            self.dynamic_api(kind, namespace)
                .replace(&key.name, &PostParams::default(), object)
                .await
                .map_err(|error| write_error(&key, error))
        }
        .boxed()
    }
}

fn write_error(key: &ObjectKey, error: kube::Error) -> ClusterError {
    match error {
        kube::Error::Api(response) if response.code == 409 => ClusterError::Conflict(key.to_string()),
        kube::Error::Api(response) if matches!(response.code, 400 | 403 | 422) => {
            ClusterError::Rejected(response.message.clone())
        }
        other => ClusterError::Kube(other),
    }
}

fn with_type_meta_event(kind: &ResourceKind, event: ResourceEvent) -> ResourceEvent {
    match event {
        Event::Apply(object) => Event::Apply(with_type_meta(kind, object)),
        Event::Delete(object) => Event::Delete(with_type_meta(kind, object)),
        Event::InitApply(object) => Event::InitApply(with_type_meta(kind, object)),
        other => other,
    }
}

// List items come back without apiVersion/kind; the editor needs them.
fn with_type_meta(kind: &ResourceKind, mut object: Object) -> Object {
    if object.types.is_none() {
        object.types = Some(TypeMeta {
            api_version: kind.api_version(),
            kind: kind.kind.clone(),
        });
    }
    object
}
