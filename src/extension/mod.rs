//! Display enrichment contributed by pluggable extensions.
//!
//! Every extension sees every resource kind; it recognizes the kinds it
//! understands by their descriptor and passes everything else through.

mod networking;
mod workloads;

use crate::k8s::Cluster;
use crate::model::{Object, ResourceKind};
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, warn};

/// Target a column binding writes into.
pub trait Cell {
    fn set_label(&mut self, text: &str);
}

/// Plain text cell for non-graphical front ends.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct TextCell {
    pub label: String,
}

impl Cell for TextCell {
    fn set_label(&mut self, text: &str) {
        self.label = text.to_string();
    }
}

pub type Bind = Arc<dyn Fn(&mut dyn Cell, &Object) + Send + Sync>;

#[derive(Clone)]
pub struct Column {
    pub name: String,
    pub priority: i32,
    pub bind: Bind,
}

impl Column {
    pub fn new<F>(name: &str, priority: i32, bind: F) -> Self
    where
        F: Fn(&mut dyn Cell, &Object) + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            priority,
            bind: Arc::new(bind),
        }
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Entry in the detail view of one object.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DetailProperty {
    Text { name: String, value: String },
    Group { name: String, children: Vec<DetailProperty> },
}

impl DetailProperty {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Text {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn group(name: impl Into<String>, children: Vec<DetailProperty>) -> Self {
        Self::Group {
            name: name.into(),
            children,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Text { name, .. } | Self::Group { name, .. } => name,
        }
    }
}

/// Capability surface of an extension. The defaults change nothing.
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    fn columns(&self, _kind: &ResourceKind, columns: Vec<Column>) -> Vec<Column> {
        columns
    }

    fn object_properties(
        &self,
        _kind: &ResourceKind,
        _object: &Object,
        properties: Vec<DetailProperty>,
    ) -> Vec<DetailProperty> {
        properties
    }
}

pub type ExtensionFactory = fn(&Arc<Cluster>) -> Box<dyn Extension>;

/// Ordered list of extension factories, filled once at start-up.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    factories: Vec<ExtensionFactory>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(networking::new)
            .register(workloads::new);
        registry
    }

    pub fn register(&mut self, factory: ExtensionFactory) -> &mut Self {
        self.factories.push(factory);
        self
    }
}

/// Instantiated extensions of one cluster session, in registration order.
pub struct Pipeline {
    extensions: Vec<Box<dyn Extension>>,
}

impl Pipeline {
    pub fn new(registry: &ExtensionRegistry, cluster: &Arc<Cluster>) -> Self {
        let extensions = registry
            .factories
            .iter()
            .map(|factory| factory(cluster))
            .collect::<Vec<_>>();
        debug!(count = extensions.len(), "extensions instantiated");
        Self { extensions }
    }

    pub fn names(&self) -> Vec<&str> {
        self.extensions.iter().map(|extension| extension.name()).collect()
    }

    pub fn columns(&self, kind: &ResourceKind) -> Vec<Column> {
        let mut columns = core_columns(kind);
        for extension in &self.extensions {
            let input = columns.clone();
            match catch_unwind(AssertUnwindSafe(|| extension.columns(kind, input))) {
                Ok(next) => columns = next,
                Err(_) => {
                    warn!(extension = extension.name(), %kind, "extension panicked contributing columns")
                }
            }
        }
        columns
    }

    pub fn object_properties(&self, kind: &ResourceKind, object: &Object) -> Vec<DetailProperty> {
        let mut properties = core_properties(object);
        for extension in &self.extensions {
            let input = properties.clone();
            match catch_unwind(AssertUnwindSafe(|| {
                extension.object_properties(kind, object, input)
            })) {
                Ok(next) => properties = next,
                Err(_) => {
                    warn!(extension = extension.name(), %kind, "extension panicked contributing properties")
                }
            }
        }
        properties
    }

    /// Binds every column into a text cell. A panicking binding leaves its
    /// cell empty.
    pub fn render_row(columns: &[Column], object: &Object) -> Vec<String> {
        columns
            .iter()
            .map(|column| {
                let mut cell = TextCell::default();
                if catch_unwind(AssertUnwindSafe(|| (column.bind)(&mut cell, object))).is_err() {
                    warn!(column = %column.name, "column binding panicked");
                    return String::new();
                }
                cell.label
            })
            .collect()
    }
}

fn core_columns(kind: &ResourceKind) -> Vec<Column> {
    let mut columns = vec![Column::new("Name", 100, |cell, object| {
        cell.set_label(&object.name_any())
    })];
    if kind.namespaced {
        columns.push(Column::new("Namespace", 90, |cell, object| {
            cell.set_label(object.metadata.namespace.as_deref().unwrap_or("-"))
        }));
    }
    columns.push(Column::new("Age", 80, |cell, object| {
        cell.set_label(&human_age(object))
    }));
    columns
}

fn core_properties(object: &Object) -> Vec<DetailProperty> {
    let mut metadata = vec![DetailProperty::text("Name", object.name_any())];
    if let Some(namespace) = object.metadata.namespace.as_deref() {
        metadata.push(DetailProperty::text("Namespace", namespace));
    }
    if let Some(uid) = object.metadata.uid.as_deref() {
        metadata.push(DetailProperty::text("UID", uid));
    }
    let labels = object.labels();
    if !labels.is_empty() {
        metadata.push(DetailProperty::group(
            "Labels",
            labels
                .iter()
                .map(|(key, value)| DetailProperty::text(key, value))
                .collect(),
        ));
    }
    let annotations = object.annotations();
    if !annotations.is_empty() {
        metadata.push(DetailProperty::group(
            "Annotations",
            annotations
                .iter()
                .map(|(key, value)| DetailProperty::text(key, value))
                .collect(),
        ));
    }
    vec![DetailProperty::group("Metadata", metadata)]
}

/// Typed view of the part of a dynamic object at a JSON pointer, such as
/// `/status`. `None` when the part is missing or its shape does not fit.
pub(crate) fn typed_at<K>(object: &Object, pointer: &str) -> Option<K>
where
    K: DeserializeOwned,
{
    K::deserialize(object.data.pointer(pointer)?).ok()
}

fn human_age(object: &Object) -> String {
    let Some(created) = object.metadata.creation_timestamp.as_ref() else {
        return "-".to_string();
    };
    let elapsed = (k8s_openapi::jiff::Timestamp::now().as_second() - created.0.as_second()).max(0);
    format_elapsed_seconds(elapsed)
}

fn format_elapsed_seconds(seconds: i64) -> String {
    if seconds >= 86_400 {
        return format!("{}d", seconds / 86_400);
    }

    if seconds >= 3_600 {
        return format!("{}h", seconds / 3_600);
    }

    if seconds >= 60 {
        return format!("{}m", seconds / 60);
    }

    format!("{seconds}s")
}
