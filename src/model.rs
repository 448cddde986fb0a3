use kube::ResourceExt;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use std::fmt::{Display, Formatter};

/// Any resource instance, whatever its kind.
pub type Object = DynamicObject;

/// Descriptor of a resource kind as reported by discovery.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespaced,
        }
    }

    pub fn namespaces() -> Self {
        Self::new("", "v1", "Namespace", "namespaces", false)
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn is(&self, group: &str, version: &str, plural: &str) -> bool {
        self.group == group && self.version == version && self.plural == plural
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            group: self.group.clone(),
            version: self.version.clone(),
            plural: self.plural.clone(),
        }
    }

    pub fn to_api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }

    /// Accepts the plural, the kind, or a kubectl style short name.
    pub fn matches_token(&self, token: &str) -> bool {
        let token = token.trim().to_ascii_lowercase();
        if token.is_empty() {
            return false;
        }
        if token == self.plural || token == self.kind.to_ascii_lowercase() {
            return true;
        }
        plural_for_alias(&token) == Some(self.plural.as_str())
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.plural)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.plural)
        }
    }
}

/// Map key for a resource kind.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub group: String,
    pub version: String,
    pub plural: String,
}

fn plural_for_alias(token: &str) -> Option<&'static str> {
    let plural = match token {
        "po" | "pod" => "pods",
        "cj" | "cronjob" | "cron-job" | "cron-jobs" => "cronjobs",
        "ds" | "daemonset" | "daemon-set" | "daemon-sets" => "daemonsets",
        "deploy" | "deployment" | "dp" => "deployments",
        "rs" | "replicaset" | "replica-set" | "replica-sets" => "replicasets",
        "rc" | "replicationcontroller" => "replicationcontrollers",
        "sts" | "statefulset" => "statefulsets",
        "job" => "jobs",
        "svc" | "service" => "services",
        "ing" | "ingress" => "ingresses",
        "ingclass" | "ingressclass" | "ic" => "ingressclasses",
        "cm" | "configmap" | "config-map" | "config-maps" => "configmaps",
        "pvc" | "persistentvolumeclaim" => "persistentvolumeclaims",
        "secret" => "secrets",
        "sc" | "storageclass" => "storageclasses",
        "pv" | "persistentvolume" => "persistentvolumes",
        "sa" | "serviceaccount" => "serviceaccounts",
        "role" => "roles",
        "rb" | "rolebinding" => "rolebindings",
        "crole" | "clusterrole" => "clusterroles",
        "crb" | "clusterrolebinding" => "clusterrolebindings",
        "np" | "networkpolicy" => "networkpolicies",
        "no" | "node" => "nodes",
        "ev" | "event" => "events",
        "ns" | "namespace" => "namespaces",
        "crd" | "crds" | "customresourcedefinition" => "customresourcedefinitions",
        _ => return None,
    };
    Some(plural)
}

/// Identity of an object. UID wins when both sides carry one.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
    pub uid: Option<String>,
}

impl ObjectKey {
    pub fn of(object: &Object) -> Self {
        Self {
            namespace: object.namespace(),
            name: object.name_any(),
            uid: object.uid(),
        }
    }

    pub fn same_object(&self, other: &ObjectKey) -> bool {
        match (&self.uid, &other.uid) {
            (Some(left), Some(right)) => left == right,
            _ => self.namespace == other.namespace && self.name == other.name,
        }
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Parsed form of the search text.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SearchFilter {
    pub namespaces: Vec<String>,
    pub terms: Vec<String>,
}

impl SearchFilter {
    pub fn parse(text: &str) -> Self {
        let mut filter = Self::default();
        for token in text.split_whitespace() {
            let namespace = token
                .strip_prefix("ns:")
                .or_else(|| token.strip_prefix("namespace:"));
            match namespace {
                Some(namespace) if !namespace.is_empty() => {
                    filter.namespaces.push(namespace.to_string())
                }
                Some(_) => {}
                None => filter.terms.push(token.to_ascii_lowercase()),
            }
        }
        filter
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty() && self.terms.is_empty()
    }

    pub fn matches(&self, object: &Object) -> bool {
        if !self.namespaces.is_empty() {
            let Some(namespace) = object.metadata.namespace.as_deref() else {
                return false;
            };
            if !self.namespaces.iter().any(|candidate| candidate == namespace) {
                return false;
            }
        }

        let name = object.name_any().to_ascii_lowercase();
        self.terms.iter().all(|term| {
            if name.contains(term.as_str()) {
                return true;
            }
            object.labels().iter().any(|(key, value)| {
                key.to_ascii_lowercase().contains(term.as_str())
                    || value.to_ascii_lowercase().contains(term.as_str())
            })
        })
    }
}
