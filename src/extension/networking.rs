use super::{Column, DetailProperty, Extension, typed_at};
use crate::k8s::Cluster;
use crate::model::{Object, ResourceKind};
use k8s_openapi::api::networking::v1::{IngressBackend, IngressRule};
use std::sync::Arc;

pub(super) fn new(_cluster: &Arc<Cluster>) -> Box<dyn Extension> {
    Box::new(Networking)
}

/// Ingress host and routing summaries.
pub struct Networking;

fn is_ingress(kind: &ResourceKind) -> bool {
    kind.is("networking.k8s.io", "v1", "ingresses")
}

impl Extension for Networking {
    fn name(&self) -> &str {
        "networking"
    }

    fn columns(&self, kind: &ResourceKind, mut columns: Vec<Column>) -> Vec<Column> {
        if is_ingress(kind) {
            columns.push(Column::new("Hosts", 70, |cell, object| {
                cell.set_label(&hosts(object).join(", "))
            }));
        }
        columns
    }

    fn object_properties(
        &self,
        kind: &ResourceKind,
        object: &Object,
        mut properties: Vec<DetailProperty>,
    ) -> Vec<DetailProperty> {
        if !is_ingress(kind) {
            return properties;
        }
        let Some(rules) = ingress_rules(object) else {
            return properties;
        };

        let rules = rules
            .iter()
            .map(|rule| {
                let paths = rule
                    .http
                    .as_ref()
                    .map(|http| {
                        http.paths
                            .iter()
                            .map(|path| {
                                DetailProperty::text(
                                    format!(
                                        "{} {}",
                                        path.path_type,
                                        path.path.as_deref().unwrap_or("")
                                    ),
                                    backend_target(&path.backend),
                                )
                            })
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                DetailProperty::group(rule.host.clone().unwrap_or_else(|| "*".to_string()), paths)
            })
            .collect::<Vec<_>>();
        properties.push(DetailProperty::group("Rules", rules));
        properties
    }
}

fn ingress_rules(object: &Object) -> Option<Vec<IngressRule>> {
    typed_at(object, "/spec/rules")
}

fn hosts(object: &Object) -> Vec<String> {
    ingress_rules(object)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|rule| rule.host)
        .collect()
}

fn backend_target(backend: &IngressBackend) -> String {
    if let Some(service) = &backend.service {
        let port = service
            .port
            .as_ref()
            .map(|port| match (&port.name, port.number) {
                (Some(name), _) => name.clone(),
                (None, Some(number)) => number.to_string(),
                (None, None) => String::new(),
            })
            .unwrap_or_default();
        return format!("{}:{port}", service.name);
    }
    if let Some(resource) = &backend.resource {
        return format!("{}/{}", resource.kind, resource.name);
    }
    "-".to_string()
}
