use super::{Column, DetailProperty, Extension, typed_at};
use crate::k8s::Cluster;
use crate::model::{Object, ResourceKind};
use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
use std::sync::Arc;

pub(super) fn new(_cluster: &Arc<Cluster>) -> Box<dyn Extension> {
    Box::new(Workloads)
}

/// Pod and deployment status at a glance.
pub struct Workloads;

impl Extension for Workloads {
    fn name(&self) -> &str {
        "workloads"
    }

    fn columns(&self, kind: &ResourceKind, mut columns: Vec<Column>) -> Vec<Column> {
        if kind.is("", "v1", "pods") {
            columns.push(Column::new("Status", 60, |cell, object| {
                cell.set_label(&pod_status(object))
            }));
            columns.push(Column::new("Restarts", 50, |cell, object| {
                cell.set_label(&pod_restarts(object).to_string())
            }));
        } else if kind.is("apps", "v1", "deployments") {
            columns.push(Column::new("Ready", 60, |cell, object| {
                cell.set_label(&deployment_ready(object))
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
        if !kind.is("", "v1", "pods") {
            return properties;
        }
        let Some(spec) = typed_at::<PodSpec>(object, "/spec") else {
            return properties;
        };

        let containers = spec
            .containers
            .iter()
            .map(|container| {
                DetailProperty::text(
                    container.name.clone(),
                    container.image.clone().unwrap_or_else(|| "-".to_string()),
                )
            })
            .collect();
        properties.push(DetailProperty::group("Containers", containers));
        properties
    }
}

fn pod_status(object: &Object) -> String {
    if object.metadata.deletion_timestamp.is_some() {
        return "Terminating".to_string();
    }
    typed_at::<PodStatus>(object, "/status")
        .and_then(|status| status.phase)
        .unwrap_or_else(|| "Unknown".to_string())
}

fn pod_restarts(object: &Object) -> i32 {
    typed_at::<PodStatus>(object, "/status")
        .and_then(|status| status.container_statuses)
        .unwrap_or_default()
        .iter()
        .map(|container| container.restart_count)
        .sum()
}

fn deployment_ready(object: &Object) -> String {
    let desired = typed_at::<i32>(object, "/spec/replicas").unwrap_or(1);
    let ready = typed_at::<i32>(object, "/status/readyReplicas").unwrap_or(0);
    format!("{ready}/{desired}")
}
