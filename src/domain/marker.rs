//! The in-place update marker and helpers over pod conditions and containers.
//!
//! The same literal is used as the annotation key that opts a pod (or
//! deployment) into in-place updates and as the pod condition type that gates
//! its readiness.

use chrono::{SecondsFormat, Utc};
use kube::{Resource, ResourceExt};

use crate::core::client::kube_resources::{Pod, PodCondition, PodStatus, Time};
use crate::errors::AppError;

/// Annotation key marking a pod or deployment as managed by in-place update.
pub const INPLACE_UPDATE_ANNOTATION: &str = "InPlaceUpdate";

/// Pod condition type toggled around an in-place update.
pub const INPLACE_UPDATE_CONDITION: &str = INPLACE_UPDATE_ANNOTATION;

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

/// `namespace/name`, or just `name` for cluster-scoped objects.
pub fn meta_namespace_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, obj.name_any()),
        _ => obj.name_any(),
    }
}

/// Inverse of `meta_namespace_key`.
pub fn split_meta_namespace_key(key: &str) -> Result<(String, String), AppError> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((String::new(), name.to_string())),
        [ns, name] if !name.is_empty() => Ok((ns.to_string(), name.to_string())),
        _ => Err(AppError::InvalidKey(key.to_string())),
    }
}

/// Current time as a Kubernetes `Time`.
pub fn now_time() -> Option<Time> {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    serde_json::from_value(serde_json::Value::String(now)).ok()
}

pub fn has_marker_annotation(pod: &Pod) -> bool {
    pod.annotations().contains_key(INPLACE_UPDATE_ANNOTATION)
}

pub fn find_marker_condition(pod: &Pod) -> Option<&PodCondition> {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == INPLACE_UPDATE_CONDITION))
}

/// Append a `True` marker condition unless one exists. Returns whether the pod changed.
pub fn ensure_marker_condition(pod: &mut Pod) -> bool {
    if find_marker_condition(pod).is_some() {
        return false;
    }

    let now = now_time();
    pod.status
        .get_or_insert_with(PodStatus::default)
        .conditions
        .get_or_insert_with(Vec::new)
        .push(PodCondition {
            type_: INPLACE_UPDATE_CONDITION.to_string(),
            status: CONDITION_TRUE.to_string(),
            last_probe_time: now.clone(),
            last_transition_time: now,
            ..Default::default()
        });
    true
}

/// Set every marker condition to `status` with fresh timestamps, appending one if none exists.
pub fn set_marker_condition_status(pod: &mut Pod, status: &str) {
    let now = now_time();
    let conditions = pod
        .status
        .get_or_insert_with(PodStatus::default)
        .conditions
        .get_or_insert_with(Vec::new);

    let mut found = false;
    for cond in conditions
        .iter_mut()
        .filter(|c| c.type_ == INPLACE_UPDATE_CONDITION)
    {
        cond.status = status.to_string();
        cond.last_probe_time = now.clone();
        cond.last_transition_time = now.clone();
        found = true;
    }

    if !found {
        conditions.push(PodCondition {
            type_: INPLACE_UPDATE_CONDITION.to_string(),
            status: status.to_string(),
            last_probe_time: now.clone(),
            last_transition_time: now,
            ..Default::default()
        });
    }
}

pub fn has_container(pod: &Pod, container: &str) -> bool {
    pod.spec
        .as_ref()
        .is_some_and(|s| s.containers.iter().any(|c| c.name == container))
}

/// `imageID` reported in the pod status for `container`.
pub fn container_image_id<'a>(pod: &'a Pod, container: &str) -> Option<&'a str> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|s| s.name == container))
        .map(|s| s.image_id.as_str())
}

/// Point `container` at `image`. Returns `false` if the pod has no such container.
pub fn set_container_image(pod: &mut Pod, container: &str, image: &str) -> bool {
    let Some(spec) = pod.spec.as_mut() else {
        return false;
    };
    match spec.containers.iter_mut().find(|c| c.name == container) {
        Some(c) => {
            c.image = Some(image.to_string());
            true
        }
        None => false,
    }
}
