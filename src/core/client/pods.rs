use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use crate::core::client::kube_resources::Pod;
use crate::errors::AppError;

/// Fetch a single pod by name and namespace
pub async fn fetch_pod_by_name_and_namespace(
    client: &Client,
    namespace: &str,
    pod_name: &str,
) -> Result<Pod, AppError> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pod = pods.get(pod_name).await?;

    debug!("Fetched pod: {}/{}", namespace, pod_name);
    Ok(pod)
}

/// Fetch pods in a namespace filtered by label selector (e.g. "app=web")
pub async fn fetch_pods_by_label(
    client: &Client,
    namespace: &str,
    label_selector: &str,
) -> Result<Vec<Pod>, AppError> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(label_selector);
    let pod_list = pods.list(&lp).await?;

    debug!(
        "Found {} pod(s) in '{}' with label '{}'",
        pod_list.items.len(),
        namespace,
        label_selector
    );
    Ok(pod_list.items)
}

/// Replace the pod spec. The pod's resourceVersion is sent as-is, so a stale
/// copy is rejected with a conflict
pub async fn replace_pod(client: &Client, pod: &Pod) -> Result<Pod, AppError> {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);

    let updated = pods.replace(&name, &PostParams::default(), pod).await?;

    debug!("Replaced pod: {}/{}", namespace, name);
    Ok(updated)
}

/// Write the pod status subresource, guarded by the pod's resourceVersion
pub async fn replace_pod_status(client: &Client, pod: &Pod) -> Result<Pod, AppError> {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);

    // A resourceVersion inside a merge patch turns it into a compare-and-swap
    let patch = json!({
        "metadata": { "resourceVersion": pod.resource_version() },
        "status": pod.status,
    });
    let updated = pods
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    debug!("Updated pod status: {}/{}", namespace, name);
    Ok(updated)
}
