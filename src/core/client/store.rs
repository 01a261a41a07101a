use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::reflector::{self, ObjectRef};
use kube::Client;
use serde_json::Value;

use crate::core::client::deployments::{fetch_deployment_by_name_and_namespace, patch_deployment};
use crate::core::client::kube_resources::{Deployment, Pod};
use crate::core::client::pods::{
    fetch_pod_by_name_and_namespace, fetch_pods_by_label, replace_pod, replace_pod_status,
};
use crate::errors::AppError;

/// Read/write access to the cluster's authoritative pod and deployment state.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, AppError>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, AppError>;

    /// Replace the pod spec; rejected with `Conflict` if the resourceVersion is stale.
    async fn update_pod(&self, pod: &Pod) -> Result<Pod, AppError>;

    /// Write the pod status; rejected with `Conflict` if the resourceVersion is stale.
    async fn update_pod_status(&self, pod: &Pod) -> Result<Pod, AppError>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, AppError>;

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        merge_patch: &Value,
    ) -> Result<Deployment, AppError>;
}

/// Read-only view over a local pod cache (no API call).
///
/// Returned pods are shared with the cache and must be cloned before mutation.
pub trait PodLister: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>>;
}

impl PodLister for reflector::Store<Pod> {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        reflector::Store::get(self, &ObjectRef::new(name).within(namespace))
    }
}

/// `ResourceStore` backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, AppError> {
        fetch_pod_by_name_and_namespace(&self.client, namespace, name).await
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, AppError> {
        fetch_pods_by_label(&self.client, namespace, label_selector).await
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, AppError> {
        replace_pod(&self.client, pod).await
    }

    async fn update_pod_status(&self, pod: &Pod) -> Result<Pod, AppError> {
        replace_pod_status(&self.client, pod).await
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, AppError> {
        fetch_deployment_by_name_and_namespace(&self.client, namespace, name).await
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        merge_patch: &Value,
    ) -> Result<Deployment, AppError> {
        patch_deployment(&self.client, namespace, name, merge_patch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::runtime::watcher;

    #[test]
    fn test_reflector_store_lookup_by_namespace_and_name() {
        let (reader, mut writer) = reflector::store::<Pod>();

        let mut pod = Pod::default();
        pod.metadata.name = Some("web-1".into());
        pod.metadata.namespace = Some("ns".into());
        writer.apply_watcher_event(&watcher::Event::Apply(pod));

        assert!(PodLister::get(&reader, "ns", "web-1").is_some());
        assert!(PodLister::get(&reader, "other", "web-1").is_none());
    }
}
