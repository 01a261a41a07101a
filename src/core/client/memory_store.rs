//! In-memory `ResourceStore` and `PodLister`.
//!
//! Behaves like the API server for the operations the controller and the
//! updater use: resourceVersion compare-and-swap on writes, `NotFound` for
//! missing objects. It also records every successful write in order, can be
//! told to fail the next call of an operation, and can script the image IDs a
//! pod reports after its image is changed, standing in for the kubelet.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use kube::ResourceExt;
use serde_json::Value;

use crate::core::client::kube_resources::{
    ContainerStatus, Deployment, K8sContainer, Pod, PodSpec, PodStatus,
};
use crate::core::client::store::{PodLister, ResourceStore};
use crate::domain::marker::{find_marker_condition, meta_namespace_key};
use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GetPod,
    ListPods,
    UpdatePod,
    UpdatePodStatus,
    GetDeployment,
    PatchDeployment,
}

/// A successful write, as observed by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    /// Status write; carries the marker condition status after the write
    PodStatus {
        key: String,
        marker_status: Option<String>,
    },
    /// Spec write; carries `(container, image)` pairs after the write
    PodSpec {
        key: String,
        images: Vec<(String, String)>,
    },
    DeploymentPatch { key: String, patch: Value },
}

#[derive(Default)]
struct MemoryState {
    pods: BTreeMap<String, Pod>,
    deployments: BTreeMap<String, Deployment>,
    next_resource_version: u64,
    writes: Vec<StoreWrite>,
    injected: HashMap<(StoreOp, String), VecDeque<AppError>>,
    /// key -> (container, image IDs reported by successive gets once its image changed)
    image_id_scripts: HashMap<String, (String, VecDeque<String>)>,
    image_changed: HashMap<String, bool>,
}

impl MemoryState {
    fn bump(&mut self) -> String {
        self.next_resource_version += 1;
        self.next_resource_version.to_string()
    }

    fn take_injected(&mut self, op: StoreOp, key: &str) -> Option<AppError> {
        self.injected
            .get_mut(&(op, key.to_string()))
            .and_then(VecDeque::pop_front)
    }

    fn check_version(&self, key: &str, incoming: &Pod) -> Result<(), AppError> {
        let stored = self
            .pods
            .get(key)
            .ok_or_else(|| AppError::NotFound(format!("pod {key}")))?;

        match incoming.metadata.resource_version.as_deref() {
            Some(rv) if Some(rv) != stored.metadata.resource_version.as_deref() => {
                Err(AppError::Conflict(format!(
                    "pod {key}: resourceVersion {rv} is stale"
                )))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct MemoryResourceStore {
    state: Mutex<MemoryState>,
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or overwrite a pod, assigning a fresh resourceVersion.
    pub fn insert_pod(&self, mut pod: Pod) {
        let mut state = self.lock();
        let key = meta_namespace_key(&pod);
        pod.metadata.resource_version = Some(state.bump());
        state.pods.insert(key, pod);
    }

    pub fn insert_deployment(&self, mut deployment: Deployment) {
        let mut state = self.lock();
        let key = meta_namespace_key(&deployment);
        deployment.metadata.resource_version = Some(state.bump());
        state.deployments.insert(key, deployment);
    }

    pub fn remove_pod(&self, key: &str) {
        self.lock().pods.remove(key);
    }

    pub fn pod(&self, key: &str) -> Option<Pod> {
        self.lock().pods.get(key).cloned()
    }

    pub fn deployment(&self, key: &str) -> Option<Deployment> {
        self.lock().deployments.get(key).cloned()
    }

    /// Fail the next call of `op` for `key` with `error`. Calls queue up.
    pub fn fail_next(&self, op: StoreOp, key: &str, error: AppError) {
        self.lock()
            .injected
            .entry((op, key.to_string()))
            .or_default()
            .push_back(error);
    }

    /// Once `container`'s image is changed, each later `get_pod` reports the
    /// next ID from `image_ids`; the last one sticks.
    pub fn script_image_ids(&self, key: &str, container: &str, image_ids: &[&str]) {
        self.lock().image_id_scripts.insert(
            key.to_string(),
            (
                container.to_string(),
                image_ids.iter().map(|s| s.to_string()).collect(),
            ),
        );
    }

    /// Simulate an unrelated concurrent write bumping the pod's resourceVersion.
    pub fn touch_pod(&self, key: &str) {
        let mut state = self.lock();
        let rv = state.bump();
        if let Some(pod) = state.pods.get_mut(key) {
            pod.metadata.resource_version = Some(rv);
        }
    }

    pub fn writes(&self) -> Vec<StoreWrite> {
        self.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }
}

fn advance_image_id(state: &mut MemoryState, key: &str) {
    if !state.image_changed.get(key).copied().unwrap_or(false) {
        return;
    }
    let Some((container, ids)) = state.image_id_scripts.get_mut(key) else {
        return;
    };
    let next = if ids.len() > 1 {
        ids.pop_front()
    } else {
        ids.front().cloned()
    };
    let (Some(next), container) = (next, container.clone()) else {
        return;
    };

    if let Some(pod) = state.pods.get_mut(key) {
        let statuses = pod
            .status
            .get_or_insert_with(PodStatus::default)
            .container_statuses
            .get_or_insert_with(Vec::new);
        match statuses.iter_mut().find(|s| s.name == container) {
            Some(status) => status.image_id = next,
            None => statuses.push(ContainerStatus {
                name: container,
                image_id: next,
                ..Default::default()
            }),
        }
    }
}

fn container_images(pod: &Pod) -> Vec<(String, String)> {
    pod.spec
        .as_ref()
        .map(|s| {
            s.containers
                .iter()
                .map(|c| (c.name.clone(), c.image.clone().unwrap_or_default()))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, AppError> {
        let mut state = self.lock();
        let key = format!("{namespace}/{name}");
        if let Some(err) = state.take_injected(StoreOp::GetPod, &key) {
            return Err(err);
        }

        advance_image_id(&mut state, &key);
        state
            .pods
            .get(&key)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("pod {key}")))
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, AppError> {
        let mut state = self.lock();
        if let Some(err) = state.take_injected(StoreOp::ListPods, namespace) {
            return Err(err);
        }

        // Only equality terms are understood here
        let terms: Vec<(&str, &str)> = label_selector
            .split(',')
            .filter_map(|t| t.split_once('='))
            .collect();

        Ok(state
            .pods
            .values()
            .filter(|p| p.namespace().as_deref() == Some(namespace))
            .filter(|p| {
                let labels = p.labels();
                terms
                    .iter()
                    .all(|(k, v)| labels.get(*k).map(String::as_str) == Some(*v))
            })
            .cloned()
            .collect())
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, AppError> {
        let mut state = self.lock();
        let key = meta_namespace_key(pod);
        if let Some(err) = state.take_injected(StoreOp::UpdatePod, &key) {
            return Err(err);
        }
        state.check_version(&key, pod)?;

        let rv = state.bump();
        let Some(stored) = state.pods.get_mut(&key) else {
            return Err(AppError::NotFound(format!("pod {key}")));
        };

        let before = container_images(stored);
        stored.spec = pod.spec.clone();
        stored.metadata.annotations = pod.metadata.annotations.clone();
        stored.metadata.labels = pod.metadata.labels.clone();
        stored.metadata.resource_version = Some(rv);
        let after = container_images(stored);
        let updated = stored.clone();

        if before != after {
            state.image_changed.insert(key.clone(), true);
        }
        state.writes.push(StoreWrite::PodSpec { key, images: after });
        Ok(updated)
    }

    async fn update_pod_status(&self, pod: &Pod) -> Result<Pod, AppError> {
        let mut state = self.lock();
        let key = meta_namespace_key(pod);
        if let Some(err) = state.take_injected(StoreOp::UpdatePodStatus, &key) {
            return Err(err);
        }
        state.check_version(&key, pod)?;

        let rv = state.bump();
        let Some(stored) = state.pods.get_mut(&key) else {
            return Err(AppError::NotFound(format!("pod {key}")));
        };

        stored.status = pod.status.clone();
        stored.metadata.resource_version = Some(rv);
        let marker_status = find_marker_condition(stored).map(|c| c.status.clone());
        let updated = stored.clone();

        state.writes.push(StoreWrite::PodStatus { key, marker_status });
        Ok(updated)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, AppError> {
        let mut state = self.lock();
        let key = format!("{namespace}/{name}");
        if let Some(err) = state.take_injected(StoreOp::GetDeployment, &key) {
            return Err(err);
        }

        state
            .deployments
            .get(&key)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("deployment {key}")))
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        merge_patch: &Value,
    ) -> Result<Deployment, AppError> {
        let mut state = self.lock();
        let key = format!("{namespace}/{name}");
        if let Some(err) = state.take_injected(StoreOp::PatchDeployment, &key) {
            return Err(err);
        }

        let rv = state.bump();
        let Some(stored) = state.deployments.get_mut(&key) else {
            return Err(AppError::NotFound(format!("deployment {key}")));
        };

        // Annotations are the only field the updater patches
        if let Some(annotations) = merge_patch
            .pointer("/metadata/annotations")
            .and_then(Value::as_object)
        {
            let target = stored.annotations_mut();
            for (k, v) in annotations {
                match v.as_str() {
                    Some(s) => {
                        target.insert(k.clone(), s.to_string());
                    }
                    None => {
                        target.remove(k);
                    }
                }
            }
        }
        stored.metadata.resource_version = Some(rv);
        let updated = stored.clone();

        state.writes.push(StoreWrite::DeploymentPatch {
            key,
            patch: merge_patch.clone(),
        });
        Ok(updated)
    }
}

impl PodLister for MemoryResourceStore {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.lock()
            .pods
            .get(&format!("{namespace}/{name}"))
            .cloned()
            .map(Arc::new)
    }
}

/// Test fixture: a pod with the given `(container, image, imageID)` triples.
pub fn sample_pod(namespace: &str, name: &str, containers: &[(&str, &str, &str)]) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.namespace = Some(namespace.to_string());
    pod.metadata.name = Some(name.to_string());
    pod.spec = Some(PodSpec {
        containers: containers
            .iter()
            .map(|(c, image, _)| K8sContainer {
                name: c.to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    });
    pod.status = Some(PodStatus {
        container_statuses: Some(
            containers
                .iter()
                .map(|(c, image, image_id)| ContainerStatus {
                    name: c.to_string(),
                    image: image.to_string(),
                    image_id: image_id.to_string(),
                    ..Default::default()
                })
                .collect(),
        ),
        ..Default::default()
    });
    pod
}
