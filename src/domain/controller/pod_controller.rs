use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::client::store::{PodLister, ResourceStore};
use crate::core::client::watchers::PodEvent;
use crate::core::queue::RateLimitingQueue;
use crate::domain::marker::{
    ensure_marker_condition, find_marker_condition, has_marker_annotation,
    split_meta_namespace_key,
};
use crate::errors::AppError;

/// Runtime knobs fixed at controller startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub workers: usize,
    /// Upper bound on the wait for the pod cache to fill
    pub cache_sync_timeout: Duration,
    /// Give up on a key after this many rate-limited retries; `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            cache_sync_timeout: Duration::from_secs(60),
            max_retries: None,
        }
    }
}

/// What `process` did for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Pod is not opted in via annotation
    NotManaged,
    /// Marker condition already present
    AlreadySynced,
    /// Marker condition appended and written
    ConditionAdded,
}

/// Keeps the in-place update condition present on every annotated pod.
pub struct PodController<S, L> {
    name: String,
    store: Arc<S>,
    lister: Arc<L>,
    queue: RateLimitingQueue<String>,
    settings: ControllerSettings,
}

impl<S, L> PodController<S, L>
where
    S: ResourceStore + 'static,
    L: PodLister + 'static,
{
    pub fn new(
        store: Arc<S>,
        lister: Arc<L>,
        queue: RateLimitingQueue<String>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            name: "pod-controller".to_string(),
            store,
            lister,
            queue,
            settings,
        }
    }

    pub fn queue(&self) -> &RateLimitingQueue<String> {
        &self.queue
    }

    pub fn enqueue(&self, event: &PodEvent) {
        self.queue.add(event.key());
    }

    /// Converge one pod's marker condition with its annotation.
    ///
    /// Reads from the local cache; writes at most one status update.
    pub async fn process(&self, key: &str) -> Result<SyncOutcome, AppError> {
        let (namespace, name) = split_meta_namespace_key(key)?;
        debug!("Syncing pod {}/{}", namespace, name);

        let cached = self.lister.get(&namespace, &name).ok_or_else(|| {
            AppError::NotFound(format!("pod {key} not in cache"))
        })?;

        if !has_marker_annotation(&cached) {
            return Ok(SyncOutcome::NotManaged);
        }
        if find_marker_condition(&cached).is_some() {
            return Ok(SyncOutcome::AlreadySynced);
        }

        // Never mutate the cached object
        let mut pod = (*cached).clone();
        ensure_marker_condition(&mut pod);

        info!(pod = %key, "Adding in-place update condition");
        self.store.update_pod_status(&pod).await.map_err(|e| {
            error!(pod = %key, error = %e, "Pod status update failed");
            e
        })?;

        Ok(SyncOutcome::ConditionAdded)
    }

    /// Pull one key, process it and settle its retry state.
    /// Returns `false` once the queue has shut down.
    async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let result = self.process(&key).await;
        self.handle_result(&key, result);
        self.queue.done(&key);
        true
    }

    fn handle_result(&self, key: &String, result: Result<SyncOutcome, AppError>) {
        let err = match result {
            Ok(outcome) => {
                debug!(pod = %key, ?outcome, "Pod synced");
                self.queue.forget(key);
                return;
            }
            Err(err) => err,
        };

        let requeues = self.queue.num_requeues(key);
        let within_budget = self.settings.max_retries.is_none_or(|max| requeues < max);

        if err.is_retryable() && within_budget {
            warn!(pod = %key, error = %err, requeues, "Sync failed, requeuing with backoff");
            self.queue.add_rate_limited(key.clone());
        } else {
            error!(pod = %key, error = %err, requeues, "Sync failed, dropping key");
            self.queue.forget(key);
        }
    }

    async fn run_worker(self: Arc<Self>) {
        while self.process_next_work_item().await {}
    }

    /// Run until `cancel` fires.
    ///
    /// Events are queued from the start; workers begin once `cache_synced`
    /// resolves to `true` within `cache_sync_timeout`, otherwise startup aborts.
    /// On cancel the queue is shut down and all workers are joined.
    pub async fn run<F>(
        self: Arc<Self>,
        mut events: mpsc::Receiver<PodEvent>,
        cache_synced: F,
        cancel: CancellationToken,
    ) -> Result<(), AppError>
    where
        F: Future<Output = bool> + Send,
    {
        info!("Starting {} controller", self.name);

        let pump = {
            let controller = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = events.recv() => event,
                    };
                    match event {
                        Some(event) => controller.enqueue(&event),
                        None => break,
                    }
                }
            })
        };

        let synced = tokio::select! {
            _ = cancel.cancelled() => {
                self.shut_down(pump, Vec::new()).await;
                return Ok(());
            }
            synced = tokio::time::timeout(self.settings.cache_sync_timeout, cache_synced) => {
                matches!(synced, Ok(true))
            }
        };

        if !synced {
            error!("Timed out waiting for {} caches to sync", self.name);
            self.shut_down(pump, Vec::new()).await;
            return Err(AppError::InternalError(format!(
                "{} cache did not sync within {:?}",
                self.name, self.settings.cache_sync_timeout
            )));
        }
        info!("Caches synced for {} controller", self.name);

        let workers: Vec<JoinHandle<()>> = (0..self.settings.workers.max(1))
            .map(|_| tokio::spawn(self.clone().run_worker()))
            .collect();

        cancel.cancelled().await;
        self.shut_down(pump, workers).await;
        Ok(())
    }

    async fn shut_down(&self, pump: JoinHandle<()>, workers: Vec<JoinHandle<()>>) {
        info!("Shutting down {} controller", self.name);
        pump.abort();
        self.queue.shut_down();

        for result in join_all(workers).await {
            if let Err(e) = result {
                error!("Worker task failed: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client::memory_store::{sample_pod, MemoryResourceStore, StoreOp, StoreWrite};
    use crate::core::queue::ItemExponentialFailureRateLimiter;
    use crate::domain::marker::{CONDITION_TRUE, INPLACE_UPDATE_ANNOTATION};
    use kube::ResourceExt;

    fn controller(
        store: Arc<MemoryResourceStore>,
        settings: ControllerSettings,
    ) -> PodController<MemoryResourceStore, MemoryResourceStore> {
        let queue = RateLimitingQueue::new(Arc::new(ItemExponentialFailureRateLimiter::<String>::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
        )));
        PodController::new(store.clone(), store, queue, settings)
    }

    fn annotated_pod(ns: &str, name: &str) -> crate::core::client::kube_resources::Pod {
        let mut pod = sample_pod(ns, name, &[("app", "nginx:1", "sha:aaa")]);
        pod.annotations_mut()
            .insert(INPLACE_UPDATE_ANNOTATION.to_string(), String::new());
        pod
    }

    #[tokio::test]
    async fn test_unannotated_pod_is_left_alone() {
        let store = MemoryResourceStore::new().shared();
        store.insert_pod(sample_pod("ns", "web-1", &[("app", "nginx:1", "sha:aaa")]));
        let ctrl = controller(store.clone(), ControllerSettings::default());

        assert_eq!(ctrl.process("ns/web-1").await.unwrap(), SyncOutcome::NotManaged);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_annotation_adds_condition_with_one_write() {
        let store = MemoryResourceStore::new().shared();
        store.insert_pod(sample_pod("ns", "web-1", &[("app", "nginx:1", "sha:aaa")]));
        let ctrl = controller(store.clone(), ControllerSettings::default());

        assert_eq!(ctrl.process("ns/web-1").await.unwrap(), SyncOutcome::NotManaged);
        assert_eq!(store.write_count(), 0);

        store.insert_pod(annotated_pod("ns", "web-1"));
        assert_eq!(
            ctrl.process("ns/web-1").await.unwrap(),
            SyncOutcome::ConditionAdded
        );

        assert_eq!(
            store.writes(),
            vec![StoreWrite::PodStatus {
                key: "ns/web-1".into(),
                marker_status: Some(CONDITION_TRUE.into()),
            }]
        );
    }

    #[tokio::test]
    async fn test_existing_condition_issues_no_write() {
        let store = MemoryResourceStore::new().shared();
        store.insert_pod(annotated_pod("ns", "web-1"));
        let ctrl = controller(store.clone(), ControllerSettings::default());

        ctrl.process("ns/web-1").await.unwrap();
        assert_eq!(store.write_count(), 1);

        assert_eq!(
            ctrl.process("ns/web-1").await.unwrap(),
            SyncOutcome::AlreadySynced
        );
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_pod_is_retryable_not_found() {
        let store = MemoryResourceStore::new().shared();
        let ctrl = controller(store, ControllerSettings::default());

        let err = ctrl.process("ns/gone").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_key_is_dropped() {
        let store = MemoryResourceStore::new().shared();
        let ctrl = controller(store, ControllerSettings::default());

        ctrl.queue().add("a/b/c".to_string());
        assert!(ctrl.process_next_work_item().await);

        assert_eq!(ctrl.queue().num_requeues(&"a/b/c".to_string()), 0);
        assert!(ctrl.queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_is_retried_with_backoff() {
        let store = MemoryResourceStore::new().shared();
        store.insert_pod(annotated_pod("ns", "web-1"));
        store.fail_next(
            StoreOp::UpdatePodStatus,
            "ns/web-1",
            AppError::Conflict("stale".into()),
        );
        let ctrl = controller(store.clone(), ControllerSettings::default());
        let key = "ns/web-1".to_string();

        ctrl.queue().add(key.clone());
        assert!(ctrl.process_next_work_item().await);
        assert_eq!(ctrl.queue().num_requeues(&key), 1);
        assert_eq!(store.write_count(), 0);

        // Requeued after the 10ms backoff, then succeeds and is forgotten
        assert!(ctrl.process_next_work_item().await);
        assert_eq!(ctrl.queue().num_requeues(&key), 0);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_drops_key() {
        let store = MemoryResourceStore::new().shared();
        let settings = ControllerSettings {
            max_retries: Some(2),
            ..Default::default()
        };
        let ctrl = controller(store, settings);
        let key = "ns/gone".to_string();

        ctrl.queue().add(key.clone());
        for _ in 0..3 {
            assert!(ctrl.process_next_work_item().await);
        }

        // Two retries spent, third failure drops the key
        assert_eq!(ctrl.queue().num_requeues(&key), 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(ctrl.queue().is_empty());
    }

    #[tokio::test]
    async fn test_run_aborts_when_cache_never_syncs() {
        let store = MemoryResourceStore::new().shared();
        let settings = ControllerSettings {
            cache_sync_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let ctrl = Arc::new(controller(store, settings));
        let (_tx, rx) = mpsc::channel(8);

        let result = ctrl
            .clone()
            .run(rx, std::future::pending::<bool>(), CancellationToken::new())
            .await;

        assert!(matches!(result, Err(AppError::InternalError(_))));
        assert!(ctrl.queue().is_shutting_down());
    }
}
