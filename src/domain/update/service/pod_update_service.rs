use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use validator::Validate;

use crate::core::client::kube_resources::Pod;
use crate::core::client::store::ResourceStore;
use crate::core::util::retry::retry_on_conflict;
use crate::core::util::wait::{poll_until, sleep_or_cancel, PollError};
use crate::domain::marker::{
    container_image_id, has_container, set_container_image, set_marker_condition_status,
    CONDITION_FALSE, CONDITION_TRUE,
};
use crate::domain::update::dto::{
    PodUpdateFailure, PodUpdateReport, PodUpdateRequest, UpdateStep, UpdateTiming,
};
use crate::errors::AppError;

fn at(step: UpdateStep) -> impl Fn(AppError) -> PodUpdateFailure {
    move |error| PodUpdateFailure { step, error }
}

/// Replaces a container image on a running pod without recreating it.
///
/// The pod is taken out of rotation through the marker condition, given a
/// grace period to drain, has its image swapped, and is put back once the
/// kubelet reports a new image ID for the container.
pub struct PodUpdateService<S> {
    store: Arc<S>,
    timing: UpdateTiming,
    cancel: CancellationToken,
}

impl<S> Clone for PodUpdateService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            timing: self.timing,
            cancel: self.cancel.clone(),
        }
    }
}

impl<S: ResourceStore> PodUpdateService<S> {
    pub fn new(store: Arc<S>, timing: UpdateTiming, cancel: CancellationToken) -> Self {
        Self {
            store,
            timing,
            cancel,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn timing(&self) -> &UpdateTiming {
        &self.timing
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Validate `req` and update a single pod.
    pub async fn update(&self, req: &PodUpdateRequest) -> Result<PodUpdateReport, AppError> {
        req.validate()?;
        self.timing.check()?;

        self.execute(req).await.map_err(|failure| {
            warn!(
                pod = %format!("{}/{}", req.namespace, req.name),
                step = %failure.step,
                "In-place update failed: {}",
                failure.error
            );
            failure.error
        })
    }

    /// Run the update steps for an already validated request.
    pub async fn execute(&self, req: &PodUpdateRequest) -> Result<PodUpdateReport, PodUpdateFailure> {
        let key = format!("{}/{}", req.namespace, req.name);
        let container = req.container.as_str();

        if self.cancel.is_cancelled() {
            return Err(at(UpdateStep::Fetch)(AppError::Cancelled(format!(
                "update of {key} not started"
            ))));
        }

        info!(pod = %key, "Fetching pod");
        let pod = self
            .store
            .get_pod(&req.namespace, &req.name)
            .await
            .map_err(at(UpdateStep::Fetch))?;

        if !has_container(&pod, container) {
            return Err(at(UpdateStep::CaptureBaseline)(AppError::Validation(format!(
                "pod {key} has no container named {container}"
            ))));
        }
        let baseline = container_image_id(&pod, container)
            .unwrap_or_default()
            .to_string();
        info!(pod = %key, container, baseline = %baseline, "Captured baseline image ID");

        let unready = self.mark_unready(&key, pod).await?;

        info!(pod = %key, grace = ?self.timing.grace_period, "Waiting for traffic to drain");
        if !sleep_or_cancel(self.timing.grace_period, &self.cancel).await {
            return Err(at(UpdateStep::GraceWait)(AppError::Cancelled(format!(
                "grace wait for {key}"
            ))));
        }

        self.mutate_image(&key, req, unready).await?;

        let (verified, new_image_id, poll_attempts) =
            self.verify_image(&key, req, &baseline).await?;

        self.mark_ready(&key, verified).await?;

        Ok(PodUpdateReport {
            baseline_image_id: baseline,
            new_image_id,
            poll_attempts,
        })
    }

    async fn mark_unready(&self, key: &str, mut pod: Pod) -> Result<Pod, PodUpdateFailure> {
        set_marker_condition_status(&mut pod, CONDITION_FALSE);
        let updated = self
            .store
            .update_pod_status(&pod)
            .await
            .map_err(at(UpdateStep::MarkUnready))?;
        info!(pod = %key, "Marked pod unready");
        Ok(updated)
    }

    /// Write the new image, re-reading the pod when the write loses a race.
    async fn mutate_image(
        &self,
        key: &str,
        req: &PodUpdateRequest,
        current: Pod,
    ) -> Result<Pod, PodUpdateFailure> {
        let store = self.store.as_ref();
        let first = &current;

        let updated = retry_on_conflict(self.timing.conflict_retry, move |attempt| async move {
            let mut pod = if attempt == 1 {
                first.clone()
            } else {
                store.get_pod(&req.namespace, &req.name).await?
            };

            if !set_container_image(&mut pod, &req.container, &req.image) {
                return Err(AppError::Validation(format!(
                    "pod {key} has no container named {}",
                    req.container
                )));
            }
            store.update_pod(&pod).await
        })
        .await
        .map_err(at(UpdateStep::MutateImage))?;

        info!(pod = %key, container = %req.container, image = %req.image, "Updated container image");
        Ok(updated)
    }

    /// Poll the pod until the container reports an image ID other than `baseline`.
    async fn verify_image(
        &self,
        key: &str,
        req: &PodUpdateRequest,
        baseline: &str,
    ) -> Result<(Pod, String, u32), PodUpdateFailure> {
        let store = self.store.as_ref();
        let container = req.container.as_str();

        let polled = poll_until(self.timing.poll_policy(), &self.cancel, move |attempt| async move {
            let pod = store.get_pod(&req.namespace, &req.name).await?;
            if !has_container(&pod, container) {
                return Err(AppError::VerificationFailed {
                    pod: key.to_string(),
                    reason: format!("container {container} disappeared"),
                });
            }

            let image_id = container_image_id(&pod, container)
                .unwrap_or_default()
                .to_string();
            if image_id.is_empty() || image_id == baseline {
                debug!(pod = %key, attempt, "Image ID unchanged");
                return Ok(None);
            }
            Ok(Some((pod, image_id)))
        })
        .await;

        match polled {
            Ok(((pod, image_id), attempts)) => {
                info!(pod = %key, image_id = %image_id, attempts, "New image is running");
                Ok((pod, image_id, attempts))
            }
            Err(PollError::TimedOut { attempts, elapsed }) => {
                Err(at(UpdateStep::PollVerify)(AppError::VerificationTimedOut {
                    pod: key.to_string(),
                    attempts,
                    elapsed,
                }))
            }
            Err(PollError::Cancelled { attempts }) => {
                Err(at(UpdateStep::PollVerify)(AppError::Cancelled(format!(
                    "verification of {key} after {attempts} poll(s)"
                ))))
            }
            Err(PollError::Failed { error, attempts }) => {
                let error = match error {
                    err @ AppError::VerificationFailed { .. } => err,
                    other => AppError::VerificationFailed {
                        pod: key.to_string(),
                        reason: format!("poll {attempts} failed: {other}"),
                    },
                };
                Err(at(UpdateStep::PollVerify)(error))
            }
        }
    }

    /// Flip the marker condition back to `True`.
    ///
    /// The write is guarded by the resourceVersion from the last poll and is
    /// not retried. The kubelet often rewrites pod status right after the
    /// container restarts, so a `Conflict` here is common; the pod is then
    /// left unready with the new image running and must be marked ready by
    /// rerunning the update or by hand.
    async fn mark_ready(&self, key: &str, mut pod: Pod) -> Result<Pod, PodUpdateFailure> {
        set_marker_condition_status(&mut pod, CONDITION_TRUE);
        match self.store.update_pod_status(&pod).await {
            Ok(updated) => {
                info!(pod = %key, "Marked pod ready");
                Ok(updated)
            }
            Err(e) => {
                warn!(pod = %key, "Image was updated but marking ready failed: {}", e);
                Err(at(UpdateStep::MarkReady)(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::core::client::memory_store::{sample_pod, MemoryResourceStore, StoreOp, StoreWrite};
    use crate::domain::marker::find_marker_condition;

    const KEY: &str = "ns/web-1";

    fn timing() -> UpdateTiming {
        UpdateTiming {
            grace_period: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(30),
            ..Default::default()
        }
    }

    fn request() -> PodUpdateRequest {
        PodUpdateRequest {
            namespace: "ns".into(),
            name: "web-1".into(),
            container: "app".into(),
            image: "nginx:2".into(),
        }
    }

    fn store_with_pod() -> Arc<MemoryResourceStore> {
        let store = MemoryResourceStore::new().shared();
        store.insert_pod(sample_pod(
            "ns",
            "web-1",
            &[("app", "nginx:1", "sha:aaa"), ("sidecar", "envoy:1", "sha:eee")],
        ));
        store
    }

    fn service(store: Arc<MemoryResourceStore>, timing: UpdateTiming) -> PodUpdateService<MemoryResourceStore> {
        PodUpdateService::new(store, timing, CancellationToken::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_unready_then_image_then_ready() {
        let store = store_with_pod();
        store.script_image_ids(KEY, "app", &["sha:bbb"]);

        let report = service(store.clone(), timing()).update(&request()).await.unwrap();
        assert_eq!(report.baseline_image_id, "sha:aaa");
        assert_eq!(report.new_image_id, "sha:bbb");

        assert_eq!(
            store.writes(),
            vec![
                StoreWrite::PodStatus {
                    key: KEY.into(),
                    marker_status: Some(CONDITION_FALSE.into()),
                },
                StoreWrite::PodSpec {
                    key: KEY.into(),
                    images: vec![
                        ("app".into(), "nginx:2".into()),
                        ("sidecar".into(), "envoy:1".into()),
                    ],
                },
                StoreWrite::PodStatus {
                    key: KEY.into(),
                    marker_status: Some(CONDITION_TRUE.into()),
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_verifies_on_third_poll() {
        let store = store_with_pod();
        store.script_image_ids(KEY, "app", &["sha:aaa", "sha:aaa", "sha:bbb"]);

        let report = service(store.clone(), timing()).update(&request()).await.unwrap();
        assert_eq!(report.poll_attempts, 3);

        let pod = store.pod(KEY).unwrap();
        assert_eq!(find_marker_condition(&pod).unwrap().status, CONDITION_TRUE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_is_observed() {
        let store = store_with_pod();
        store.script_image_ids(KEY, "app", &["sha:bbb"]);

        let start = tokio::time::Instant::now();
        service(store, timing()).update(&request()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_image_id_times_out() {
        let store = store_with_pod();
        store.script_image_ids(KEY, "app", &["sha:aaa"]);
        let timing = UpdateTiming {
            poll_timeout: Duration::from_secs(3),
            ..timing()
        };

        let failure = service(store.clone(), timing)
            .execute(&request())
            .await
            .unwrap_err();

        assert_eq!(failure.step, UpdateStep::PollVerify);
        match failure.error {
            AppError::VerificationTimedOut { pod, attempts, .. } => {
                assert_eq!(pod, KEY);
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
        // Left unready with the new image; no ready write
        assert_eq!(store.write_count(), 2);
        let pod = store.pod(KEY).unwrap();
        assert_eq!(find_marker_condition(&pod).unwrap().status, CONDITION_FALSE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_write_conflict_is_retried_with_fresh_pod() {
        let store = store_with_pod();
        store.script_image_ids(KEY, "app", &["sha:bbb"]);
        store.fail_next(StoreOp::UpdatePod, KEY, AppError::Conflict("stale".into()));

        let report = service(store.clone(), timing()).update(&request()).await;
        assert!(report.is_ok());
        assert_eq!(store.write_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unready_write_failure_leaves_image_alone() {
        let store = store_with_pod();
        store.fail_next(
            StoreOp::UpdatePodStatus,
            KEY,
            AppError::K8sApiError("boom".into()),
        );

        let failure = service(store.clone(), timing())
            .execute(&request())
            .await
            .unwrap_err();

        assert_eq!(failure.step, UpdateStep::MarkUnready);
        assert_eq!(store.write_count(), 0);
        let pod = store.pod(KEY).unwrap();
        let image = pod.spec.unwrap().containers[0].image.clone();
        assert_eq!(image.as_deref(), Some("nginx:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_error_while_polling_fails_verification() {
        let store = store_with_pod();
        store.script_image_ids(KEY, "app", &["sha:aaa"]);
        let svc = service(store.clone(), timing());

        let handle = tokio::spawn(async move { svc.execute(&request()).await });
        // Inject while the update sits in its grace wait, so the poll hits it
        tokio::time::sleep(Duration::from_secs(1)).await;
        store.fail_next(StoreOp::GetPod, KEY, AppError::K8sApiError("eof".into()));

        let failure = handle.await.unwrap().unwrap_err();
        assert_eq!(failure.step, UpdateStep::PollVerify);
        assert!(matches!(failure.error, AppError::VerificationFailed { ref pod, .. } if pod == KEY));
        assert_eq!(failure.error.exit_code(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_conflict_leaves_new_image_unready() {
        let store = store_with_pod();
        store.script_image_ids(KEY, "app", &["sha:bbb"]);
        let svc = service(store.clone(), timing());

        let handle = tokio::spawn(async move { svc.execute(&request()).await });
        // Unready write has happened; the next status write is the ready one
        tokio::time::sleep(Duration::from_secs(1)).await;
        store.fail_next(
            StoreOp::UpdatePodStatus,
            KEY,
            AppError::Conflict("kubelet wrote status".into()),
        );

        let failure = handle.await.unwrap().unwrap_err();
        assert_eq!(failure.step, UpdateStep::MarkReady);
        assert!(matches!(failure.error, AppError::Conflict(_)));

        let pod = store.pod(KEY).unwrap();
        assert_eq!(find_marker_condition(&pod).unwrap().status, CONDITION_FALSE);
        let image = pod.spec.unwrap().containers[0].image.clone();
        assert_eq!(image.as_deref(), Some("nginx:2"));
    }

    #[tokio::test]
    async fn test_missing_pod_fails_at_fetch() {
        let store = MemoryResourceStore::new().shared();
        let failure = service(store, timing()).execute(&request()).await.unwrap_err();
        assert_eq!(failure.step, UpdateStep::Fetch);
        assert!(matches!(failure.error, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_container_is_rejected_before_any_write() {
        let store = store_with_pod();
        let req = PodUpdateRequest {
            container: "missing".into(),
            ..request()
        };

        let err = service(store.clone(), timing()).update(&req).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_preflight_rejects_empty_image() {
        let store = store_with_pod();
        let req = PodUpdateRequest {
            image: String::new(),
            ..request()
        };

        let err = service(store.clone(), timing()).update(&req).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_grace_wait_stops_before_image_write() {
        let store = store_with_pod();
        let cancel = CancellationToken::new();
        let svc = PodUpdateService::new(store.clone(), timing(), cancel.clone());

        let handle = tokio::spawn(async move { svc.execute(&request()).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let failure = handle.await.unwrap().unwrap_err();
        assert_eq!(failure.step, UpdateStep::GraceWait);
        assert!(matches!(failure.error, AppError::Cancelled(_)));
        assert_eq!(store.write_count(), 1);
    }
}
