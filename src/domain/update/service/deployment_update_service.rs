use kube::ResourceExt;
use serde_json::json;
use tracing::{error, info, warn};
use validator::Validate;

use crate::core::client::deployments::label_selector_to_string;
use crate::core::client::store::ResourceStore;
use crate::domain::marker::INPLACE_UPDATE_ANNOTATION;
use crate::domain::update::dto::{
    all_succeeded, DeploymentUpdateReport, DeploymentUpdateRequest, PodUpdateFailure,
    PodUpdateResult, UpdateStep,
};
use crate::domain::update::service::pod_update_service::PodUpdateService;
use crate::errors::AppError;

/// Rolls an image across every pod a deployment selects, one pod at a time.
pub struct DeploymentUpdateService<S> {
    pods: PodUpdateService<S>,
}

impl<S: ResourceStore> DeploymentUpdateService<S> {
    pub fn new(pods: PodUpdateService<S>) -> Self {
        Self { pods }
    }

    /// Update each selected pod in turn, continuing past failures.
    ///
    /// The deployment is annotated with the image only when every pod
    /// succeeded. Errors before the first pod (lookup, selector, listing)
    /// are returned directly; per-pod failures are in the report.
    pub async fn update(
        &self,
        req: &DeploymentUpdateRequest,
    ) -> Result<DeploymentUpdateReport, AppError> {
        req.validate()?;
        self.pods.timing().check()?;

        let store = self.pods.store();
        let deployment = store.get_deployment(&req.namespace, &req.deployment).await?;

        let selector = deployment
            .spec
            .as_ref()
            .map(|spec| label_selector_to_string(&spec.selector))
            .transpose()?
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "deployment {}/{} has no spec",
                    req.namespace, req.deployment
                ))
            })?;

        let pods = store.list_pods(&req.namespace, &selector).await?;
        info!(
            "Updating {} pod(s) of deployment {}/{} (selector: {})",
            pods.len(),
            req.namespace,
            req.deployment,
            selector
        );

        let mut results = Vec::with_capacity(pods.len());
        for pod in pods {
            let name = pod.name_any();

            let outcome = if self.pods.cancel_token().is_cancelled() {
                Err(PodUpdateFailure {
                    step: UpdateStep::Fetch,
                    error: AppError::Cancelled(format!("update of {}/{} not started", req.namespace, name)),
                })
            } else {
                self.pods.execute(&req.for_pod(&name)).await
            };

            match &outcome {
                Ok(report) => info!(
                    "Pod {}/{} updated ({} -> {})",
                    req.namespace, name, report.baseline_image_id, report.new_image_id
                ),
                Err(failure) => error!("Pod {}/{} not updated: {}", req.namespace, name, failure),
            }

            results.push(PodUpdateResult {
                namespace: req.namespace.clone(),
                name,
                outcome,
            });
        }

        let annotated = if all_succeeded(&results) {
            let patch = json!({
                "metadata": {
                    "annotations": { INPLACE_UPDATE_ANNOTATION: req.image }
                }
            });
            store
                .patch_deployment(&req.namespace, &req.deployment, &patch)
                .await?;
            info!(
                "Annotated deployment {}/{} with image {}",
                req.namespace, req.deployment, req.image
            );
            true
        } else {
            warn!(
                "Deployment {}/{} left unannotated: {}/{} pod(s) updated",
                req.namespace,
                req.deployment,
                results.iter().filter(|r| r.is_success()).count(),
                results.len()
            );
            false
        };

        Ok(DeploymentUpdateReport { results, annotated })
    }
}
