use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::util::retry::ConflictRetry;
use crate::core::util::wait::PollPolicy;
use crate::errors::AppError;

/// Waits and budgets for one pod's update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateTiming {
    /// Pause between marking the pod unready and swapping its image
    pub grace_period: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub conflict_retry: ConflictRetry,
}

impl Default for UpdateTiming {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(300),
            conflict_retry: ConflictRetry::default(),
        }
    }
}

impl UpdateTiming {
    pub fn check(&self) -> Result<(), AppError> {
        if self.poll_interval.is_zero() {
            return Err(AppError::Validation(
                "poll interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(self.poll_interval, self.poll_timeout)
    }
}

/// Swap one container's image on a single pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct PodUpdateRequest {
    #[validate(length(min = 1, message = "namespace must not be empty"))]
    pub namespace: String,
    #[validate(length(min = 1, message = "pod name must not be empty"))]
    pub name: String,
    #[validate(length(min = 1, message = "container name must not be empty"))]
    pub container: String,
    #[validate(length(min = 1, message = "image must not be empty"))]
    pub image: String,
}

/// Swap one container's image on every pod selected by a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct DeploymentUpdateRequest {
    #[validate(length(min = 1, message = "namespace must not be empty"))]
    pub namespace: String,
    #[validate(length(min = 1, message = "deployment name must not be empty"))]
    pub deployment: String,
    #[validate(length(min = 1, message = "container name must not be empty"))]
    pub container: String,
    #[validate(length(min = 1, message = "image must not be empty"))]
    pub image: String,
}

impl DeploymentUpdateRequest {
    pub fn for_pod(&self, pod_name: &str) -> PodUpdateRequest {
        PodUpdateRequest {
            namespace: self.namespace.clone(),
            name: pod_name.to_string(),
            container: self.container.clone(),
            image: self.image.clone(),
        }
    }
}
