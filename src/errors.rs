use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Verification timed out for {pod} after {attempts} poll(s) in {elapsed:?}")]
    VerificationTimedOut {
        pod: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("Verification failed for {pod}: {reason}")]
    VerificationFailed { pod: String, reason: String },

    #[error("Not all pods updated: {succeeded}/{total} succeeded")]
    BatchIncomplete { succeeded: usize, total: usize },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid queue key: {0}")]
    InvalidKey(String),

    #[error("K8s API error: {0}")]
    K8sApiError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<kube::Error> for AppError {
    fn from(err: kube::Error) -> Self {
        // Classify by HTTP status; everything else is a generic API failure
        let code = match &err {
            kube::Error::Api(resp) => Some(resp.code),
            _ => None,
        };

        match code {
            Some(404) => AppError::NotFound(err.to_string()),
            Some(409) => AppError::Conflict(err.to_string()),
            _ => AppError::K8sApiError(err.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| match &e.message {
                    Some(msg) => msg.to_string(),
                    None => format!("{field}: {}", e.code),
                })
            })
            .collect();
        messages.sort();
        AppError::Validation(messages.join("; "))
    }
}

impl AppError {
    /// Whether the pod controller should requeue a key that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::NotFound(_) | AppError::Conflict(_) | AppError::K8sApiError(_)
        )
    }

    /// Stable process exit code per failure kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Validation(_) => 2,
            AppError::NotFound(_) => 3,
            AppError::Conflict(_) => 4,
            AppError::VerificationTimedOut { .. } => 5,
            AppError::VerificationFailed { .. } => 6,
            AppError::BatchIncomplete { .. } => 7,
            AppError::Cancelled(_) => 130,
            AppError::InvalidKey(_)
            | AppError::K8sApiError(_)
            | AppError::InternalError(_) => 1,
        }
    }
}
