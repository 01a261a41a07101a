use std::fmt;

use crate::errors::AppError;

/// Stage of the per-pod update at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStep {
    Fetch,
    CaptureBaseline,
    MarkUnready,
    GraceWait,
    MutateImage,
    PollVerify,
    MarkReady,
}

impl fmt::Display for UpdateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateStep::Fetch => "fetch",
            UpdateStep::CaptureBaseline => "capture-baseline",
            UpdateStep::MarkUnready => "mark-unready",
            UpdateStep::GraceWait => "grace-wait",
            UpdateStep::MutateImage => "mutate-image",
            UpdateStep::PollVerify => "poll-verify",
            UpdateStep::MarkReady => "mark-ready",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodUpdateReport {
    pub baseline_image_id: String,
    pub new_image_id: String,
    /// Number of status reads until the new image ID showed up
    pub poll_attempts: u32,
}

#[derive(Debug)]
pub struct PodUpdateFailure {
    pub step: UpdateStep,
    pub error: AppError,
}

impl fmt::Display for PodUpdateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.step, self.error)
    }
}

/// Outcome of one pod within a batch.
#[derive(Debug)]
pub struct PodUpdateResult {
    pub namespace: String,
    pub name: String,
    pub outcome: Result<PodUpdateReport, PodUpdateFailure>,
}

impl PodUpdateResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// True when every pod in the batch was updated. An empty batch counts as success.
pub fn all_succeeded(results: &[PodUpdateResult]) -> bool {
    results.iter().all(PodUpdateResult::is_success)
}

#[derive(Debug)]
pub struct DeploymentUpdateReport {
    pub results: Vec<PodUpdateResult>,
    /// Whether the deployment annotation was written
    pub annotated: bool,
}

impl DeploymentUpdateReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    /// `BatchIncomplete` unless every pod succeeded and the deployment was annotated.
    pub fn ensure_complete(&self) -> Result<(), AppError> {
        if self.annotated && all_succeeded(&self.results) {
            Ok(())
        } else {
            Err(AppError::BatchIncomplete {
                succeeded: self.succeeded(),
                total: self.results.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(name: &str) -> PodUpdateResult {
        PodUpdateResult {
            namespace: "ns".into(),
            name: name.into(),
            outcome: Ok(PodUpdateReport {
                baseline_image_id: "sha:aaa".into(),
                new_image_id: "sha:bbb".into(),
                poll_attempts: 1,
            }),
        }
    }

    fn failed(name: &str) -> PodUpdateResult {
        PodUpdateResult {
            namespace: "ns".into(),
            name: name.into(),
            outcome: Err(PodUpdateFailure {
                step: UpdateStep::MutateImage,
                error: AppError::Conflict("stale".into()),
            }),
        }
    }

    #[test]
    fn test_all_succeeded() {
        assert!(all_succeeded(&[]));
        assert!(all_succeeded(&[ok("a"), ok("b")]));
        assert!(!all_succeeded(&[ok("a"), failed("b"), ok("c")]));
    }

    #[test]
    fn test_incomplete_batch_reports_counts() {
        let report = DeploymentUpdateReport {
            results: vec![ok("a"), failed("b"), ok("c")],
            annotated: false,
        };
        match report.ensure_complete() {
            Err(AppError::BatchIncomplete { succeeded, total }) => {
                assert_eq!(succeeded, 2);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_failure_display_names_step() {
        let failure = failed("b").outcome.unwrap_err();
        assert!(failure.to_string().starts_with("mutate-image failed"));
    }
}
