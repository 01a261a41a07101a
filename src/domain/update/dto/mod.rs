pub mod update_request;
pub mod update_result;

pub use update_request::{DeploymentUpdateRequest, PodUpdateRequest, UpdateTiming};
pub use update_result::{
    all_succeeded, DeploymentUpdateReport, PodUpdateFailure, PodUpdateReport, PodUpdateResult,
    UpdateStep,
};
