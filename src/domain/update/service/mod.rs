pub mod deployment_update_service;
pub mod pod_update_service;

pub use deployment_update_service::DeploymentUpdateService;
pub use pod_update_service::PodUpdateService;
