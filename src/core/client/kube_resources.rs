/// Re-export the Kubernetes resource types used across the crate
/// so call sites do not depend on k8s-openapi module paths

pub use k8s_openapi::api::core::v1::{
    Container as K8sContainer,
    ContainerStatus,
    Pod,
    PodCondition,
    PodSpec,
    PodStatus,
};

pub use k8s_openapi::api::apps::v1::{
    Deployment,
    DeploymentSpec,
};

pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector,
    LabelSelectorRequirement,
    ObjectMeta,
    Time,
};
