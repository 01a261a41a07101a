// Kube-rs based Kubernetes client
pub mod kube_client;
pub mod kube_resources;
pub mod pods;
pub mod deployments;
pub mod watchers;
pub mod store;

// In-memory stand-in for the API server
#[cfg(any(test, feature = "test-util"))]
pub mod memory_store;
