//! In-place container image updates for Kubernetes pods.
//!
//! `pod-controller` keeps the in-place update readiness condition present on
//! every pod annotated for in-place updates. `pod-ipu` swaps a container image
//! on a pod, or on every pod of a deployment, without recreating it.

pub mod config;
pub mod core;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod shutdown;
pub mod version;
