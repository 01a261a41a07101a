pub mod pod_controller;

pub use pod_controller::{ControllerSettings, PodController, SyncOutcome};
