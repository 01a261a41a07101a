pub mod controller;
pub mod marker;
pub mod update;
