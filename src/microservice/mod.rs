//! Lifecycle of the Microservice custom resource: applying manifests to the
//! cluster and aggregating the health of everything they created.

pub mod apply;
pub mod controller;
pub mod status;

pub use controller::{run, Context};
