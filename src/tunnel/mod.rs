//! Lifecycle of the Tunnel custom resource: one live port-forward per
//! tunnel, recreated on pod or spec changes.

pub mod controller;
pub mod manager;

pub use controller::{run, Context, TunnelFactory, TunnelSet};
pub use manager::{KubePortForward, ManagedTunnel, PhaseSink, PortForward, TunnelCrSink, TunnelManager};
