//! gRPC bindings for the workspace control plane.
//!
//! The generated module is committed so builds do not require protoc. The
//! source of truth is `proto/minion.proto`; regenerate with tonic-build
//! (server only, `build_client(false)`).

#[allow(clippy::all)]
pub mod kelda;
