//! The workspace ingress server: a plaintext gRPC surface admitting
//! workspace submissions and serving the image-update and license RPCs.

pub mod license;
pub mod setup;
pub mod workspace;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tonic::codec::CompressionEncoding;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::crd::KELDA_VERSION;
use crate::errors::user_message;
use crate::proto::kelda as pb;
use crate::proto::kelda::minion_server::{Minion, MinionServer};
use crate::registry::DigestResolver;
use crate::server::license::{LicensePolicy, LicenseType};
use crate::server::setup::WorkspaceSetup;
use crate::server::workspace::WorkspaceService;
use crate::settings::Settings;

/// Handlers are cut off after this long; clients retry with fresh state.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Destination for analytics events accepted over the `LogEvent` RPC. The
/// transport is out of scope here; the in-tree sink just logs.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &pb::Event);
}

pub struct LogSink;

impl EventSink for LogSink {
    fn record(&self, event: &pb::Event) {
        debug!(name = %event.name, time = event.time, "analytics event");
    }
}

/// gRPC facade over [`WorkspaceService`].
///
/// Application errors travel inside the response (`error` field) rather than
/// as transport errors; clients surface whichever is non-empty.
pub struct MinionGrpc {
    service: Arc<WorkspaceService>,
    sink: Arc<dyn EventSink>,
}

impl MinionGrpc {
    pub fn new(service: Arc<WorkspaceService>, sink: Arc<dyn EventSink>) -> Self {
        Self { service, sink }
    }
}

async fn with_timeout<T, F>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(REQUEST_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!(
            "request timed out after {}s",
            REQUEST_TIMEOUT.as_secs()
        )),
    }
}

#[tonic::async_trait]
impl Minion for MinionGrpc {
    async fn create_workspace(
        &self,
        request: Request<pb::CreateWorkspaceRequest>,
    ) -> Result<Response<pb::CreateWorkspaceResponse>, Status> {
        let workspace = request.into_inner().workspace.unwrap_or_default();
        let response = match with_timeout(self.service.create_workspace(workspace)).await {
            Ok(messages) => pb::CreateWorkspaceResponse {
                messages,
                error: String::new(),
            },
            Err(err) => pb::CreateWorkspaceResponse {
                messages: vec![],
                error: user_message(&err),
            },
        };
        Ok(Response::new(response))
    }

    async fn get_updates(
        &self,
        request: Request<pb::GetUpdatesRequest>,
    ) -> Result<Response<pb::GetUpdatesResponse>, Status> {
        let namespace = request.into_inner().namespace;
        let response = match with_timeout(self.service.get_updates(&namespace)).await {
            Ok(updates) => pb::GetUpdatesResponse {
                updates,
                error: String::new(),
            },
            Err(err) => pb::GetUpdatesResponse {
                updates: vec![],
                error: user_message(&err),
            },
        };
        Ok(Response::new(response))
    }

    async fn perform_updates(
        &self,
        request: Request<pb::PerformUpdatesRequest>,
    ) -> Result<Response<pb::PerformUpdatesResponse>, Status> {
        let request = request.into_inner();
        let error = match with_timeout(
            self.service
                .perform_updates(&request.namespace, &request.updates),
        )
        .await
        {
            Ok(()) => String::new(),
            Err(err) => user_message(&err),
        };
        Ok(Response::new(pb::PerformUpdatesResponse { error }))
    }

    async fn get_version(
        &self,
        _request: Request<pb::GetVersionRequest>,
    ) -> Result<Response<pb::GetVersionResponse>, Status> {
        Ok(Response::new(pb::GetVersionResponse {
            version: KELDA_VERSION.to_string(),
        }))
    }

    async fn get_license(
        &self,
        _request: Request<pb::GetLicenseRequest>,
    ) -> Result<Response<pb::GetLicenseResponse>, Status> {
        let terms = self.service.license.terms();
        let license = pb::License {
            customer: terms.customer,
            r#type: match terms.license_type {
                LicenseType::Customer => pb::LicenseType::Customer as i32,
                LicenseType::Trial => pb::LicenseType::Trial as i32,
            },
            seats: terms.seats.min(i32::MAX as usize) as i32,
            expiry_time: terms.expiry_time.timestamp(),
        };
        Ok(Response::new(pb::GetLicenseResponse {
            license: Some(license),
            error: String::new(),
        }))
    }

    async fn log_event(
        &self,
        request: Request<pb::LogEventRequest>,
    ) -> Result<Response<pb::LogEventResponse>, Status> {
        if let Some(event) = request.into_inner().event {
            self.sink.record(&event);
        }
        Ok(Response::new(pb::LogEventResponse {
            error: String::new(),
        }))
    }
}

/// Serve the workspace control plane until the shutdown future resolves.
pub async fn run(
    settings: &Settings,
    client: kube::Client,
    resolver: Arc<dyn DigestResolver>,
    license: Arc<dyn LicensePolicy>,
    sink: Arc<dyn EventSink>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let setup = WorkspaceSetup::new(
        client.clone(),
        &settings.platform.namespace,
        Arc::clone(&license),
    );
    let service = Arc::new(WorkspaceService::new(client, setup, resolver, license));
    let grpc = MinionGrpc::new(service, sink);

    let addr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .context("parsing server bind address")?;
    info!("gRPC server listening on {addr}");

    Server::builder()
        .http2_keepalive_interval(Some(KEEPALIVE_INTERVAL))
        .add_service(
            MinionServer::new(grpc)
                .accept_compressed(CompressionEncoding::Gzip)
                .send_compressed(CompressionEncoding::Gzip),
        )
        .serve_with_shutdown(addr, shutdown)
        .await
        .context("running gRPC server")?;

    info!("gRPC server shutdown complete");
    Ok(())
}
