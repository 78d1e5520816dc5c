use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::Api;
use kube::ResourceExt;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod crd;
mod errors;
mod inject;
mod microservice;
mod proto;
mod registry;
mod server;
mod settings;
mod tree;
mod tunnel;

use server::license::{LicensePolicy, LicenseTerms, LicenseType, StaticLicense};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the in-cluster control plane: controllers plus the gRPC server
    Run,
    /// Print the CustomResourceDefinitions for installation with kubectl
    Crd,
    /// Run the in-pod development server (started by the injected bootstrap
    /// command in dev-mode pods)
    DevServer {
        /// Microservice this pod belongs to
        service: String,
        /// Spec version the pod was created from
        spec_version: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run => run().await,
        Commands::Crd => print_crds(),
        Commands::DevServer {
            service,
            spec_version,
        } => dev_server(&service, spec_version).await,
    }
}

async fn run() -> Result<()> {
    // kube-rs needs a default CryptoProvider for HTTPS connections.
    rustls::crypto::ring::default_provider().install_default().ok();

    let settings = settings::Settings::load().context("loading settings")?;
    info!(version = crd::KELDA_VERSION, "starting kelda minion");

    let client = kube::Client::try_default()
        .await
        .context("building kubernetes client")?;

    ensure_crds(&client).await?;

    let injector = inject::Injector::new(
        crd::KELDA_VERSION,
        &settings.platform.minion_image,
        &settings.platform.minion_binary_path,
    );
    let microservice_ctx = Arc::new(microservice::Context::new(
        client.clone(),
        injector,
        settings.controller.requeue_budget,
    ));

    let tunnel_ctx = Arc::new(tunnel::Context::new(
        client.clone(),
        tunnel::TunnelSet::new(tunnel_factory(client.clone())),
        settings.controller.requeue_budget,
    ));

    let resolver: Arc<dyn registry::DigestResolver> =
        Arc::new(registry::OciDigestResolver::new(client.clone()));
    let license = license_policy(&settings)?;
    let sink: Arc<dyn server::EventSink> = Arc::new(server::LogSink);

    info!("starting microservice controller");
    let microservices = tokio::spawn(microservice::run(microservice_ctx));
    info!("starting tunnel controller");
    let tunnels = tokio::spawn(tunnel::run(tunnel_ctx));

    server::run(
        &settings,
        client,
        resolver,
        license,
        sink,
        shutdown_signal(),
    )
    .await?;

    let _ = microservices.await;
    let _ = tunnels.await;
    Ok(())
}

fn license_policy(settings: &settings::Settings) -> Result<Arc<dyn LicensePolicy>> {
    let Some(license) = &settings.license else {
        return Ok(Arc::new(StaticLicense::permissive()));
    };
    let license_type = match license.license_type.as_str() {
        "CUSTOMER" => LicenseType::Customer,
        "TRIAL" => LicenseType::Trial,
        other => anyhow::bail!("unknown license type '{other}'"),
    };
    let expiry_time = chrono::DateTime::parse_from_rfc3339(&license.expiry_time)
        .context("parsing license expiry time")?
        .with_timezone(&chrono::Utc);
    Ok(Arc::new(StaticLicense::new(LicenseTerms {
        customer: license.customer.clone(),
        license_type,
        seats: license.seats,
        expiry_time,
    })))
}

fn tunnel_factory(client: kube::Client) -> tunnel::TunnelFactory {
    Box::new(move |tunnel, pod| -> Arc<dyn tunnel::ManagedTunnel> {
        let namespace = tunnel.namespace().unwrap_or_default();
        let api: Api<crd::Tunnel> = Api::namespaced(client.clone(), &namespace);
        let sink = Arc::new(tunnel::TunnelCrSink::new(
            api,
            &tunnel.name_any(),
            tunnel.spec.clone(),
        ));
        let forward = tunnel::KubePortForward::new(client.clone(), &namespace, pod, &tunnel.spec);
        tunnel::TunnelManager::new(forward, sink)
    })
}

/// Install or refresh the platform CRDs before the controllers start.
async fn ensure_crds(client: &kube::Client) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    for definition in [crd::microservice_crd(), crd::tunnel_crd()] {
        let name = definition.metadata.name.clone().unwrap_or_default();
        server::setup::create_or_replace(&api, &name, definition)
            .await
            .with_context(|| format!("installing CRD '{name}'"))?;
        info!(crd = %name, "custom resource definition installed");
    }
    Ok(())
}

fn print_crds() -> Result<()> {
    let microservice = serde_yaml::to_string(&crd::microservice_crd())
        .context("encoding Microservice CRD")?;
    let tunnel = serde_yaml::to_string(&crd::tunnel_crd()).context("encoding Tunnel CRD")?;
    println!("{microservice}---\n{tunnel}");
    Ok(())
}

/// The in-pod half of dev mode. File sync is driven by the developer-side
/// CLI, which is out of scope here; this process holds the pod open and
/// reports its identity.
async fn dev_server(service: &str, spec_version: u64) -> Result<()> {
    let pod = std::env::var("POD_NAME").unwrap_or_default();
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_default();
    info!(service, spec_version, %pod, %namespace, "dev server waiting for sync sessions");
    shutdown_signal().await;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
