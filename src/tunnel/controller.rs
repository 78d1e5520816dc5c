//! Tunnel reconciliation: keep exactly one live port-forward per Tunnel
//! resource, recreating it when the backing pod or the spec changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crd::{Microservice, Tunnel, TunnelSpec};
use crate::tree::select_pods;
use crate::tunnel::manager::ManagedTunnel;

const TUNNEL_FINALIZER: &str = "kelda.io/tunnel";

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0:#}")]
    Reconcile(anyhow::Error),
    #[error("finalizer: {0}")]
    Finalizer(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Reconcile(err)
    }
}

/// Builds the managed tunnel for a Tunnel CR and its selected pod.
pub type TunnelFactory = Box<dyn Fn(&Tunnel, &str) -> Arc<dyn ManagedTunnel> + Send + Sync>;

struct TunnelRecord {
    pod: String,
    spec: TunnelSpec,
    handle: Arc<dyn ManagedTunnel>,
}

/// The set of live tunnels, keyed by `namespace/name`.
///
/// Only the reconcile path touches the map, but reconciles for distinct keys
/// run concurrently, so it sits behind a mutex.
pub struct TunnelSet {
    records: tokio::sync::Mutex<HashMap<String, TunnelRecord>>,
    factory: TunnelFactory,
}

impl TunnelSet {
    pub fn new(factory: TunnelFactory) -> Self {
        Self {
            records: tokio::sync::Mutex::new(HashMap::new()),
            factory,
        }
    }

    /// Reconcile one Tunnel against the pod currently backing its service.
    ///
    /// Anything but exactly one running pod means no action: the tunnel is
    /// re-enqueued when the Microservice status changes again.
    pub async fn sync(&self, tunnel: &Tunnel, running_pods: &[String]) {
        let key = tunnel_key(tunnel);
        if running_pods.len() != 1 {
            debug!(
                tunnel = %key,
                pods = running_pods.len(),
                "not exactly one running pod, leaving tunnel as-is"
            );
            return;
        }
        let pod = running_pods[0].clone();

        let mut records = self.records.lock().await;
        if let Some(existing) = records.remove(&key) {
            if existing.pod == pod && existing.spec == tunnel.spec {
                records.insert(key, existing);
                return;
            }
            info!(tunnel = %key, old_pod = %existing.pod, new_pod = %pod, "replacing tunnel");
            existing.handle.stop().await;
        } else {
            info!(tunnel = %key, %pod, "starting tunnel");
        }

        let handle = (self.factory)(tunnel, &pod);
        Arc::clone(&handle).start();
        records.insert(
            key,
            TunnelRecord {
                pod,
                spec: tunnel.spec.clone(),
                handle,
            },
        );
    }

    /// Stop and drop the record for a deleted Tunnel.
    pub async fn remove(&self, tunnel: &Tunnel) {
        let key = tunnel_key(tunnel);
        if let Some(record) = self.records.lock().await.remove(&key) {
            info!(tunnel = %key, "stopping tunnel");
            record.handle.stop().await;
        }
    }

    /// Stop every live tunnel; used on shutdown.
    pub async fn shutdown(&self) {
        let records: Vec<TunnelRecord> = {
            let mut map = self.records.lock().await;
            map.drain().map(|(_, record)| record).collect()
        };
        for record in records {
            record.handle.stop().await;
        }
    }

    #[cfg(test)]
    pub async fn pods(&self) -> Vec<String> {
        self.records
            .lock()
            .await
            .values()
            .map(|r| r.pod.clone())
            .collect()
    }
}

fn tunnel_key(tunnel: &Tunnel) -> String {
    format!(
        "{}/{}",
        tunnel.namespace().unwrap_or_default(),
        tunnel.name_any()
    )
}

pub struct Context {
    pub client: kube::Client,
    pub tunnels: TunnelSet,
    pub requeue_budget: u32,
    attempts: StdMutex<HashMap<String, u32>>,
}

impl Context {
    pub fn new(client: kube::Client, tunnels: TunnelSet, requeue_budget: u32) -> Self {
        Self {
            client,
            tunnels,
            requeue_budget,
            attempts: StdMutex::new(HashMap::new()),
        }
    }
}

/// Run the tunnel controller until shutdown, then tear every tunnel down.
pub async fn run(ctx: Arc<Context>) {
    let tunnel_api: Api<Tunnel> = Api::all(ctx.client.clone());
    let ms_api: Api<Microservice> = Api::all(ctx.client.clone());

    let controller = Controller::new(tunnel_api, watcher::Config::default());
    let store = controller.store();

    controller
        .watches(ms_api, watcher::Config::default(), move |ms| {
            // Pod rescheduling surfaces as a Microservice status change; wake
            // every tunnel pointed at that service.
            let name = ms.name_any();
            let namespace = ms.namespace();
            store
                .state()
                .into_iter()
                .filter(|tunnel| {
                    tunnel.spec.service == name && tunnel.namespace() == namespace
                })
                .map(|tunnel| ObjectRef::from_obj(&*tunnel))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::clone(&ctx))
        .for_each(|result| async move {
            match result {
                Ok((tunnel, _)) => debug!(tunnel = %tunnel.name, "reconciled"),
                Err(err) => debug!(%err, "tunnel reconcile error"),
            }
        })
        .await;

    ctx.tunnels.shutdown().await;
}

async fn reconcile(tunnel: Arc<Tunnel>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = tunnel.namespace().unwrap_or_default();
    let api: Api<Tunnel> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, TUNNEL_FINALIZER, tunnel, |event| async {
        match event {
            Event::Apply(tunnel) => {
                sync_tunnel(&ctx, &tunnel).await?;
                Ok(Action::await_change())
            }
            Event::Cleanup(tunnel) => {
                ctx.tunnels.remove(&tunnel).await;
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(|err: kube::runtime::finalizer::Error<Error>| Error::Finalizer(err.to_string()))
}

async fn sync_tunnel(ctx: &Context, tunnel: &Tunnel) -> Result<(), Error> {
    let namespace = tunnel.namespace().unwrap_or_default();
    let ms_api: Api<Microservice> = Api::namespaced(ctx.client.clone(), &namespace);

    let ms = match ms_api.get(&tunnel.spec.service).await {
        Ok(ms) => ms,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!(service = %tunnel.spec.service, "tunnel target does not exist yet");
            return Ok(());
        }
        Err(err) => {
            return Err(anyhow::Error::from(err)
                .context("fetching tunnel target microservice")
                .into())
        }
    };

    let actual = ms.status.map(|s| s.actual).unwrap_or_default();
    let running: Vec<String> = select_pods(&actual, true)
        .into_iter()
        .filter_map(|pod| pod.metadata.name.clone())
        .collect();

    ctx.tunnels.sync(tunnel, &running).await;
    Ok(())
}

fn error_policy(tunnel: Arc<Tunnel>, err: &Error, ctx: Arc<Context>) -> Action {
    let key = tunnel_key(&tunnel);
    let mut attempts = ctx.attempts.lock().unwrap();
    let attempt = attempts.entry(key.clone()).or_insert(0);
    *attempt += 1;
    if *attempt >= ctx.requeue_budget {
        warn!(tunnel = %key, %err, "requeue budget exhausted, dropping item");
        attempts.remove(&key);
        Action::await_change()
    } else {
        Action::requeue(Duration::from_secs(1u64 << (*attempt).min(5)))
    }
}
