//! Microservice reconciliation: an apply path and a status path, each backed
//! by its own controller so the two never share locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crd::{
    JobPhase, JobStatus, MetaPhase, MetaStatus, Microservice, MicroserviceStatus, ServicePhase,
    ServiceStatus,
};
use crate::errors::user_message;
use crate::inject::Injector;
use crate::microservice::apply::{sort_manifests, ObjectApplier};
use crate::microservice::status::{
    expected_non_job_controllers, job_status_for_microservice, service_status_for_microservice,
};
use crate::tree::{self, KubeObject};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0:#}")]
    Reconcile(anyhow::Error),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Reconcile(err)
    }
}

/// Shared state of both reconciliation paths.
pub struct Context {
    pub client: kube::Client,
    pub injector: Injector,
    pub applier: ObjectApplier,
    /// Requeue budget per key; items are dropped after this many failures.
    pub requeue_budget: u32,
    apply_attempts: Mutex<HashMap<String, u32>>,
    status_attempts: Mutex<HashMap<String, u32>>,
    /// Spec version last applied per key, to suppress no-op re-applies.
    applied: Mutex<HashMap<String, u64>>,
}

impl Context {
    pub fn new(client: kube::Client, injector: Injector, requeue_budget: u32) -> Self {
        Self {
            applier: ObjectApplier::new(client.clone()),
            client,
            injector,
            requeue_budget,
            apply_attempts: Mutex::new(HashMap::new()),
            status_attempts: Mutex::new(HashMap::new()),
            applied: Mutex::new(HashMap::new()),
        }
    }

    fn forget(&self, key: &str) {
        self.apply_attempts.lock().unwrap().remove(key);
        self.status_attempts.lock().unwrap().remove(key);
        self.applied.lock().unwrap().remove(key);
    }

    fn last_applied(&self, key: &str) -> Option<u64> {
        self.applied.lock().unwrap().get(key).copied()
    }

    fn bump(map: &Mutex<HashMap<String, u32>>, key: &str) -> u32 {
        let mut map = map.lock().unwrap();
        let attempts = map.entry(key.to_string()).or_insert(0);
        *attempts += 1;
        *attempts
    }
}

fn key_of(ms: &Microservice) -> String {
    format!(
        "{}/{}",
        ms.namespace().unwrap_or_default(),
        ms.name_any()
    )
}

/// Run both Microservice controllers until shutdown.
pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let ms_api: Api<Microservice> = Api::all(client.clone());

    let apply = Controller::new(ms_api.clone(), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_apply, apply_error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((ms, _)) => debug!(microservice = %ms.name, "apply reconciled"),
                Err(err) => debug!(%err, "apply reconcile error"),
            }
        });

    let status = Controller::new(ms_api, watcher::Config::default())
        .watches(
            Api::<Pod>::all(client.clone()),
            watcher::Config::default(),
            owning_microservice,
        )
        .watches(
            Api::<Job>::all(client.clone()),
            watcher::Config::default(),
            owning_microservice,
        )
        .watches(
            Api::<Deployment>::all(client.clone()),
            watcher::Config::default(),
            owning_microservice,
        )
        .watches(
            Api::<ReplicaSet>::all(client.clone()),
            watcher::Config::default(),
            owning_microservice,
        )
        .watches(
            Api::<StatefulSet>::all(client.clone()),
            watcher::Config::default(),
            owning_microservice,
        )
        .watches(
            Api::<DaemonSet>::all(client.clone()),
            watcher::Config::default(),
            owning_microservice,
        )
        .shutdown_on_signal()
        .run(reconcile_status, status_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((ms, _)) => debug!(microservice = %ms.name, "status reconciled"),
                Err(err) => debug!(%err, "status reconcile error"),
            }
        });

    tokio::join!(apply, status);
}

/// Map a child object event to its owning Microservice via the name
/// annotation.
fn owning_microservice<K: ResourceExt>(obj: K) -> Option<ObjectRef<Microservice>> {
    let name = crate::crd::microservice_name(obj.annotations())?.to_string();
    let namespace = obj.namespace()?;
    Some(ObjectRef::new(&name).within(&namespace))
}

async fn reconcile_apply(ms: Arc<Microservice>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = ms.namespace().unwrap_or_default();
    let name = ms.name_any();
    let key = key_of(&ms);
    let api: Api<Microservice> = Api::namespaced(ctx.client.clone(), &namespace);

    let ms = match api.get(&name).await {
        Ok(ms) => ms,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            ctx.forget(&key);
            return Ok(Action::await_change());
        }
        Err(err) => {
            return Err(anyhow::Error::from(err)
                .context("fetching microservice")
                .into())
        }
    };

    if ctx.last_applied(&key) == Some(ms.spec_version) {
        return Ok(Action::await_change());
    }

    let previously_failed = ms
        .status
        .as_ref()
        .map(|s| s.meta_status.phase == MetaPhase::DeployFailed)
        .unwrap_or(false);

    match apply_microservice(&ctx, &ms).await {
        Ok(()) => {
            ctx.applied.lock().unwrap().insert(key.clone(), ms.spec_version);
            ctx.apply_attempts.lock().unwrap().remove(&key);
            info!(microservice = %name, spec_version = ms.spec_version, "applied manifests");

            if previously_failed {
                let spec = ms.spec.clone();
                update_status_with(&api, &name, ms.spec_version, true, move |current| {
                    let mut status = current.status.clone().unwrap_or_default();
                    status.meta_status = MetaStatus::default();
                    if spec.has_service {
                        status.service_status =
                            Some(ServiceStatus::new(ServicePhase::Starting, ""));
                    }
                    if spec.has_job {
                        status.job_status = Some(JobStatus::new(JobPhase::Starting, ""));
                    }
                    status
                })
                .await
                .map_err(Error::from)?;
            }
            Ok(Action::await_change())
        }
        Err(err) => {
            let message = user_message(&err);
            warn!(microservice = %name, %message, "deploy failed");
            let write = update_status_with(&api, &name, ms.spec_version, true, move |current| {
                let mut status = current.status.clone().unwrap_or_default();
                status.meta_status = MetaStatus {
                    phase: MetaPhase::DeployFailed,
                    message: message.clone(),
                };
                status
            })
            .await;
            if let Err(write_err) = write {
                warn!(microservice = %name, err = %write_err, "recording deploy failure");
            }
            Err(err.into())
        }
    }
}

async fn apply_microservice(ctx: &Context, ms: &Microservice) -> Result<()> {
    for group in sort_manifests(&ms.spec.manifests)? {
        for manifest in &group {
            let obj = ctx.injector.inject(ms, manifest)?;
            ctx.applier.apply(ms, obj).await?;
        }
    }
    Ok(())
}

fn apply_error_policy(ms: Arc<Microservice>, err: &Error, ctx: Arc<Context>) -> Action {
    retry_or_drop(&ctx.apply_attempts, &key_of(&ms), err, ctx.requeue_budget)
}

fn status_error_policy(ms: Arc<Microservice>, err: &Error, ctx: Arc<Context>) -> Action {
    retry_or_drop(&ctx.status_attempts, &key_of(&ms), err, ctx.requeue_budget)
}

fn retry_or_drop(
    attempts: &Mutex<HashMap<String, u32>>,
    key: &str,
    err: &Error,
    budget: u32,
) -> Action {
    let attempt = Context::bump(attempts, key);
    if attempt >= budget {
        warn!(%key, %err, attempt, "requeue budget exhausted, dropping item");
        attempts.lock().unwrap().remove(key);
        Action::await_change()
    } else {
        Action::requeue(Duration::from_secs(1u64 << attempt.min(5)))
    }
}

async fn reconcile_status(ms: Arc<Microservice>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = ms.namespace().unwrap_or_default();
    let name = ms.name_any();
    let key = key_of(&ms);
    let api: Api<Microservice> = Api::namespaced(ctx.client.clone(), &namespace);

    let ms = match api.get(&name).await {
        Ok(ms) => ms,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            ctx.forget(&key);
            return Ok(Action::await_change());
        }
        Err(err) => {
            return Err(anyhow::Error::from(err)
                .context("fetching microservice")
                .into())
        }
    };

    match sync_status(&ctx, &api, &ms).await {
        Ok(()) => {
            ctx.status_attempts.lock().unwrap().remove(&key);
            Ok(Action::await_change())
        }
        Err(err) => {
            let message = user_message(&err);
            let write = update_status_with(&api, &name, ms.spec_version, false, move |current| {
                let mut status = current.status.clone().unwrap_or_default();
                status.meta_status = MetaStatus {
                    phase: MetaPhase::StatusSyncFailed,
                    message: message.clone(),
                };
                status
            })
            .await;
            if let Err(write_err) = write {
                warn!(microservice = %name, err = %write_err, "recording status sync failure");
            }
            Err(err.into())
        }
    }
}

async fn sync_status(ctx: &Context, api: &Api<Microservice>, ms: &Microservice) -> Result<()> {
    let namespace = ms.namespace().unwrap_or_default();
    let name = ms.name_any();

    let objects = list_namespace_objects(&ctx.client, &namespace).await?;
    let forest = tree::build(objects);
    let uid = ms.metadata.uid.clone().unwrap_or_default();
    let roots = forest
        .get(&(uid, ms.spec_version))
        .cloned()
        .unwrap_or_default();

    let nodes = Api::<Node>::all(ctx.client.clone())
        .list(&ListParams::default())
        .await
        .context("listing nodes")?
        .items;

    let expected = expected_non_job_controllers(&ms.spec.manifests);
    let job_status = ms
        .spec
        .has_job
        .then(|| job_status_for_microservice(&roots, &nodes));
    let service_status = ms
        .spec
        .has_service
        .then(|| service_status_for_microservice(expected, &roots, &nodes));

    let dev_overlay = ms.spec.dev_mode.then(|| dev_meta_status(ms));

    update_status_with(api, &name, ms.spec_version, false, move |current| {
        let mut status = current.status.clone().unwrap_or_default();
        status.actual = roots.clone();
        if let Some(job_status) = &job_status {
            status.job_status = Some(job_status.clone());
        }
        if let Some(service_status) = &service_status {
            status.service_status = Some(service_status.clone());
        }
        if let Some(Some(meta)) = &dev_overlay {
            status.meta_status = meta.clone();
        }
        status
    })
    .await
}

/// Dev-mode overlay: the file-sync service reports target and running
/// versions; they disagree while a sync is in flight.
fn dev_meta_status(ms: &Microservice) -> Option<MetaStatus> {
    let dev = ms.dev_status.clone().unwrap_or_default();
    if dev.running_version != dev.target_version {
        Some(MetaStatus {
            phase: MetaPhase::Syncing,
            message: String::new(),
        })
    } else if !dev.running_version.is_empty() && !dev.target_version.is_empty() {
        Some(MetaStatus {
            phase: MetaPhase::Synced,
            message: String::new(),
        })
    } else {
        None
    }
}

async fn list_namespace_objects(client: &kube::Client, namespace: &str) -> Result<Vec<KubeObject>> {
    let lp = ListParams::default();
    let mut objects = Vec::new();

    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    objects.extend(
        pods.list(&lp)
            .await
            .context("listing pods")?
            .into_iter()
            .map(KubeObject::Pod),
    );
    let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);
    objects.extend(
        jobs.list(&lp)
            .await
            .context("listing jobs")?
            .into_iter()
            .map(KubeObject::Job),
    );
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    objects.extend(
        deployments
            .list(&lp)
            .await
            .context("listing deployments")?
            .into_iter()
            .map(KubeObject::Deployment),
    );
    let replica_sets: Api<ReplicaSet> = Api::namespaced(client.clone(), namespace);
    objects.extend(
        replica_sets
            .list(&lp)
            .await
            .context("listing replica sets")?
            .into_iter()
            .map(KubeObject::ReplicaSet),
    );
    let stateful_sets: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    objects.extend(
        stateful_sets
            .list(&lp)
            .await
            .context("listing stateful sets")?
            .into_iter()
            .map(KubeObject::StatefulSet),
    );
    let daemon_sets: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
    objects.extend(
        daemon_sets
            .list(&lp)
            .await
            .context("listing daemon sets")?
            .into_iter()
            .map(KubeObject::DaemonSet),
    );

    Ok(objects)
}

/// Read-modify-write a Microservice status under optimistic concurrency.
///
/// The write is skipped when the resource is gone, when its spec version
/// moved on since the sync started, when an existing DeployFailed would be
/// overwritten by anyone but the deploy path, or when nothing changed.
/// Conflicts re-run the mutation against a fresh read; "not found" and
/// persistent conflicts mean the resource has moved on and count as success.
pub async fn update_status_with<F>(
    api: &Api<Microservice>,
    name: &str,
    spec_version: u64,
    from_deploy_path: bool,
    mutate: F,
) -> Result<()>
where
    F: Fn(&Microservice) -> MicroserviceStatus,
{
    const MAX_CONFLICT_RETRIES: usize = 5;

    for _ in 0..MAX_CONFLICT_RETRIES {
        let current = match api.get(name).await {
            Ok(current) => current,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(err) => return Err(err).context("fetching microservice for status update"),
        };

        if current.spec_version != spec_version {
            debug!(microservice = %name, "spec version moved on, skipping status write");
            return Ok(());
        }

        let deploy_failed = current
            .status
            .as_ref()
            .map(|s| s.meta_status.phase == MetaPhase::DeployFailed)
            .unwrap_or(false);
        if deploy_failed && !from_deploy_path {
            debug!(microservice = %name, "not overwriting deploy failure");
            return Ok(());
        }

        let new_status = mutate(&current);
        if current.status.as_ref() == Some(&new_status) {
            return Ok(());
        }

        let mut updated = current;
        updated.status = Some(new_status);
        match api.replace(name, &PostParams::default(), &updated).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => continue,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(err) => return Err(err).context("writing microservice status"),
        }
    }

    debug!(microservice = %name, "persistent status conflicts, resource has moved on");
    Ok(())
}
