//! Workspace admission: validating submissions, materializing Microservice
//! and Tunnel resources, and the image-update discovery/commit flows.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::try_join_all;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use tracing::{info, warn};

use crate::crd::{
    tunnel_name, ImageDigest, JobPhase, JobStatus, MetaStatus, Microservice, MicroserviceSpec,
    MicroserviceStatus, ServicePhase, ServiceStatus, Tunnel, TunnelSpec,
    ANNOTATION_PRIORITY_CLASS, REGCRED_SECRET,
};
use crate::errors::FriendlyError;
use crate::proto::kelda as pb;
use crate::registry::DigestResolver;
use crate::server::license::LicensePolicy;
use crate::server::setup::WorkspaceSetup;

const CONFLICT_RETRIES: usize = 5;

/// Pod controller kinds a service may put into development mode.
const DEV_CONTROLLER_KINDS: [&str; 3] = ["Deployment", "DaemonSet", "StatefulSet"];

pub struct WorkspaceService {
    client: kube::Client,
    setup: WorkspaceSetup,
    resolver: Arc<dyn DigestResolver>,
    pub license: Arc<dyn LicensePolicy>,
}

impl WorkspaceService {
    pub fn new(
        client: kube::Client,
        setup: WorkspaceSetup,
        resolver: Arc<dyn DigestResolver>,
        license: Arc<dyn LicensePolicy>,
    ) -> Self {
        Self {
            client,
            setup,
            resolver,
            license,
        }
    }

    /// Admit one workspace submission. Returns the informational messages to
    /// surface to the developer.
    pub async fn create_workspace(&self, workspace: pb::Workspace) -> Result<Vec<String>> {
        let namespace = workspace.namespace.clone();
        if namespace.is_empty() {
            return Err(FriendlyError::new("workspace namespace must not be empty").into());
        }

        let mut messages = self
            .license
            .check_expiration()
            .context("checking license")?;

        messages.extend(self.setup.ensure_namespace(&namespace).await?);
        let priority_class = self.setup.ensure_priority_class(&namespace).await?;
        self.setup.copy_regcred(&namespace).await?;
        self.setup.ensure_default_service_account(&namespace).await?;
        self.setup.ensure_dev_service_account(&namespace).await?;

        // Validate everything before touching any Microservice.
        let mut validated = Vec::new();
        for service in &workspace.services {
            validated.push(validate_service(service)?);
        }

        self.collect_microservices(&namespace, &workspace.services)
            .await?;
        let ms_api: Api<Microservice> = Api::namespaced(self.client.clone(), &namespace);
        try_join_all(validated.iter().map(|service| {
            self.apply_service(&ms_api, &namespace, service, priority_class.as_deref())
        }))
        .await?;

        self.collect_tunnels(&namespace, &workspace.tunnels).await?;
        let tunnel_api: Api<Tunnel> = Api::namespaced(self.client.clone(), &namespace);
        try_join_all(
            workspace
                .tunnels
                .iter()
                .map(|tunnel| apply_tunnel(&tunnel_api, tunnel)),
        )
        .await?;

        info!(%namespace, services = workspace.services.len(), "workspace applied");
        Ok(messages)
    }

    /// Delete Microservices the submission no longer names.
    async fn collect_microservices(
        &self,
        namespace: &str,
        services: &[pb::Service],
    ) -> Result<()> {
        let requested: HashSet<&str> = services.iter().map(|s| s.name.as_str()).collect();
        let api: Api<Microservice> = Api::namespaced(self.client.clone(), namespace);
        for ms in api
            .list(&ListParams::default())
            .await
            .context("listing microservices")?
        {
            let name = ms.name_any();
            if !requested.contains(name.as_str()) {
                info!(microservice = %name, "removing service dropped from the workspace");
                match api.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                    Err(err) => {
                        return Err(err)
                            .with_context(|| format!("deleting microservice '{name}'"))
                    }
                }
            }
        }
        Ok(())
    }

    /// Delete Tunnels the submission no longer names.
    async fn collect_tunnels(&self, namespace: &str, tunnels: &[pb::Tunnel]) -> Result<()> {
        let requested: HashSet<String> = tunnels
            .iter()
            .map(|t| {
                tunnel_name(
                    &t.service_name,
                    t.local_port as u16,
                    t.remote_port as u16,
                )
            })
            .collect();
        let api: Api<Tunnel> = Api::namespaced(self.client.clone(), namespace);
        for tunnel in api
            .list(&ListParams::default())
            .await
            .context("listing tunnels")?
        {
            let name = tunnel.name_any();
            if !requested.contains(&name) {
                info!(tunnel = %name, "removing tunnel dropped from the workspace");
                match api.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                    Err(err) => {
                        return Err(err).with_context(|| format!("deleting tunnel '{name}'"))
                    }
                }
            }
        }
        Ok(())
    }

    async fn apply_service(
        &self,
        api: &Api<Microservice>,
        namespace: &str,
        service: &ValidatedService,
        priority_class: Option<&str>,
    ) -> Result<()> {
        let existing_digests = match api.get(&service.name).await {
            Ok(existing) => existing.spec.image_digests.clone(),
            Err(kube::Error::Api(ae)) if ae.code == 404 => vec![],
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("fetching microservice '{}'", service.name))
            }
        };
        let image_digests = self
            .build_digests(namespace, &service.images, &existing_digests)
            .await;

        let mut ms = Microservice::new(
            &service.name,
            namespace,
            MicroserviceSpec {
                manifests: service.manifests.clone(),
                has_service: service.has_service,
                has_job: service.has_job,
                dev_mode: service.dev_mode,
                dev_image: service.dev_image.clone(),
                image_digests,
            },
        );
        if let Some(class) = priority_class {
            ms.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(ANNOTATION_PRIORITY_CLASS.to_string(), class.to_string());
        }

        create_or_update_service(api, ms).await
    }

    /// Reuse digests whose (controller, container, image) triple is already
    /// stored, resolve the rest. Resolution failures deploy by tag.
    async fn build_digests(
        &self,
        namespace: &str,
        images: &[ContainerImage],
        existing: &[ImageDigest],
    ) -> Vec<ImageDigest> {
        let mut digests = Vec::new();
        for image in images {
            if let Some(entry) = existing.iter().find(|d| {
                d.controller_name == image.controller
                    && d.container_name == image.container
                    && d.image_url == image.image
            }) {
                digests.push(entry.clone());
                continue;
            }
            match self
                .resolver
                .resolve(
                    &image.image,
                    &[REGCRED_SECRET.to_string()],
                    "default",
                    namespace,
                )
                .await
            {
                Ok(digest) => digests.push(ImageDigest {
                    controller_name: image.controller.clone(),
                    container_name: image.container.clone(),
                    image_url: image.image.clone(),
                    digest,
                }),
                Err(err) => {
                    warn!(image = %image.image, err = %format!("{err:#}"), "digest resolution failed, deploying by tag");
                }
            }
        }
        digests
    }

    /// Discover image updates: re-resolve every non-dev service's images and
    /// report the digests that moved.
    pub async fn get_updates(&self, namespace: &str) -> Result<Vec<pb::ServiceUpdate>> {
        let api: Api<Microservice> = Api::namespaced(self.client.clone(), namespace);
        let mut updates = Vec::new();

        for ms in api
            .list(&ListParams::default())
            .await
            .context("listing microservices")?
        {
            if ms.spec.dev_mode {
                continue;
            }
            let name = ms.name_any();
            let mut container_updates = Vec::new();
            for image in container_images(&ms.spec.manifests) {
                let new_digest = match self
                    .resolver
                    .resolve(
                        &image.image,
                        &[REGCRED_SECRET.to_string()],
                        "default",
                        namespace,
                    )
                    .await
                {
                    Ok(digest) => digest,
                    Err(err) => {
                        warn!(image = %image.image, err = %format!("{err:#}"), "skipping unresolvable image");
                        continue;
                    }
                };
                let old_digest = ms
                    .spec
                    .image_digests
                    .iter()
                    .find(|d| {
                        d.controller_name == image.controller
                            && d.container_name == image.container
                            && d.image_url == image.image
                    })
                    .map(|d| d.digest.clone())
                    .unwrap_or_default();
                if old_digest != new_digest {
                    container_updates.push(pb::ContainerUpdate {
                        controller_name: image.controller,
                        container_name: image.container,
                        old_digest,
                        new_digest,
                        image_url: image.image,
                    });
                }
            }
            if !container_updates.is_empty() {
                updates.push(pb::ServiceUpdate {
                    name,
                    container_updates,
                });
            }
        }
        Ok(updates)
    }

    /// Commit previously discovered updates: swap the stored digests, bump
    /// the spec version, and reset the health phases to Starting.
    pub async fn perform_updates(
        &self,
        namespace: &str,
        updates: &[pb::ServiceUpdate],
    ) -> Result<()> {
        let api: Api<Microservice> = Api::namespaced(self.client.clone(), namespace);
        for update in updates {
            perform_service_update(&api, update).await?;
        }
        Ok(())
    }
}

/// One container image consumed by a pod controller in a manifest.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerImage {
    pub controller: String,
    pub container: String,
    pub image: String,
}

#[derive(Debug)]
pub struct ValidatedService {
    name: String,
    manifests: Vec<String>,
    images: Vec<ContainerImage>,
    has_service: bool,
    has_job: bool,
    dev_mode: bool,
    dev_image: Option<String>,
}

/// Parse and check one submitted service against the dev-mode rules.
pub fn validate_service(service: &pb::Service) -> Result<ValidatedService> {
    let mut pod_controllers = 0usize;
    let mut has_job = false;
    let mut images = Vec::new();

    for manifest in &service.manifests {
        let value: serde_json::Value = serde_yaml::from_str(manifest)
            .with_context(|| format!("parsing manifest for service '{}'", service.name))?;
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or_default()
            .to_string();
        if kind.is_empty() {
            return Err(FriendlyError::new(format!(
                "Object 'Kind' is missing in '{}'",
                manifest.trim()
            ))
            .into());
        }
        if DEV_CONTROLLER_KINDS.contains(&kind.as_str()) {
            pod_controllers += 1;
        }
        if kind == "Job" {
            has_job = true;
        }
        images.extend(manifest_images(&value));
    }

    if service.dev_mode {
        if pod_controllers == 0 && has_job {
            return Err(FriendlyError::new(format!(
                "development mode is not supported for '{}': it only contains Jobs",
                service.name
            ))
            .into());
        }
        if pod_controllers == 0 {
            return Err(FriendlyError::new(format!(
                "development mode for '{}' requires a Deployment, DaemonSet or StatefulSet",
                service.name
            ))
            .into());
        }
        if pod_controllers > 1 {
            return Err(FriendlyError::new(format!(
                "development mode for '{}' requires exactly one pod controller, found {}",
                service.name, pod_controllers
            ))
            .into());
        }
    }

    Ok(ValidatedService {
        name: service.name.clone(),
        manifests: service.manifests.clone(),
        images,
        has_service: pod_controllers > 0,
        has_job,
        dev_mode: service.dev_mode,
        dev_image: (!service.dev_image.is_empty()).then(|| service.dev_image.clone()),
    })
}

/// Every (controller, container, image) triple in a set of manifests.
pub fn container_images(manifests: &[String]) -> Vec<ContainerImage> {
    manifests
        .iter()
        .filter_map(|m| serde_yaml::from_str::<serde_json::Value>(m).ok())
        .flat_map(|value| manifest_images(&value))
        .collect()
}

fn manifest_images(value: &serde_json::Value) -> Vec<ContainerImage> {
    let kind = value.get("kind").and_then(|k| k.as_str()).unwrap_or_default();
    if !crate::inject::POD_CONTROLLER_KINDS.contains(&kind) {
        return vec![];
    }
    let controller = value
        .pointer("/metadata/name")
        .and_then(|n| n.as_str())
        .unwrap_or_default()
        .to_string();
    let containers = value
        .pointer("/spec/template/spec/containers")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();
    containers
        .iter()
        .filter_map(|container| {
            let name = container.get("name")?.as_str()?.to_string();
            let image = container.get("image")?.as_str()?.to_string();
            Some(ContainerImage {
                controller: controller.clone(),
                container: name,
                image,
            })
        })
        .collect()
}

fn initial_status(spec: &MicroserviceSpec) -> MicroserviceStatus {
    MicroserviceStatus {
        meta_status: MetaStatus::default(),
        service_status: spec
            .has_service
            .then(|| ServiceStatus::new(ServicePhase::Starting, "")),
        job_status: spec.has_job.then(|| JobStatus::new(JobPhase::Starting, "")),
        actual: vec![],
    }
}

/// Create the Microservice, or patch its spec if it really changed: specs
/// are compared after normalization, and a real change bumps the spec
/// version by exactly one.
pub async fn create_or_update_service(api: &Api<Microservice>, ms: Microservice) -> Result<()> {
    let name = ms.name_any();
    let mut desired = ms;
    desired.spec = desired.spec.normalized();

    for _ in 0..CONFLICT_RETRIES {
        let current = match api.get(&name).await {
            Ok(current) => current,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let mut fresh = desired.clone();
                fresh.spec_version = 0;
                fresh.status = Some(initial_status(&fresh.spec));
                match api.create(&PostParams::default(), &fresh).await {
                    Ok(_) => {
                        info!(microservice = %name, "created microservice");
                        return Ok(());
                    }
                    // Lost the create race; loop around and diff instead.
                    Err(kube::Error::Api(ae)) if ae.code == 409 => continue,
                    Err(err) => {
                        return Err(err)
                            .with_context(|| format!("creating microservice '{name}'"))
                    }
                }
            }
            Err(err) => {
                return Err(err).with_context(|| format!("fetching microservice '{name}'"))
            }
        };

        if current.spec.normalized() == desired.spec
            && current.metadata.annotations.as_ref().and_then(|a| a.get(ANNOTATION_PRIORITY_CLASS))
                == desired
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(ANNOTATION_PRIORITY_CLASS))
        {
            return Ok(());
        }

        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": current.metadata.resource_version,
                "annotations": desired.metadata.annotations,
            },
            "spec": desired.spec,
            "specVersion": current.spec_version + 1,
        });
        match api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {
                info!(
                    microservice = %name,
                    spec_version = current.spec_version + 1,
                    "updated microservice spec"
                );
                return Ok(());
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("updating microservice '{name}'"))
            }
        }
    }
    anyhow::bail!("persistent conflicts updating microservice '{name}'")
}

async fn apply_tunnel(api: &Api<Tunnel>, tunnel: &pb::Tunnel) -> Result<()> {
    let spec = TunnelSpec {
        service: tunnel.service_name.clone(),
        local_port: tunnel.local_port as u16,
        remote_port: tunnel.remote_port as u16,
    };
    let name = tunnel_name(&spec.service, spec.local_port, spec.remote_port);

    match api.get(&name).await {
        Ok(existing) => {
            if existing.spec == spec {
                return Ok(());
            }
            let mut updated = existing;
            updated.spec = spec;
            api.replace(&name, &PostParams::default(), &updated)
                .await
                .with_context(|| format!("updating tunnel '{name}'"))?;
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            let tunnel = Tunnel::new(&name, spec);
            match api.create(&PostParams::default(), &tunnel).await {
                Ok(_) => {
                    info!(tunnel = %name, "created tunnel");
                    Ok(())
                }
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
                Err(err) => Err(err).with_context(|| format!("creating tunnel '{name}'")),
            }
        }
        Err(err) => Err(err).with_context(|| format!("fetching tunnel '{name}'")),
    }
}

async fn perform_service_update(
    api: &Api<Microservice>,
    update: &pb::ServiceUpdate,
) -> Result<()> {
    for _ in 0..CONFLICT_RETRIES {
        let mut ms = match api.get(&update.name).await {
            Ok(ms) => ms,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                warn!(microservice = %update.name, "skipping update for missing service");
                return Ok(());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("fetching microservice '{}'", update.name))
            }
        };

        for container_update in &update.container_updates {
            let entry = ms.spec.image_digests.iter_mut().find(|d| {
                d.controller_name == container_update.controller_name
                    && d.container_name == container_update.container_name
                    && d.image_url == container_update.image_url
            });
            match entry {
                Some(entry) => entry.digest = container_update.new_digest.clone(),
                None => ms.spec.image_digests.push(ImageDigest {
                    controller_name: container_update.controller_name.clone(),
                    container_name: container_update.container_name.clone(),
                    image_url: container_update.image_url.clone(),
                    digest: container_update.new_digest.clone(),
                }),
            }
        }
        ms.spec = ms.spec.normalized();
        ms.spec_version += 1;

        let mut status = ms.status.clone().unwrap_or_default();
        if ms.spec.has_service {
            status.service_status = Some(ServiceStatus::new(ServicePhase::Starting, ""));
        }
        if ms.spec.has_job {
            status.job_status = Some(JobStatus::new(JobPhase::Starting, ""));
        }
        ms.status = Some(status);

        match api.replace(&update.name, &PostParams::default(), &ms).await {
            Ok(_) => {
                info!(microservice = %update.name, "committed image updates");
                return Ok(());
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => continue,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("updating microservice '{}'", update.name))
            }
        }
    }
    anyhow::bail!("persistent conflicts updating microservice '{}'", update.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOYMENT: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: nginx-deployment
spec:
  template:
    spec:
      containers:
        - name: nginx-container
          image: nginx
"#;
    const JOB: &str = r#"
apiVersion: batch/v1
kind: Job
metadata:
  name: migrate
spec:
  template:
    spec:
      containers:
        - name: migrate
          image: migrate:v1
"#;

    fn service(manifests: &[&str], dev_mode: bool) -> pb::Service {
        pb::Service {
            name: "web".to_string(),
            manifests: manifests.iter().map(|m| m.to_string()).collect(),
            dev_mode,
            dev_image: String::new(),
        }
    }

    #[test]
    fn derives_service_and_job_flags() {
        let validated = validate_service(&service(&[DEPLOYMENT, JOB], false)).unwrap();
        assert!(validated.has_service);
        assert!(validated.has_job);
        assert_eq!(
            validated.images,
            vec![
                ContainerImage {
                    controller: "nginx-deployment".to_string(),
                    container: "nginx-container".to_string(),
                    image: "nginx".to_string(),
                },
                ContainerImage {
                    controller: "migrate".to_string(),
                    container: "migrate".to_string(),
                    image: "migrate:v1".to_string(),
                },
            ]
        );
    }

    #[test]
    fn malformed_manifest_is_rejected() {
        let err = validate_service(&service(&["metadata:\n  name: x\n"], false)).unwrap_err();
        assert!(err.to_string().contains("Object 'Kind' is missing"));
    }

    #[test]
    fn dev_mode_requires_a_pod_controller() {
        let err = validate_service(&service(&[JOB], true)).unwrap_err();
        assert!(err.to_string().contains("only contains Jobs"));

        let secret = "apiVersion: v1\nkind: Secret\nmetadata:\n  name: s\n";
        let err = validate_service(&service(&[secret], true)).unwrap_err();
        assert!(err.to_string().contains("requires a Deployment"));
    }

    #[test]
    fn dev_mode_requires_exactly_one_pod_controller() {
        let second = DEPLOYMENT.replace("nginx-deployment", "other-deployment");
        let err = validate_service(&service(&[DEPLOYMENT, &second], true)).unwrap_err();
        assert!(err.to_string().contains("exactly one pod controller"));

        assert!(validate_service(&service(&[DEPLOYMENT], true)).is_ok());
    }

    #[test]
    fn container_images_skips_non_controllers() {
        let secret = "apiVersion: v1\nkind: Secret\nmetadata:\n  name: s\n".to_string();
        let images = container_images(&[secret, DEPLOYMENT.to_string()]);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].controller, "nginx-deployment");
    }

    #[test]
    fn initial_status_reflects_the_spec_shape() {
        let status = initial_status(&MicroserviceSpec {
            has_service: true,
            has_job: false,
            ..Default::default()
        });
        assert_eq!(
            status.service_status.unwrap().phase,
            ServicePhase::Starting
        );
        assert!(status.job_status.is_none());
    }
}
