//! Object application: ordering, create-or-update decisions, and the
//! kind-specific update policy.

use std::time::Duration;

use anyhow::{Context, Result};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{self, Scope};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::crd::{
    annotated_spec_version, Microservice, ANNOTATION_KELDA_VERSION, KELDA_VERSION,
    LAST_APPLIED_ANNOTATION,
};
use crate::errors::FriendlyError;
use crate::inject::manifest_kind;

/// Field manager used for server-side apply patches.
const FIELD_MANAGER: &str = "kelda-minion";

/// Kinds that are updated in place with a graceful patch instead of a hard
/// replace: a Service must keep its ClusterIP, and a PersistentVolumeClaim
/// cannot be deleted while pods reference it.
const GRACEFUL_UPDATE_KINDS: [&str; 2] = ["Service", "PersistentVolumeClaim"];

const DELETE_POLL_INITIAL: Duration = Duration::from_secs(1);
const DELETE_POLL_MAX: Duration = Duration::from_secs(30);
const DELETE_TIMEOUT: Duration = Duration::from_secs(180);

/// Partition manifests into apply groups: everything else first, then
/// PersistentVolumeClaims. Kubernetes blocks PVC deletion while referencing
/// pods exist, so PVC churn must come after the pods that hold them.
pub fn sort_manifests(manifests: &[String]) -> Result<Vec<Vec<String>>> {
    let mut first = Vec::new();
    let mut pvcs = Vec::new();
    for manifest in manifests {
        if manifest_kind(manifest)? == "PersistentVolumeClaim" {
            pvcs.push(manifest.clone());
        } else {
            first.push(manifest.clone());
        }
    }
    Ok(vec![first, pvcs])
}

/// Applies injected objects to the cluster.
pub struct ObjectApplier {
    client: kube::Client,
}

impl ObjectApplier {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    pub async fn apply(&self, ms: &Microservice, obj: DynamicObject) -> Result<()> {
        let types = obj
            .types
            .clone()
            .context("injected object has no type metadata")?;
        let (group, version) = match types.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", types.api_version.as_str()),
        };
        let gvk = GroupVersionKind::gvk(group, version, &types.kind);
        let (resource, capabilities) = discovery::oneshot::pinned_kind(&self.client, &gvk)
            .await
            .with_context(|| format!("discovering resource for kind '{}'", types.kind))?;

        // Cluster-scoped resources cannot be shared across per-developer
        // namespaces.
        if capabilities.scope == Scope::Cluster {
            return Err(FriendlyError::new(format!(
                "{} is a cluster-scoped resource and cannot belong to a workspace",
                types.kind
            ))
            .into());
        }

        let namespace = obj.metadata.namespace.clone().unwrap_or_default();
        let name = obj.metadata.name.clone().unwrap_or_default();
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &namespace, &resource);

        match api.get(&name).await {
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                self.create(&api, obj).await?;
                info!(kind = %types.kind, %name, "created object");
                Ok(())
            }
            Ok(existing) => {
                if !should_update_object(&existing, ms, KELDA_VERSION) {
                    debug!(kind = %types.kind, %name, "object is current, skipping");
                    return Ok(());
                }
                if GRACEFUL_UPDATE_KINDS.contains(&types.kind.as_str()) {
                    self.graceful_update(&api, &name, &obj).await?;
                    info!(kind = %types.kind, %name, "patched object in place");
                } else {
                    self.hard_replace(&api, &name, obj).await?;
                    info!(kind = %types.kind, %name, "replaced object");
                }
                Ok(())
            }
            Err(err) => {
                Err(err).with_context(|| format!("fetching {} '{name}'", types.kind))
            }
        }
    }

    async fn create(&self, api: &Api<DynamicObject>, mut obj: DynamicObject) -> Result<()> {
        // Canonical representation for future three-way merges.
        let canonical =
            serde_json::to_string(&obj).context("encoding apply configuration")?;
        obj.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(LAST_APPLIED_ANNOTATION.to_string(), canonical);
        api.create(&PostParams::default(), &obj)
            .await
            .with_context(|| {
                format!(
                    "creating object '{}'",
                    obj.metadata.name.as_deref().unwrap_or_default()
                )
            })?;
        Ok(())
    }

    async fn graceful_update(
        &self,
        api: &Api<DynamicObject>,
        name: &str,
        obj: &DynamicObject,
    ) -> Result<()> {
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(obj),
        )
        .await
        .with_context(|| format!("patching object '{name}'"))?;
        Ok(())
    }

    /// Delete with foreground propagation and re-create. Rolling semantics
    /// (e.g. Deployment surge) would keep stale code running; replacement
    /// gets the developer's latest code out as fast as possible.
    async fn hard_replace(
        &self,
        api: &Api<DynamicObject>,
        name: &str,
        obj: DynamicObject,
    ) -> Result<()> {
        let delete = DeleteParams {
            grace_period_seconds: Some(0),
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        };
        match api.delete(name, &delete).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(err) => return Err(err).with_context(|| format!("deleting object '{name}'")),
        }

        let deadline = Instant::now() + DELETE_TIMEOUT;
        let mut poll = DELETE_POLL_INITIAL;
        loop {
            match api.get(name).await {
                Err(kube::Error::Api(ae)) if ae.code == 404 => break,
                Ok(_) => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("polling deletion of '{name}'"))
                }
            }
            if Instant::now() >= deadline {
                anyhow::bail!("timed out waiting for '{name}' to be deleted");
            }
            tokio::time::sleep(poll).await;
            poll = (poll * 2).min(DELETE_POLL_MAX);
        }

        self.create(api, obj).await
    }
}

/// An object needs an update when the spec version it was created from
/// differs from the Microservice's, or, in dev mode, when it was injected by
/// a different platform build.
pub fn should_update_object(
    existing: &DynamicObject,
    ms: &Microservice,
    kelda_version: &str,
) -> bool {
    let annotations = existing.metadata.annotations.clone().unwrap_or_default();
    if annotated_spec_version(&annotations) != Some(ms.spec_version) {
        return true;
    }
    if ms.spec.dev_mode
        && annotations.get(ANNOTATION_KELDA_VERSION).map(String::as_str) != Some(kelda_version)
    {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MicroserviceSpec, ANNOTATION_SPEC_VERSION};

    const DEPLOYMENT: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n";
    const DAEMONSET: &str = "apiVersion: apps/v1\nkind: DaemonSet\nmetadata:\n  name: agent\n";
    const PVC: &str = "apiVersion: v1\nkind: PersistentVolumeClaim\nmetadata:\n  name: data\n";

    #[test]
    fn pvcs_are_applied_last() {
        let groups = sort_manifests(&[
            DEPLOYMENT.to_string(),
            DAEMONSET.to_string(),
            PVC.to_string(),
        ])
        .unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec![DEPLOYMENT.to_string(), DAEMONSET.to_string()]);
        assert_eq!(groups[1], vec![PVC.to_string()]);
    }

    #[test]
    fn malformed_manifests_fail_the_sort() {
        let err = sort_manifests(&["metadata:\n  name: nameless\n".to_string()]).unwrap_err();
        assert!(err.to_string().contains("Object 'Kind' is missing"));
    }

    fn existing_with(spec_version: &str, kelda_version: &str) -> DynamicObject {
        let mut obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web" },
        }))
        .unwrap();
        let annotations = obj.metadata.annotations.get_or_insert_with(Default::default);
        annotations.insert(ANNOTATION_SPEC_VERSION.to_string(), spec_version.to_string());
        annotations.insert(ANNOTATION_KELDA_VERSION.to_string(), kelda_version.to_string());
        obj
    }

    #[test]
    fn update_needed_when_spec_version_changes() {
        let mut ms = Microservice::new("web", "dev", MicroserviceSpec::default());
        ms.spec_version = 2;
        assert!(should_update_object(&existing_with("1", "0.15.0"), &ms, "0.15.0"));
        assert!(!should_update_object(&existing_with("2", "0.15.0"), &ms, "0.15.0"));
    }

    #[test]
    fn dev_mode_also_tracks_the_platform_version() {
        let mut ms = Microservice::new("web", "dev", MicroserviceSpec::default());
        ms.spec_version = 2;
        ms.spec.dev_mode = true;
        assert!(should_update_object(&existing_with("2", "0.14.0"), &ms, "0.15.0"));
        assert!(!should_update_object(&existing_with("2", "0.15.0"), &ms, "0.15.0"));
    }
}
