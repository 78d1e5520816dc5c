//! Per-workspace namespace isolation: managed-namespace admission, priority
//! class allocation, registry credential copies, and service accounts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{LocalObjectReference, Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, PostParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::crd::{
    DEV_SERVICE_ACCOUNT, MANAGED_LABEL, MANAGED_LABEL_VALUE, MAX_POD_PRIORITY, PRIORITY_STEP,
    REGCRED_SECRET,
};
use crate::errors::FriendlyError;
use crate::server::license::LicensePolicy;

const SERVICE_ACCOUNT_WAIT: Duration = Duration::from_secs(1);
const SERVICE_ACCOUNT_WAIT_ATTEMPTS: usize = 60;
const CONFLICT_RETRIES: usize = 5;

pub struct WorkspaceSetup {
    client: kube::Client,
    platform_namespace: String,
    license: Arc<dyn LicensePolicy>,
    /// Poll attempts while waiting for the default service account; tests
    /// shrink this.
    service_account_wait_attempts: usize,
}

impl WorkspaceSetup {
    pub fn new(
        client: kube::Client,
        platform_namespace: &str,
        license: Arc<dyn LicensePolicy>,
    ) -> Self {
        Self {
            client,
            platform_namespace: platform_namespace.to_string(),
            license,
            service_account_wait_attempts: SERVICE_ACCOUNT_WAIT_ATTEMPTS,
        }
    }

    /// Admit or create the workspace namespace. Returns license messages to
    /// surface to the user.
    pub async fn ensure_namespace(&self, namespace: &str) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespaces = api
            .list(&ListParams::default())
            .await
            .context("listing namespaces")?;

        if let Some(existing) = namespaces
            .items
            .iter()
            .find(|ns| ns.metadata.name.as_deref() == Some(namespace))
        {
            if !is_managed(&existing.metadata) {
                return Err(FriendlyError::new(format!(
                    "namespace '{namespace}' exists but is not managed by Kelda; \
                     use a different workspace name"
                ))
                .into());
            }
            let phase = existing
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or_default();
            if phase == "Terminating" {
                return Err(FriendlyError::transient(format!(
                    "namespace '{namespace}' is still terminating; try again shortly"
                ))
                .into());
            }
            return Ok(vec![]);
        }

        let managed_count = namespaces
            .items
            .iter()
            .filter(|ns| is_managed(&ns.metadata))
            .count();
        let messages = self.license.check_seats(managed_count + 1)?;

        let ns = Namespace {
            metadata: managed_metadata(namespace, None),
            ..Default::default()
        };
        api.create(&PostParams::default(), &ns)
            .await
            .with_context(|| format!("creating namespace '{namespace}'"))?;
        info!(%namespace, "created workspace namespace");
        Ok(messages)
    }

    /// Allocate the per-workspace PriorityClass, if the cluster serves the
    /// scheduling API group. Returns the class name to annotate onto the
    /// workspace's Microservices.
    pub async fn ensure_priority_class(&self, namespace: &str) -> Result<Option<String>> {
        if kube::discovery::group(&self.client, "scheduling.k8s.io")
            .await
            .is_err()
        {
            debug!("scheduling.k8s.io is not served, skipping priority class");
            return Ok(None);
        }

        let api: Api<PriorityClass> = Api::all(self.client.clone());
        match api.get(namespace).await {
            Ok(_) => return Ok(Some(namespace.to_string())),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(err) => return Err(err).context("fetching priority class"),
        }

        let managed = api
            .list(&ListParams::default().labels(&format!("{MANAGED_LABEL}={MANAGED_LABEL_VALUE}")))
            .await
            .context("listing managed priority classes")?
            .items;

        let class = PriorityClass {
            metadata: managed_metadata(namespace, None),
            value: next_priority_value(&managed),
            global_default: Some(false),
            description: Some(format!("Kelda workspace '{namespace}'")),
            ..Default::default()
        };
        match api.create(&PostParams::default(), &class).await {
            Ok(_) => info!(%namespace, value = class.value, "created priority class"),
            // Another workspace creation raced us; the class exists now.
            Err(kube::Error::Api(ae)) if ae.code == 409 => {}
            Err(err) => return Err(err).context("creating priority class"),
        }
        Ok(Some(namespace.to_string()))
    }

    /// Copy the platform registry credential secret into the workspace.
    pub async fn copy_regcred(&self, namespace: &str) -> Result<()> {
        let source: Api<Secret> = Api::namespaced(self.client.clone(), &self.platform_namespace);
        let secret = match source.get(REGCRED_SECRET).await {
            Ok(secret) => secret,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                warn!(
                    "no '{REGCRED_SECRET}' secret in namespace '{}', workspaces will pull \
                     images anonymously",
                    self.platform_namespace
                );
                return Ok(());
            }
            Err(err) => return Err(err).context("fetching registry credential secret"),
        };

        // Identity fields must not travel across namespaces.
        let copy = Secret {
            metadata: ObjectMeta {
                name: Some(REGCRED_SECRET.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: secret.data,
            type_: secret.type_,
            ..Default::default()
        };
        let target: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        create_or_replace(&target, REGCRED_SECRET, copy).await
    }

    /// Wait for the namespace's default service account and point it at the
    /// copied registry credentials.
    pub async fn ensure_default_service_account(&self, namespace: &str) -> Result<()> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        for _ in 0..self.service_account_wait_attempts {
            match api.get("default").await {
                Ok(_) => return patch_pull_secrets(&api, "default").await,
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    tokio::time::sleep(SERVICE_ACCOUNT_WAIT).await;
                }
                Err(err) => return Err(err).context("fetching default service account"),
            }
        }
        anyhow::bail!("timed out waiting for the default service account in '{namespace}'")
    }

    /// The dev-mode service account plus a role granting everything in the
    /// workspace namespace.
    pub async fn ensure_dev_service_account(&self, namespace: &str) -> Result<()> {
        let sa = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(DEV_SERVICE_ACCOUNT.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            image_pull_secrets: Some(vec![LocalObjectReference {
                name: REGCRED_SECRET.to_string(),
            }]),
            ..Default::default()
        };
        let sa_api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        create_or_replace(&sa_api, DEV_SERVICE_ACCOUNT, sa).await?;

        let role = Role {
            metadata: ObjectMeta {
                name: Some(DEV_SERVICE_ACCOUNT.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec!["*".to_string()]),
                resources: Some(vec!["*".to_string()]),
                verbs: vec!["*".to_string()],
                ..Default::default()
            }]),
        };
        let role_api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        create_or_replace(&role_api, DEV_SERVICE_ACCOUNT, role).await?;

        let binding = RoleBinding {
            metadata: ObjectMeta {
                name: Some(DEV_SERVICE_ACCOUNT.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: DEV_SERVICE_ACCOUNT.to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: DEV_SERVICE_ACCOUNT.to_string(),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            }]),
        };
        let binding_api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        create_or_replace(&binding_api, DEV_SERVICE_ACCOUNT, binding).await
    }
}

fn is_managed(metadata: &ObjectMeta) -> bool {
    metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(MANAGED_LABEL))
        .map(String::as_str)
        == Some(MANAGED_LABEL_VALUE)
}

fn managed_metadata(name: &str, namespace: Option<&str>) -> ObjectMeta {
    let mut labels = std::collections::BTreeMap::new();
    labels.insert(MANAGED_LABEL.to_string(), MANAGED_LABEL_VALUE.to_string());
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels),
        ..Default::default()
    }
}

/// Next priority value: the full maximum for the first workspace, otherwise
/// one step below the most recently created managed class, wrapping back to
/// the maximum on underflow.
pub fn next_priority_value(managed: &[PriorityClass]) -> i32 {
    let latest = managed.iter().max_by_key(|pc| {
        pc.metadata
            .creation_timestamp
            .as_ref()
            .map(|time| time.0)
    });
    match latest {
        None => MAX_POD_PRIORITY,
        Some(latest) => {
            let value = latest.value - PRIORITY_STEP;
            if value < 0 {
                MAX_POD_PRIORITY
            } else {
                value
            }
        }
    }
}

async fn patch_pull_secrets(api: &Api<ServiceAccount>, name: &str) -> Result<()> {
    for _ in 0..CONFLICT_RETRIES {
        let mut sa = api
            .get(name)
            .await
            .with_context(|| format!("fetching service account '{name}'"))?;
        sa.image_pull_secrets = Some(vec![LocalObjectReference {
            name: REGCRED_SECRET.to_string(),
        }]);
        match api.replace(name, &PostParams::default(), &sa).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("patching service account '{name}'"))
            }
        }
    }
    anyhow::bail!("persistent conflicts patching service account '{name}'")
}

/// Create the object, or overwrite the existing one of the same name.
pub async fn create_or_replace<K>(api: &Api<K>, name: &str, mut obj: K) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + std::fmt::Debug + DeserializeOwned + Serialize,
{
    match api.create(&PostParams::default(), &obj).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            let existing = api
                .get(name)
                .await
                .with_context(|| format!("fetching existing '{name}'"))?;
            obj.meta_mut().resource_version = existing.meta().resource_version.clone();
            api.replace(name, &PostParams::default(), &obj)
                .await
                .with_context(|| format!("replacing '{name}'"))?;
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("creating '{name}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn class(value: i32, created_secs: i64) -> PriorityClass {
        PriorityClass {
            metadata: ObjectMeta {
                creation_timestamp: Some(Time(
                    chrono::DateTime::from_timestamp(created_secs, 0).unwrap(),
                )),
                ..Default::default()
            },
            value,
            ..Default::default()
        }
    }

    #[test]
    fn first_workspace_gets_the_maximum() {
        assert_eq!(next_priority_value(&[]), MAX_POD_PRIORITY);
    }

    #[test]
    fn values_descend_from_the_latest_class() {
        let classes = vec![class(MAX_POD_PRIORITY, 100), class(MAX_POD_PRIORITY - 100, 200)];
        assert_eq!(next_priority_value(&classes), MAX_POD_PRIORITY - 200);
    }

    #[test]
    fn consecutive_allocations_never_collide_within_a_window() {
        let mut classes = vec![];
        let mut seen = std::collections::HashSet::new();
        for i in 0..100 {
            let value = next_priority_value(&classes);
            assert!(seen.insert(value), "value {value} allocated twice");
            classes.push(class(value, i));
        }
    }

    #[test]
    fn underflow_wraps_back_to_the_maximum() {
        let classes = vec![class(50, 100)];
        assert_eq!(next_priority_value(&classes), MAX_POD_PRIORITY);
    }

    #[test]
    fn managed_label_detection() {
        assert!(is_managed(&managed_metadata("dev", None)));
        assert!(!is_managed(&ObjectMeta::default()));
    }
}
