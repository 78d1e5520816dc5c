//! Container image digest resolution against OCI registries, using the
//! registry credentials a workspace namespace already carries.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::api::Api;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client as OciClient, Reference};
use tracing::{debug, warn};

/// Resolves an image URL to its registry manifest digest.
///
/// Resolution failures are non-fatal to callers: a service whose digest
/// cannot be resolved is deployed by tag.
#[async_trait]
pub trait DigestResolver: Send + Sync {
    async fn resolve(
        &self,
        image_url: &str,
        pull_secrets: &[String],
        service_account: &str,
        namespace: &str,
    ) -> Result<String>;
}

/// The digest already embedded in an image URL, if any.
pub fn existing_digest(image_url: &str) -> Option<String> {
    Reference::try_from(image_url)
        .ok()
        .and_then(|r| r.digest().map(str::to_string))
}

/// Real resolver: collects docker-config credentials from the named pull
/// secrets and service account, then asks the registry for the manifest
/// digest with each credential in turn, falling back to anonymous access.
pub struct OciDigestResolver {
    kube: kube::Client,
}

impl OciDigestResolver {
    pub fn new(kube: kube::Client) -> Self {
        Self { kube }
    }

    async fn docker_configs(
        &self,
        pull_secrets: &[String],
        service_account: &str,
        namespace: &str,
    ) -> Vec<serde_json::Value> {
        let mut names: Vec<String> = pull_secrets.to_vec();

        let sa_api: Api<ServiceAccount> = Api::namespaced(self.kube.clone(), namespace);
        match sa_api.get(service_account).await {
            Ok(sa) => {
                for reference in sa.image_pull_secrets.unwrap_or_default() {
                    let name = reference.name;
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
            Err(err) => {
                debug!(service_account, %err, "could not read service account pull secrets");
            }
        }

        let secret_api: Api<Secret> = Api::namespaced(self.kube.clone(), namespace);
        let mut configs = Vec::new();
        for name in names {
            let secret = match secret_api.get(&name).await {
                Ok(secret) => secret,
                Err(err) => {
                    debug!(secret = %name, %err, "skipping unreadable pull secret");
                    continue;
                }
            };
            let Some(blob) = secret
                .data
                .as_ref()
                .and_then(|d| d.get(".dockerconfigjson"))
            else {
                continue;
            };
            match serde_json::from_slice(&blob.0) {
                Ok(config) => configs.push(config),
                Err(err) => warn!(secret = %name, %err, "malformed dockerconfigjson"),
            }
        }
        configs
    }
}

#[async_trait]
impl DigestResolver for OciDigestResolver {
    async fn resolve(
        &self,
        image_url: &str,
        pull_secrets: &[String],
        service_account: &str,
        namespace: &str,
    ) -> Result<String> {
        let reference = Reference::try_from(image_url)
            .with_context(|| format!("parsing image reference '{image_url}'"))?;
        if let Some(digest) = reference.digest() {
            return Ok(digest.to_string());
        }

        let client = OciClient::new(Default::default());
        let mut failures: Vec<String> = Vec::new();

        let configs = self
            .docker_configs(pull_secrets, service_account, namespace)
            .await;
        for config in &configs {
            let Some((username, password)) = credentials_for(config, reference.registry()) else {
                continue;
            };
            match client
                .pull_manifest(&reference, &RegistryAuth::Basic(username.clone(), password))
                .await
            {
                Ok((_, digest)) => return Ok(digest),
                Err(err) => failures.push(format!("as '{username}': {err}")),
            }
        }

        match client.pull_manifest(&reference, &RegistryAuth::Anonymous).await {
            Ok((_, digest)) => Ok(digest),
            Err(err) => {
                failures.push(format!("anonymously: {err}"));
                Err(anyhow!(
                    "resolving digest for '{image_url}': {}",
                    failures.join("; ")
                ))
            }
        }
    }
}

/// Credentials for `registry` from one parsed dockerconfigjson blob.
pub fn credentials_for(config: &serde_json::Value, registry: &str) -> Option<(String, String)> {
    let auths = config.get("auths")?.as_object()?;
    for (host, entry) in auths {
        if !hosts_match(host, registry) {
            continue;
        }
        let username = entry.get("username").and_then(|v| v.as_str());
        let password = entry.get("password").and_then(|v| v.as_str());
        if let (Some(username), Some(password)) = (username, password) {
            return Some((username.to_string(), password.to_string()));
        }
        // Fall back to the combined base64 `auth` field.
        if let Some(auth) = entry.get("auth").and_then(|v| v.as_str()) {
            if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(auth) {
                if let Ok(pair) = String::from_utf8(decoded) {
                    if let Some((username, password)) = pair.split_once(':') {
                        return Some((username.to_string(), password.to_string()));
                    }
                }
            }
        }
    }
    None
}

fn hosts_match(config_host: &str, registry: &str) -> bool {
    let normalized = normalize_host(config_host);
    normalized == registry || (is_docker_hub(normalized) && is_docker_hub(registry))
}

fn normalize_host(host: &str) -> &str {
    host.trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .trim_end_matches("/v1")
}

fn is_docker_hub(host: &str) -> bool {
    matches!(host, "docker.io" | "index.docker.io" | "registry-1.docker.io")
}

/// Test resolver returning canned digests by image URL.
pub struct FixedDigests(pub HashMap<String, String>);

#[async_trait]
impl DigestResolver for FixedDigests {
    async fn resolve(
        &self,
        image_url: &str,
        _pull_secrets: &[String],
        _service_account: &str,
        _namespace: &str,
    ) -> Result<String> {
        self.0
            .get(image_url)
            .cloned()
            .ok_or_else(|| anyhow!("no digest known for '{image_url}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_with_digests_resolve_verbatim() {
        assert_eq!(
            existing_digest("quay.io/team/app@sha256:deadbeef").as_deref(),
            Some("sha256:deadbeef")
        );
        assert_eq!(existing_digest("nginx:1.25"), None);
        assert_eq!(existing_digest("nginx"), None);
    }

    #[test]
    fn reference_parsing_applies_defaults() {
        let reference = Reference::try_from("nginx").unwrap();
        assert!(is_docker_hub(reference.registry()), "got {}", reference.registry());
        assert!(reference.repository().contains("nginx"));
    }

    fn config(host: &str) -> serde_json::Value {
        serde_json::json!({
            "auths": {
                host: { "username": "alice", "password": "hunter2" }
            }
        })
    }

    #[test]
    fn credentials_match_exact_host() {
        let creds = credentials_for(&config("quay.io"), "quay.io").unwrap();
        assert_eq!(creds, ("alice".to_string(), "hunter2".to_string()));
        assert!(credentials_for(&config("quay.io"), "gcr.io").is_none());
    }

    #[test]
    fn credentials_match_docker_hub_aliases() {
        let reference = Reference::try_from("nginx").unwrap();
        for host in ["https://index.docker.io/v1/", "docker.io", "registry-1.docker.io"] {
            assert!(
                credentials_for(&config(host), reference.registry()).is_some(),
                "expected {host} to match {}",
                reference.registry()
            );
        }
    }

    #[test]
    fn credentials_fall_back_to_the_auth_field() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("bob:s3cret");
        let config = serde_json::json!({ "auths": { "quay.io": { "auth": encoded } } });
        let creds = credentials_for(&config, "quay.io").unwrap();
        assert_eq!(creds, ("bob".to_string(), "s3cret".to_string()));
    }

    #[tokio::test]
    async fn fixed_digests_resolve_known_urls() {
        let resolver = FixedDigests(HashMap::from([(
            "nginx".to_string(),
            "sha256:abc".to_string(),
        )]));
        let digest = resolver.resolve("nginx", &[], "default", "dev").await.unwrap();
        assert_eq!(digest, "sha256:abc");
        assert!(resolver.resolve("redis", &[], "default", "dev").await.is_err());
    }
}
