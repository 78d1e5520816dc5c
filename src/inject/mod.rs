//! Rewrites user-supplied manifests before they are applied: ownership and
//! platform metadata, image digest pinning, and the development-mode pod
//! template rewrite.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, ObjectFieldSelector, PodTemplateSpec,
    Volume, VolumeMount,
};
use kube::core::DynamicObject;
use tracing::warn;

use crate::crd::{
    Microservice, ANNOTATION_KELDA_VERSION, ANNOTATION_MICROSERVICE, ANNOTATION_SPEC_VERSION,
    DEV_SERVICE_ACCOUNT,
};
use crate::errors::FriendlyError;

/// Kinds whose pod template is rewritten during injection.
pub const POD_CONTROLLER_KINDS: [&str; 4] = ["Deployment", "DaemonSet", "Job", "StatefulSet"];

const BIN_VOLUME_NAME: &str = "kelda-bin";
const BIN_VOLUME_PATH: &str = "/bin-volume";
const INIT_CONTAINER_NAME: &str = "kelda-copy-minion";
const MINION_BINARY: &str = "kelda-minion";

/// The kind of a single manifest document.
pub fn manifest_kind(manifest: &str) -> Result<String> {
    let value: serde_json::Value =
        serde_yaml::from_str(manifest).context("parsing manifest YAML")?;
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
    Ok(kind)
}

pub struct Injector {
    /// Platform build version stamped onto every object.
    kelda_version: String,
    /// Image carrying the minion binary, used as the dev init container.
    platform_image: String,
    /// Path of the minion binary inside `platform_image`.
    binary_path: String,
}

impl Injector {
    pub fn new(kelda_version: &str, platform_image: &str, binary_path: &str) -> Self {
        Self {
            kelda_version: kelda_version.to_string(),
            platform_image: platform_image.to_string(),
            binary_path: binary_path.to_string(),
        }
    }

    /// Parse one manifest document and stamp it for the given Microservice.
    pub fn inject(&self, ms: &Microservice, manifest: &str) -> Result<DynamicObject> {
        let value: serde_json::Value =
            serde_yaml::from_str(manifest).context("parsing manifest YAML")?;

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

        let mut obj: DynamicObject =
            serde_json::from_value(value).context("decoding manifest object")?;

        let ms_name = ms.metadata.name.clone().unwrap_or_default();
        obj.metadata.namespace = ms.metadata.namespace.clone();

        let owner = ms.owner_reference();
        let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
        if !refs.iter().any(|r| r.kind == owner.kind && r.uid == owner.uid) {
            refs.push(owner);
        }

        let annotations = obj.metadata.annotations.get_or_insert_with(BTreeMap::new);
        stamp_annotations(annotations, &ms_name, ms.spec_version, &self.kelda_version);

        if !POD_CONTROLLER_KINDS.contains(&kind.as_str()) {
            return Ok(obj);
        }

        let controller_name = obj.metadata.name.clone().unwrap_or_default();
        let template_value = obj
            .data
            .pointer_mut("/spec/template")
            .with_context(|| format!("{kind} '{controller_name}' has no pod template"))?;
        let mut template: PodTemplateSpec = serde_json::from_value(template_value.take())
            .with_context(|| format!("decoding pod template of {kind} '{controller_name}'"))?;

        let template_annotations = template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new);
        stamp_annotations(
            template_annotations,
            &ms_name,
            ms.spec_version,
            &self.kelda_version,
        );

        let pod_spec = template.spec.get_or_insert_with(Default::default);

        for container in &mut pod_spec.containers {
            let image = container.image.clone().unwrap_or_default();
            let entry = ms.spec.image_digests.iter().find(|d| {
                d.controller_name == controller_name
                    && d.container_name == container.name
                    && d.image_url == image
            });
            match entry {
                Some(entry) => {
                    container.image = Some(with_digest(&image, &entry.digest));
                }
                None => {
                    warn!(
                        controller = %controller_name,
                        container = %container.name,
                        %image,
                        "no digest entry for container, deploying by tag"
                    );
                }
            }
        }

        if let Some(class) = ms.priority_class() {
            pod_spec.priority_class_name = Some(class.to_string());
        }

        if ms.spec.dev_mode {
            self.rewrite_for_dev(&ms_name, ms, pod_spec)?;
        }

        *template_value = serde_json::to_value(&template).context("encoding pod template")?;
        Ok(obj)
    }

    /// Development-mode rewrite: the single application container is replaced
    /// by the minion dev server, bootstrapped from a shared binary volume.
    fn rewrite_for_dev(
        &self,
        ms_name: &str,
        ms: &Microservice,
        pod_spec: &mut k8s_openapi::api::core::v1::PodSpec,
    ) -> Result<()> {
        if pod_spec.containers.len() != 1 {
            return Err(FriendlyError::new(format!(
                "development mode requires exactly one container, but '{ms_name}' has {}",
                pod_spec.containers.len()
            ))
            .into());
        }

        let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
        if !volumes.iter().any(|v| v.name == BIN_VOLUME_NAME) {
            volumes.push(Volume {
                name: BIN_VOLUME_NAME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        }

        let init = Container {
            name: INIT_CONTAINER_NAME.to_string(),
            image: Some(self.platform_image.clone()),
            command: Some(vec![
                "cp".to_string(),
                self.binary_path.clone(),
                format!("{BIN_VOLUME_PATH}/{MINION_BINARY}"),
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: BIN_VOLUME_NAME.to_string(),
                mount_path: BIN_VOLUME_PATH.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let inits = pod_spec.init_containers.get_or_insert_with(Vec::new);
        match inits.iter_mut().find(|c| c.name == INIT_CONTAINER_NAME) {
            Some(existing) => *existing = init,
            None => inits.push(init),
        }

        pod_spec.service_account_name = Some(DEV_SERVICE_ACCOUNT.to_string());

        let container = &mut pod_spec.containers[0];
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        if !mounts.iter().any(|m| m.name == BIN_VOLUME_NAME) {
            mounts.push(VolumeMount {
                name: BIN_VOLUME_NAME.to_string(),
                mount_path: BIN_VOLUME_PATH.to_string(),
                ..Default::default()
            });
        }

        // The shared volume may be mounted noexec; copy through /tmp first.
        container.command = Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "cp {BIN_VOLUME_PATH}/{MINION_BINARY} /tmp/{MINION_BINARY} && \
                 /tmp/{MINION_BINARY} dev-server {ms_name} {}",
                ms.spec_version
            ),
        ]);
        container.args = None;

        upsert_downward_env(container, "POD_NAME", "metadata.name");
        upsert_downward_env(container, "POD_NAMESPACE", "metadata.namespace");

        if let Some(dev_image) = &ms.spec.dev_image {
            container.image = Some(dev_image.clone());
        }

        // A service under development is expected to be broken.
        container.liveness_probe = None;
        container.readiness_probe = None;

        Ok(())
    }
}

fn stamp_annotations(
    annotations: &mut BTreeMap<String, String>,
    ms_name: &str,
    spec_version: u64,
    kelda_version: &str,
) {
    annotations.insert(ANNOTATION_MICROSERVICE.to_string(), ms_name.to_string());
    annotations.insert(ANNOTATION_SPEC_VERSION.to_string(), spec_version.to_string());
    annotations.insert(ANNOTATION_KELDA_VERSION.to_string(), kelda_version.to_string());
}

fn upsert_downward_env(container: &mut Container, name: &str, field_path: &str) {
    let var = EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let env = container.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == name) {
        Some(existing) => *existing = var,
        None => env.push(var),
    }
}

/// Strip any `:tag` or `@digest` suffix from an image URL.
pub fn strip_image(image: &str) -> &str {
    let base = image.split('@').next().unwrap_or(image);
    // A colon after the last slash is a tag separator; earlier colons belong
    // to the registry host port.
    let tag_start = match base.rfind('/') {
        Some(slash) => base[slash..].find(':').map(|i| slash + i),
        None => base.find(':'),
    };
    match tag_start {
        Some(i) => &base[..i],
        None => base,
    }
}

/// Pin an image URL to a digest, dropping any tag or prior digest.
pub fn with_digest(image: &str, digest: &str) -> String {
    format!("{}@{}", strip_image(image), digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ImageDigest, MicroserviceSpec, ANNOTATION_PRIORITY_CLASS};

    const NGINX_DEPLOYMENT: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: nginx-deployment
spec:
  replicas: 1
  template:
    spec:
      containers:
        - name: nginx-container
          image: nginx
          livenessProbe:
            httpGet:
              path: /
              port: 80
          readinessProbe:
            httpGet:
              path: /
              port: 80
"#;

    fn injector() -> Injector {
        Injector::new("0.15.0", "keldaio/kelda-minion:0.15.0", "/kelda-minion")
    }

    fn microservice(dev_mode: bool) -> Microservice {
        let mut ms = Microservice::new(
            "web",
            "dev-alice",
            MicroserviceSpec {
                manifests: vec![NGINX_DEPLOYMENT.to_string()],
                has_service: true,
                dev_mode,
                image_digests: vec![ImageDigest {
                    controller_name: "nginx-deployment".into(),
                    container_name: "nginx-container".into(),
                    image_url: "nginx".into(),
                    digest: "sha256:abc123".into(),
                }],
                ..Default::default()
            },
        );
        ms.metadata.uid = Some("ms-uid".into());
        ms.spec_version = 2;
        ms
    }

    fn pod_template(obj: &DynamicObject) -> PodTemplateSpec {
        serde_json::from_value(obj.data.pointer("/spec/template").unwrap().clone()).unwrap()
    }

    #[test]
    fn stamps_ownership_and_annotations() {
        let obj = injector().inject(&microservice(false), NGINX_DEPLOYMENT).unwrap();
        assert_eq!(obj.metadata.namespace.as_deref(), Some("dev-alice"));

        let refs = obj.metadata.owner_references.as_ref().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, "Microservice");
        assert_eq!(refs[0].uid, "ms-uid");
        assert_eq!(refs[0].controller, Some(true));

        let annotations = obj.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[ANNOTATION_MICROSERVICE], "web");
        assert_eq!(annotations[ANNOTATION_SPEC_VERSION], "2");
        assert_eq!(annotations[ANNOTATION_KELDA_VERSION], "0.15.0");

        let template = pod_template(&obj);
        let template_annotations = template.metadata.unwrap().annotations.unwrap();
        assert_eq!(template_annotations[ANNOTATION_SPEC_VERSION], "2");
    }

    #[test]
    fn missing_kind_is_a_friendly_error() {
        let err = injector()
            .inject(&microservice(false), "metadata:\n  name: nameless")
            .unwrap_err();
        assert!(err.to_string().contains("Object 'Kind' is missing"));
        assert!(err.downcast_ref::<FriendlyError>().is_some());
    }

    #[test]
    fn rewrites_images_to_digests() {
        let obj = injector().inject(&microservice(false), NGINX_DEPLOYMENT).unwrap();
        let template = pod_template(&obj);
        let image = template.spec.unwrap().containers[0].image.clone().unwrap();
        assert_eq!(image, "nginx@sha256:abc123");
    }

    #[test]
    fn non_pod_controller_objects_pass_through() {
        let manifest = "apiVersion: v1\nkind: Service\nmetadata:\n  name: web\nspec:\n  ports: []\n";
        let obj = injector().inject(&microservice(false), manifest).unwrap();
        assert!(obj.data.pointer("/spec/template").is_none());
        assert!(obj.metadata.annotations.is_some());
    }

    #[test]
    fn injection_is_idempotent() {
        let inj = injector();
        let ms = microservice(true);
        let once = inj.inject(&ms, NGINX_DEPLOYMENT).unwrap();
        let reserialized = serde_json::to_string(&once).unwrap();
        let twice = inj.inject(&ms, &reserialized).unwrap();
        assert_eq!(
            serde_json::to_value(&once).unwrap(),
            serde_json::to_value(&twice).unwrap()
        );
    }

    #[test]
    fn priority_class_is_copied_from_the_microservice() {
        let mut ms = microservice(false);
        ms.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_PRIORITY_CLASS.to_string(), "dev-alice".to_string());
        let obj = injector().inject(&ms, NGINX_DEPLOYMENT).unwrap();
        let template = pod_template(&obj);
        assert_eq!(
            template.spec.unwrap().priority_class_name.as_deref(),
            Some("dev-alice")
        );
    }

    #[test]
    fn dev_mode_rewrites_the_pod_template() {
        let mut ms = microservice(true);
        ms.spec.dev_image = Some("keldaio/devbox:latest".into());
        let obj = injector().inject(&ms, NGINX_DEPLOYMENT).unwrap();
        let spec = pod_template(&obj).spec.unwrap();

        assert_eq!(spec.service_account_name.as_deref(), Some(DEV_SERVICE_ACCOUNT));
        assert!(spec.volumes.unwrap().iter().any(|v| v.name == BIN_VOLUME_NAME));
        let inits = spec.init_containers.unwrap();
        assert_eq!(inits.len(), 1);
        assert_eq!(inits[0].image.as_deref(), Some("keldaio/kelda-minion:0.15.0"));

        let container = &spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("keldaio/devbox:latest"));
        assert!(container.liveness_probe.is_none());
        assert!(container.readiness_probe.is_none());
        let command = container.command.as_ref().unwrap();
        assert_eq!(command[0], "sh");
        assert!(command[2].contains("dev-server web 2"));
        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "POD_NAME"));
        assert!(env.iter().any(|e| e.name == "POD_NAMESPACE"));
    }

    #[test]
    fn dev_mode_rejects_multiple_containers() {
        let manifest = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  template:
    spec:
      containers:
        - name: one
          image: a
        - name: two
          image: b
"#;
        let err = injector().inject(&microservice(true), manifest).unwrap_err();
        let friendly = err.downcast_ref::<FriendlyError>().unwrap();
        assert!(friendly.message.contains("exactly one container"));
    }

    #[test]
    fn image_digest_strip_and_pin_round_trip() {
        assert_eq!(strip_image("nginx"), "nginx");
        assert_eq!(strip_image("nginx:1.25"), "nginx");
        assert_eq!(strip_image("nginx@sha256:abc"), "nginx");
        assert_eq!(strip_image("localhost:5000/app:v1"), "localhost:5000/app");
        assert_eq!(
            strip_image("registry.example.com:443/team/app@sha256:abc"),
            "registry.example.com:443/team/app"
        );

        let pinned = "quay.io/team/app@sha256:deadbeef";
        assert_eq!(with_digest(strip_image(pinned), "sha256:deadbeef"), pinned);
        assert_eq!(with_digest("quay.io/team/app:v2", "sha256:deadbeef"), pinned);
    }
}
