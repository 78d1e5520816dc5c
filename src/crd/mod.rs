//! Custom resource schemas and the platform metadata stamped onto every
//! Kubernetes object the minion manages.

use std::borrow::Cow;
use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::core::NamespaceResourceScope;
use kube::{CustomResource, CustomResourceExt, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::tree::ObjectNode;

pub const GROUP: &str = "kelda.io";
pub const VERSION: &str = "v1alpha1";

/// Platform build version, stamped onto every injected object.
pub const KELDA_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Annotations applied to cluster children of a Microservice.
pub const ANNOTATION_MICROSERVICE: &str = "kelda.io.minion.microservice";
pub const ANNOTATION_SPEC_VERSION: &str = "kelda.io.minion.microserviceSpecVersion";
pub const ANNOTATION_KELDA_VERSION: &str = "kelda.io.minion.keldaVersion";

/// On the Microservice itself: the priority class its pods should run under.
pub const ANNOTATION_PRIORITY_CLASS: &str = "kelda.io.minion.microservicePriorityClass";

/// Pre-minion releases wrote these keys; they are still read when the modern
/// keys are absent.
pub const DEPRECATED_ANNOTATION_MICROSERVICE: &str = "kelda.io.microservice";
pub const DEPRECATED_ANNOTATION_SPEC_VERSION: &str = "kelda.io.microserviceSpecVersion";

/// Stamped at create time so `kubectl apply` users get a sane three-way diff.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Label marking namespaces and priority classes as platform-owned.
pub const MANAGED_LABEL: &str = "kelda-managed";
pub const MANAGED_LABEL_VALUE: &str = "true";

/// Registry credential secret copied into every workspace namespace.
pub const REGCRED_SECRET: &str = "regcred";

/// Service account used by pods rewritten for development mode.
pub const DEV_SERVICE_ACCOUNT: &str = "kelda-dev";

/// Highest priority value handed to a workspace; allocation descends from
/// here in steps of [`PRIORITY_STEP`] and wraps on underflow.
pub const MAX_POD_PRIORITY: i32 = 10_000_000;
pub const PRIORITY_STEP: i32 = 100;

/// One resolved container image digest, keyed by where it is consumed.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct ImageDigest {
    pub controller_name: String,
    pub container_name: String,
    pub image_url: String,
    pub digest: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceSpec {
    /// Raw manifest documents, each a single Kubernetes object in YAML.
    #[serde(default)]
    pub manifests: Vec<String>,
    #[serde(default)]
    pub has_service: bool,
    #[serde(default)]
    pub has_job: bool,
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_image: Option<String>,
    #[serde(default)]
    pub image_digests: Vec<ImageDigest>,
}

impl MicroserviceSpec {
    /// Equality of specs is defined modulo ordering of manifests and digest
    /// entries; the ingress server stores specs in this form.
    pub fn normalized(&self) -> MicroserviceSpec {
        let mut spec = self.clone();
        spec.manifests.sort();
        spec.image_digests.sort();
        spec
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum MetaPhase {
    #[default]
    Syncing,
    Synced,
    StatusSyncFailed,
    DeployFailed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ServicePhase {
    #[default]
    Starting,
    Failed,
    NotReady,
    Ready,
    Unknown,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum JobPhase {
    #[default]
    Starting,
    Running,
    Failed,
    Completed,
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MetaStatus {
    #[serde(default)]
    pub phase: MetaPhase,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceStatus {
    #[serde(default)]
    pub phase: ServicePhase,
    #[serde(default)]
    pub message: String,
}

impl ServiceStatus {
    pub fn new(phase: ServicePhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobStatus {
    #[serde(default)]
    pub phase: JobPhase,
    #[serde(default)]
    pub message: String,
}

impl JobStatus {
    pub fn new(phase: JobPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceStatus {
    #[serde(default)]
    pub meta_status: MetaStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_status: Option<ServiceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_status: Option<JobStatus>,
    /// The live owner-reference tree rooted at this Microservice.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "object_tree_schema")]
    pub actual: Vec<ObjectNode>,
}

/// Written by the external file-sync service, never by the controllers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DevStatus {
    #[serde(default)]
    pub pod: String,
    #[serde(default)]
    pub target_version: String,
    #[serde(default)]
    pub running_version: String,
}

/// The declarative representation of one service: a bundle of Kubernetes
/// manifests plus metadata.
///
/// `specVersion` and `devStatus` live beside `spec` on the wire, which the
/// `CustomResource` derive cannot express, so the resource trait is
/// implemented by hand.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Microservice {
    #[serde(default = "Microservice::default_api_version")]
    pub api_version: String,
    #[serde(default = "Microservice::default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: MicroserviceSpec,
    /// Monotonically increasing; bumped by the ingress server on each real
    /// spec change. Children are correlated with their source revision via
    /// the spec-version annotation.
    #[serde(default)]
    pub spec_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MicroserviceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_status: Option<DevStatus>,
}

impl Microservice {
    fn default_api_version() -> String {
        format!("{GROUP}/{VERSION}")
    }

    fn default_kind() -> String {
        "Microservice".to_string()
    }

    pub fn new(name: &str, namespace: &str, spec: MicroserviceSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec,
            spec_version: 0,
            status: None,
            dev_status: None,
        }
    }

    /// Owner reference children carry back to this Microservice.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            name: self.metadata.name.clone().unwrap_or_default(),
            uid: self.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// The priority class requested for this Microservice's pods, if any.
    pub fn priority_class(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_PRIORITY_CLASS))
            .map(String::as_str)
    }
}

impl Resource for Microservice {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_dt: &()) -> Cow<'_, str> {
        Cow::Borrowed("Microservice")
    }

    fn group(_dt: &()) -> Cow<'_, str> {
        Cow::Borrowed(GROUP)
    }

    fn version(_dt: &()) -> Cow<'_, str> {
        Cow::Borrowed(VERSION)
    }

    fn plural(_dt: &()) -> Cow<'_, str> {
        Cow::Borrowed("microservices")
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum TunnelPhase {
    #[default]
    Starting,
    Up,
    Crashed,
}

/// A declarative request for a long-lived port-forward from the developer's
/// machine to a pod inside a service.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kelda.io",
    version = "v1alpha1",
    kind = "Tunnel",
    namespaced,
    status = "TunnelStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSpec {
    /// Name of the Microservice within the same namespace.
    pub service: String,
    pub local_port: u16,
    pub remote_port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TunnelStatus {
    #[serde(default)]
    pub phase: TunnelPhase,
    #[serde(default)]
    pub message: String,
}

/// Name of the Tunnel CR for a requested tunnel.
pub fn tunnel_name(service: &str, local_port: u16, remote_port: u16) -> String {
    format!("{service}-{local_port}-{remote_port}")
}

/// Read the owning Microservice name from a child object's annotations,
/// falling back to the deprecated key.
pub fn microservice_name(annotations: &BTreeMap<String, String>) -> Option<&str> {
    annotations
        .get(ANNOTATION_MICROSERVICE)
        .or_else(|| annotations.get(DEPRECATED_ANNOTATION_MICROSERVICE))
        .map(String::as_str)
}

/// Read the spec version a child object was created from, falling back to
/// the deprecated key. `None` for both missing and unparseable values.
pub fn annotated_spec_version(annotations: &BTreeMap<String, String>) -> Option<u64> {
    annotations
        .get(ANNOTATION_SPEC_VERSION)
        .or_else(|| annotations.get(DEPRECATED_ANNOTATION_SPEC_VERSION))
        .and_then(|v| v.parse().ok())
}

fn object_tree_schema(_gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "array",
        "items": {
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true
        }
    }))
    .expect("static object tree schema")
}

fn inline_schema<T: JsonSchema>() -> serde_json::Value {
    let gen = schemars::gen::SchemaSettings::openapi3()
        .with(|s| {
            s.inline_subschemas = true;
            s.meta_schema = None;
        })
        .with_visitor(kube::core::schema::StructuralSchemaRewriter)
        .into_generator();
    serde_json::to_value(gen.into_root_schema_for::<T>()).expect("generated schema is valid JSON")
}

/// CRD for the Microservice resource. Built by hand for the same reason the
/// resource trait is: `specVersion` and `devStatus` sit beside `spec`.
pub fn microservice_crd() -> CustomResourceDefinition {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": { "name": format!("microservices.{GROUP}") },
        "spec": {
            "group": GROUP,
            "names": {
                "kind": "Microservice",
                "listKind": "MicroserviceList",
                "plural": "microservices",
                "singular": "microservice",
                "shortNames": ["ms"]
            },
            "scope": "Namespaced",
            "versions": [{
                "name": VERSION,
                "served": true,
                "storage": true,
                "schema": {
                    "openAPIV3Schema": {
                        "type": "object",
                        "properties": {
                            "spec": inline_schema::<MicroserviceSpec>(),
                            "specVersion": { "type": "integer", "format": "int64", "minimum": 0 },
                            "status": inline_schema::<MicroserviceStatus>(),
                            "devStatus": inline_schema::<DevStatus>(),
                        }
                    }
                }
            }]
        }
    }))
    .expect("static Microservice CRD")
}

/// CRD for the Tunnel resource.
pub fn tunnel_crd() -> CustomResourceDefinition {
    Tunnel::crd()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> MicroserviceSpec {
        MicroserviceSpec {
            manifests: vec!["b: 2".into(), "a: 1".into()],
            has_service: true,
            has_job: false,
            dev_mode: false,
            dev_image: None,
            image_digests: vec![
                ImageDigest {
                    controller_name: "web".into(),
                    container_name: "nginx".into(),
                    image_url: "nginx".into(),
                    digest: "sha256:bbb".into(),
                },
                ImageDigest {
                    controller_name: "api".into(),
                    container_name: "api".into(),
                    image_url: "api:v2".into(),
                    digest: "sha256:aaa".into(),
                },
            ],
        }
    }

    #[test]
    fn normalization_sorts_manifests_and_digests() {
        let norm = sample_spec().normalized();
        assert_eq!(norm.manifests, vec!["a: 1".to_string(), "b: 2".to_string()]);
        assert_eq!(norm.image_digests[0].controller_name, "api");
        // Two orderings of the same spec normalize to the same value.
        let mut reordered = sample_spec();
        reordered.manifests.reverse();
        reordered.image_digests.reverse();
        assert_eq!(norm, reordered.normalized());
    }

    #[test]
    fn microservice_round_trips_through_json() {
        let mut ms = Microservice::new("web", "dev-alice", sample_spec());
        ms.spec_version = 7;
        ms.status = Some(MicroserviceStatus {
            meta_status: MetaStatus {
                phase: MetaPhase::Synced,
                message: String::new(),
            },
            service_status: Some(ServiceStatus::new(ServicePhase::Ready, "")),
            job_status: None,
            actual: vec![],
        });
        ms.dev_status = Some(DevStatus {
            pod: "web-abc".into(),
            target_version: "3".into(),
            running_version: "3".into(),
        });

        let encoded = serde_json::to_value(&ms).unwrap();
        assert_eq!(encoded["specVersion"], 7);
        assert_eq!(encoded["devStatus"]["runningVersion"], "3");
        assert_eq!(encoded["status"]["serviceStatus"]["phase"], "Ready");

        let decoded: Microservice = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, ms);
    }

    #[test]
    fn tunnel_round_trips_through_json() {
        let mut tunnel = Tunnel::new(
            &tunnel_name("web", 8080, 80),
            TunnelSpec {
                service: "web".into(),
                local_port: 8080,
                remote_port: 80,
            },
        );
        tunnel.status = Some(TunnelStatus {
            phase: TunnelPhase::Up,
            message: String::new(),
        });

        let encoded = serde_json::to_value(&tunnel).unwrap();
        assert_eq!(encoded["metadata"]["name"], "web-8080-80");
        assert_eq!(encoded["spec"]["localPort"], 8080);
        assert_eq!(encoded["status"]["phase"], "Up");

        let decoded: Tunnel = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.spec, tunnel.spec);
        assert_eq!(decoded.status, tunnel.status);
    }

    #[test]
    fn owner_reference_points_back_with_controller_set() {
        let mut ms = Microservice::new("web", "dev-alice", MicroserviceSpec::default());
        ms.metadata.uid = Some("uid-123".into());
        let or = ms.owner_reference();
        assert_eq!(or.kind, "Microservice");
        assert_eq!(or.api_version, "kelda.io/v1alpha1");
        assert_eq!(or.uid, "uid-123");
        assert_eq!(or.controller, Some(true));
        assert_eq!(or.block_owner_deletion, Some(true));
    }

    #[test]
    fn deprecated_annotation_keys_are_honored() {
        let mut annotations = BTreeMap::new();
        annotations.insert(DEPRECATED_ANNOTATION_MICROSERVICE.to_string(), "web".into());
        annotations.insert(DEPRECATED_ANNOTATION_SPEC_VERSION.to_string(), "4".into());
        assert_eq!(microservice_name(&annotations), Some("web"));
        assert_eq!(annotated_spec_version(&annotations), Some(4));

        annotations.insert(ANNOTATION_MICROSERVICE.to_string(), "web-new".into());
        annotations.insert(ANNOTATION_SPEC_VERSION.to_string(), "5".into());
        assert_eq!(microservice_name(&annotations), Some("web-new"));
        assert_eq!(annotated_spec_version(&annotations), Some(5));
    }

    #[test]
    fn unparseable_spec_version_annotation_is_none() {
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_SPEC_VERSION.to_string(), "not-a-number".into());
        assert_eq!(annotated_spec_version(&annotations), None);
    }

    #[test]
    fn crds_are_well_formed() {
        let ms = microservice_crd();
        assert_eq!(ms.metadata.name.as_deref(), Some("microservices.kelda.io"));
        assert_eq!(ms.spec.versions.len(), 1);
        let tn = tunnel_crd();
        assert_eq!(tn.metadata.name.as_deref(), Some("tunnels.kelda.io"));
    }
}
