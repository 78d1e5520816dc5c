//! Owner-reference forest over a namespace's Kubernetes objects.
//!
//! Each node holds only its children; parents are implicit in the indexing
//! pass, so the emitted forest is a pure tree. A tree is identified by the
//! owning Microservice UID and the spec version its root was created from.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

use crate::crd::annotated_spec_version;

/// Identifies one tree: the owning Microservice UID and the spec version its
/// objects were created from.
pub type TreeKey = (String, u64);

/// One of the Kubernetes object kinds the status controller aggregates over.
#[derive(Clone, Debug, PartialEq)]
pub enum KubeObject {
    Pod(Pod),
    Job(Job),
    Deployment(Deployment),
    ReplicaSet(ReplicaSet),
    StatefulSet(StatefulSet),
    DaemonSet(DaemonSet),
}

impl KubeObject {
    pub fn kind(&self) -> &'static str {
        match self {
            KubeObject::Pod(_) => "Pod",
            KubeObject::Job(_) => "Job",
            KubeObject::Deployment(_) => "Deployment",
            KubeObject::ReplicaSet(_) => "ReplicaSet",
            KubeObject::StatefulSet(_) => "StatefulSet",
            KubeObject::DaemonSet(_) => "DaemonSet",
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            KubeObject::Pod(o) => &o.metadata,
            KubeObject::Job(o) => &o.metadata,
            KubeObject::Deployment(o) => &o.metadata,
            KubeObject::ReplicaSet(o) => &o.metadata,
            KubeObject::StatefulSet(o) => &o.metadata,
            KubeObject::DaemonSet(o) => &o.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn uid(&self) -> &str {
        self.metadata().uid.as_deref().unwrap_or_default()
    }

    fn owner_references(&self) -> &[OwnerReference] {
        self.metadata()
            .owner_references
            .as_deref()
            .unwrap_or_default()
    }

    /// The Microservice owner reference, if this object is a root.
    fn microservice_owner(&self) -> Option<&OwnerReference> {
        self.owner_references()
            .iter()
            .find(|or| or.kind == "Microservice")
    }
}

// The tree is embedded in the Microservice status, so nodes serialize the
// object inline the way the API server would print it; `kind` disambiguates
// on the way back in.
impl Serialize for KubeObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            KubeObject::Pod(o) => o.serialize(serializer),
            KubeObject::Job(o) => o.serialize(serializer),
            KubeObject::Deployment(o) => o.serialize(serializer),
            KubeObject::ReplicaSet(o) => o.serialize(serializer),
            KubeObject::StatefulSet(o) => o.serialize(serializer),
            KubeObject::DaemonSet(o) => o.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for KubeObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or_default()
            .to_string();
        let object = match kind.as_str() {
            "Pod" => KubeObject::Pod(serde_json::from_value(value).map_err(D::Error::custom)?),
            "Job" => KubeObject::Job(serde_json::from_value(value).map_err(D::Error::custom)?),
            "Deployment" => {
                KubeObject::Deployment(serde_json::from_value(value).map_err(D::Error::custom)?)
            }
            "ReplicaSet" => {
                KubeObject::ReplicaSet(serde_json::from_value(value).map_err(D::Error::custom)?)
            }
            "StatefulSet" => {
                KubeObject::StatefulSet(serde_json::from_value(value).map_err(D::Error::custom)?)
            }
            "DaemonSet" => {
                KubeObject::DaemonSet(serde_json::from_value(value).map_err(D::Error::custom)?)
            }
            other => return Err(D::Error::custom(format!("unsupported object kind {other:?}"))),
        };
        Ok(object)
    }
}

/// A Kubernetes object with its recursive children.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectNode {
    #[serde(flatten)]
    pub object: KubeObject,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ObjectNode>,
}

impl ObjectNode {
    pub fn new(object: KubeObject) -> Self {
        Self {
            object,
            children: Vec::new(),
        }
    }
}

/// Build the owner-reference forest for one namespace's objects.
///
/// Objects directly owned by a Microservice become roots under the key
/// derived from that reference and the object's spec-version annotation;
/// everything else is attached to every owner present in the input. Orphans
/// and roots without a parseable spec version are dropped.
pub fn build(objects: Vec<KubeObject>) -> BTreeMap<TreeKey, Vec<ObjectNode>> {
    let mut index: HashMap<String, KubeObject> = HashMap::new();
    for object in objects {
        index.insert(object.uid().to_string(), object);
    }

    // First pass: split roots from objects that need second-pass parenting.
    let mut roots: Vec<(TreeKey, String)> = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    for object in index.values() {
        if let Some(owner) = object.microservice_owner() {
            let annotations = object.metadata().annotations.clone().unwrap_or_default();
            match annotated_spec_version(&annotations) {
                Some(version) => {
                    roots.push(((owner.uid.clone(), version), object.uid().to_string()));
                }
                None => {
                    warn!(
                        kind = object.kind(),
                        name = object.name(),
                        "dropping object with missing or unparseable spec version annotation"
                    );
                }
            }
        } else {
            pending.push(object.uid().to_string());
        }
    }

    // Second pass: attach each non-root to every owner present in the index.
    let mut children_of: HashMap<String, Vec<String>> = HashMap::new();
    for uid in pending {
        let object = &index[&uid];
        let mut attached = false;
        for owner in object.owner_references() {
            if index.contains_key(&owner.uid) {
                children_of.entry(owner.uid.clone()).or_default().push(uid.clone());
                attached = true;
            }
        }
        if !attached {
            debug!(
                kind = object.kind(),
                name = object.name(),
                "dropping orphan whose owners are not in the namespace"
            );
        }
    }

    let mut forest: BTreeMap<TreeKey, Vec<ObjectNode>> = BTreeMap::new();
    for (key, uid) in roots {
        let node = assemble(&uid, &index, &children_of);
        forest.entry(key).or_default().push(node);
    }
    // Deterministic ordering for status comparison.
    for nodes in forest.values_mut() {
        nodes.sort_by(|a, b| a.object.name().cmp(b.object.name()));
    }
    forest
}

fn assemble(
    uid: &str,
    index: &HashMap<String, KubeObject>,
    children_of: &HashMap<String, Vec<String>>,
) -> ObjectNode {
    let mut node = ObjectNode::new(index[uid].clone());
    if let Some(child_uids) = children_of.get(uid) {
        for child in child_uids {
            node.children.push(assemble(child, index, children_of));
        }
        node.children
            .sort_by(|a, b| a.object.name().cmp(b.object.name()));
    }
    node
}

/// All Pods in the given subtrees, optionally filtered to `Running` phase.
pub fn select_pods<'a>(roots: &'a [ObjectNode], only_running: bool) -> Vec<&'a Pod> {
    let mut pods = Vec::new();
    for root in roots {
        collect_pods(root, only_running, &mut pods);
    }
    pods
}

fn collect_pods<'a>(node: &'a ObjectNode, only_running: bool, out: &mut Vec<&'a Pod>) {
    if let KubeObject::Pod(pod) = &node.object {
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or_default();
        if !only_running || phase == "Running" {
            out.push(pod);
        }
    }
    for child in &node.children {
        collect_pods(child, only_running, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ANNOTATION_MICROSERVICE, ANNOTATION_SPEC_VERSION};
    use k8s_openapi::api::core::v1::PodStatus;

    fn meta(
        name: &str,
        uid: &str,
        owner: Option<(&str, &str)>,
        spec_version: Option<&str>,
    ) -> ObjectMeta {
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_MICROSERVICE.to_string(), "web".to_string());
        if let Some(v) = spec_version {
            annotations.insert(ANNOTATION_SPEC_VERSION.to_string(), v.to_string());
        }
        ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(uid.to_string()),
            annotations: Some(annotations),
            owner_references: owner.map(|(kind, owner_uid)| {
                vec![OwnerReference {
                    api_version: "kelda.io/v1alpha1".to_string(),
                    kind: kind.to_string(),
                    name: "web".to_string(),
                    uid: owner_uid.to_string(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]
            }),
            ..Default::default()
        }
    }

    fn deployment(name: &str, uid: &str, ms_uid: &str, version: Option<&str>) -> KubeObject {
        KubeObject::Deployment(Deployment {
            metadata: meta(name, uid, Some(("Microservice", ms_uid)), version),
            ..Default::default()
        })
    }

    fn replica_set(name: &str, uid: &str, parent_uid: &str) -> KubeObject {
        KubeObject::ReplicaSet(ReplicaSet {
            metadata: meta(name, uid, Some(("Deployment", parent_uid)), None),
            ..Default::default()
        })
    }

    fn pod(name: &str, uid: &str, parent: Option<(&str, &str)>, phase: &str) -> KubeObject {
        KubeObject::Pod(Pod {
            metadata: meta(name, uid, parent, None),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    #[test]
    fn builds_a_forest_keyed_by_owner_and_version() {
        let forest = build(vec![
            deployment("web-deploy", "d1", "ms1", Some("3")),
            replica_set("web-deploy-abc", "rs1", "d1"),
            pod("web-pod", "p1", Some(("ReplicaSet", "rs1")), "Running"),
        ]);

        assert_eq!(forest.len(), 1);
        let roots = &forest[&("ms1".to_string(), 3)];
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].object.name(), "web-deploy");
        assert_eq!(roots[0].children.len(), 1);
        assert_eq!(roots[0].children[0].object.name(), "web-deploy-abc");
        assert_eq!(roots[0].children[0].children[0].object.name(), "web-pod");
    }

    #[test]
    fn versions_split_into_distinct_trees() {
        let forest = build(vec![
            deployment("old", "d1", "ms1", Some("1")),
            deployment("new", "d2", "ms1", Some("2")),
        ]);
        assert_eq!(forest.len(), 2);
        assert_eq!(forest[&("ms1".to_string(), 1)][0].object.name(), "old");
        assert_eq!(forest[&("ms1".to_string(), 2)][0].object.name(), "new");
    }

    #[test]
    fn orphans_are_dropped() {
        let forest = build(vec![
            deployment("web-deploy", "d1", "ms1", Some("1")),
            pod("stray", "p9", Some(("ReplicaSet", "rs-not-here")), "Running"),
        ]);
        let roots = &forest[&("ms1".to_string(), 1)];
        assert_eq!(roots.len(), 1);
        assert!(roots[0].children.is_empty());
    }

    #[test]
    fn unparseable_spec_version_drops_the_root_only() {
        let forest = build(vec![
            deployment("bad", "d1", "ms1", Some("zero")),
            deployment("good", "d2", "ms1", Some("0")),
        ]);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[&("ms1".to_string(), 0)][0].object.name(), "good");
    }

    #[test]
    fn select_pods_filters_running() {
        let forest = build(vec![
            deployment("web-deploy", "d1", "ms1", Some("1")),
            pod("running", "p1", Some(("Deployment", "d1")), "Running"),
            pod("pending", "p2", Some(("Deployment", "d1")), "Pending"),
        ]);
        let roots = &forest[&("ms1".to_string(), 1)];
        assert_eq!(select_pods(roots, false).len(), 2);
        let running = select_pods(roots, true);
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].metadata.name.as_deref(), Some("running"));
    }

    #[test]
    fn nodes_round_trip_through_json() {
        let forest = build(vec![
            deployment("web-deploy", "d1", "ms1", Some("1")),
            pod("web-pod", "p1", Some(("Deployment", "d1")), "Running"),
        ]);
        let roots = &forest[&("ms1".to_string(), 1)];
        let encoded = serde_json::to_value(roots).unwrap();
        assert_eq!(encoded[0]["kind"], "Deployment");
        assert_eq!(encoded[0]["children"][0]["kind"], "Pod");
        let decoded: Vec<ObjectNode> = serde_json::from_value(encoded).unwrap();
        assert_eq!(&decoded, roots);
    }
}
