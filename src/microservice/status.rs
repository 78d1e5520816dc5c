//! Health aggregation: collapsing the owner-reference tree of a Microservice
//! into one service status and one job status.

use k8s_openapi::api::core::v1::{Node, Pod, Taint, Toleration};

use crate::crd::{JobPhase, JobStatus, ServicePhase, ServiceStatus};
use crate::tree::{select_pods, KubeObject, ObjectNode};

/// Number of non-Job pod controllers a spec declares, counted from its
/// manifests. Unparseable documents are ignored; they never made it past the
/// apply path anyway.
pub fn expected_non_job_controllers(manifests: &[String]) -> usize {
    manifests
        .iter()
        .filter_map(|m| crate::inject::manifest_kind(m).ok())
        .filter(|k| matches!(k.as_str(), "Deployment" | "StatefulSet" | "DaemonSet"))
        .count()
}

/// Aggregate service health over the tree roots, least-healthy answer first.
pub fn service_status_for_microservice(
    expected_non_job_controllers: usize,
    roots: &[ObjectNode],
    nodes: &[Node],
) -> ServiceStatus {
    let controllers: Vec<&ObjectNode> = roots
        .iter()
        .filter(|r| {
            matches!(
                r.object,
                KubeObject::Deployment(_) | KubeObject::StatefulSet(_) | KubeObject::DaemonSet(_)
            )
        })
        .collect();

    if controllers.len() < expected_non_job_controllers {
        return ServiceStatus::new(ServicePhase::Starting, "Waiting for controllers to be created");
    }
    if expected_non_job_controllers == 0 {
        // The spec is a bag of non-controller resources like Secrets.
        return ServiceStatus::new(ServicePhase::Ready, "");
    }

    let statuses: Vec<ServiceStatus> = controllers
        .iter()
        .map(|root| root_service_status(root, nodes))
        .collect();

    for phase in [
        ServicePhase::Starting,
        ServicePhase::Failed,
        ServicePhase::NotReady,
        ServicePhase::Ready,
        ServicePhase::Unknown,
    ] {
        if let Some(status) = statuses.iter().find(|s| s.phase == phase) {
            return status.clone();
        }
    }
    ServiceStatus::new(ServicePhase::Unknown, "no pod controllers found")
}

fn root_service_status(root: &ObjectNode, nodes: &[Node]) -> ServiceStatus {
    let mut unknown: Option<String> = None;
    let mut failed: Option<String> = None;
    let mut starting: Option<String> = None;

    for pod in select_pods(std::slice::from_ref(root), false) {
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or_default();
        let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
        match phase {
            "Unknown" => unknown = Some(format!("Pod {pod_name} is in an unknown state")),
            "Failed" => failed = Some(format!("Pod {pod_name} failed")),
            "Pending" => starting = Some(format!("Waiting for Pod {pod_name} to be scheduled")),
            _ => {}
        }
        if let Some(message) = fatal_pod_state(pod, nodes) {
            failed = Some(message);
        }
    }

    if let Some(message) = unknown {
        return ServiceStatus::new(ServicePhase::Unknown, message);
    }
    if let Some(message) = failed {
        return ServiceStatus::new(ServicePhase::Failed, message);
    }
    if let Some(message) = starting {
        return ServiceStatus::new(ServicePhase::Starting, message);
    }

    let (created, ready, expected) = match &root.object {
        KubeObject::Deployment(_) => {
            // Readiness lives on the Deployment's single ReplicaSet.
            let Some(rs) = root.children.iter().find_map(|c| match &c.object {
                KubeObject::ReplicaSet(rs) => Some(rs),
                _ => None,
            }) else {
                return ServiceStatus::new(
                    ServicePhase::Starting,
                    "Waiting for replica set to be created",
                );
            };
            let status = rs.status.clone().unwrap_or_default();
            (
                status.replicas,
                status.ready_replicas.unwrap_or(0),
                rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            )
        }
        KubeObject::StatefulSet(sts) => {
            let status = sts.status.clone().unwrap_or_default();
            (
                status.current_replicas.unwrap_or(0),
                status.ready_replicas.unwrap_or(0),
                sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            )
        }
        KubeObject::DaemonSet(ds) => {
            let status = ds.status.clone().unwrap_or_default();
            (
                status.current_number_scheduled,
                status.number_ready,
                status.desired_number_scheduled,
            )
        }
        _ => return ServiceStatus::new(ServicePhase::Unknown, ""),
    };

    if created < expected {
        ServiceStatus::new(ServicePhase::Starting, "Waiting for pods to be created")
    } else if ready < created {
        ServiceStatus::new(ServicePhase::NotReady, "Waiting for pods to become ready")
    } else {
        ServiceStatus::new(ServicePhase::Ready, "")
    }
}

/// Aggregate job health over the tree roots.
pub fn job_status_for_microservice(roots: &[ObjectNode], nodes: &[Node]) -> JobStatus {
    let jobs: Vec<&ObjectNode> = roots
        .iter()
        .filter(|r| matches!(r.object, KubeObject::Job(_)))
        .collect();
    if jobs.is_empty() {
        return JobStatus::new(JobPhase::Starting, "Waiting for job to be created");
    }

    let statuses: Vec<JobStatus> = jobs.iter().map(|root| root_job_status(root, nodes)).collect();
    for phase in [
        JobPhase::Starting,
        JobPhase::Failed,
        JobPhase::Running,
        JobPhase::Completed,
        JobPhase::Unknown,
    ] {
        if let Some(status) = statuses.iter().find(|s| s.phase == phase) {
            return status.clone();
        }
    }
    JobStatus::new(JobPhase::Unknown, "")
}

fn root_job_status(root: &ObjectNode, nodes: &[Node]) -> JobStatus {
    let KubeObject::Job(job) = &root.object else {
        return JobStatus::new(JobPhase::Unknown, "");
    };
    let Some(status) = &job.status else {
        return JobStatus::new(JobPhase::Starting, "Waiting for job status");
    };

    for condition in status.conditions.as_deref().unwrap_or_default() {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Failed" => {
                return JobStatus::new(
                    JobPhase::Failed,
                    condition.message.clone().unwrap_or_default(),
                )
            }
            "Complete" => return JobStatus::new(JobPhase::Completed, ""),
            _ => {}
        }
    }

    for pod in select_pods(std::slice::from_ref(root), false) {
        if let Some(message) = fatal_pod_state(pod, nodes) {
            return JobStatus::new(JobPhase::Failed, message);
        }
    }

    let active = status.active.unwrap_or(0);
    let succeeded = status.succeeded.unwrap_or(0);
    let failed = status.failed.unwrap_or(0);
    if active == 0 && succeeded == 0 && failed == 0 {
        JobStatus::new(JobPhase::Starting, "Waiting for pods to be created")
    } else {
        JobStatus::new(JobPhase::Running, "")
    }
}

/// Detect pod states the controller treats as non-self-recovering.
///
/// Returns a human message when the pod will not make progress without
/// intervention: image-pull failures, crash loops, container config errors,
/// and permanent unschedulability.
pub fn fatal_pod_state(pod: &Pod, nodes: &[Node]) -> Option<String> {
    let status = pod.status.as_ref()?;

    for condition in status.conditions.as_deref().unwrap_or_default() {
        if condition.type_ != "PodScheduled" || condition.status != "False" {
            continue;
        }
        if condition.reason.as_deref() != Some("Unschedulable") {
            continue;
        }
        let message = condition.message.clone().unwrap_or_default();
        if message.contains("taint") {
            let untolerated = untolerated_taints(pod, nodes);
            if !untolerated.is_empty() {
                return Some(format!(
                    "Cannot schedule Pod due to the following Node taint(s): {}.",
                    untolerated.join(", ")
                ));
            }
        }
        return Some(message);
    }

    for container in status.container_statuses.as_deref().unwrap_or_default() {
        let Some(waiting) = container.state.as_ref().and_then(|s| s.waiting.as_ref()) else {
            continue;
        };
        let reason = waiting.reason.as_deref().unwrap_or_default();
        match reason {
            "ImagePullBackOff" | "ErrImagePull" | "CreateContainerConfigError" => {
                return Some(
                    waiting
                        .message
                        .clone()
                        .unwrap_or_else(|| reason.to_string()),
                );
            }
            "CrashLoopBackOff" => {
                if let Some(terminated) = container
                    .last_state
                    .as_ref()
                    .and_then(|s| s.terminated.as_ref())
                {
                    return Some(format!(
                        "CrashLoopBackOff. Termination Reason: {}",
                        terminated.reason.clone().unwrap_or_default()
                    ));
                }
                return Some(
                    waiting
                        .message
                        .clone()
                        .unwrap_or_else(|| reason.to_string()),
                );
            }
            _ => {}
        }
    }

    None
}

/// Taints on any node that the pod does not tolerate, formatted for humans.
fn untolerated_taints(pod: &Pod, nodes: &[Node]) -> Vec<String> {
    let no_tolerations = Vec::new();
    let tolerations = pod
        .spec
        .as_ref()
        .and_then(|s| s.tolerations.as_ref())
        .unwrap_or(&no_tolerations);

    let mut untolerated = Vec::new();
    for node in nodes {
        for taint in node
            .spec
            .as_ref()
            .and_then(|s| s.taints.as_deref())
            .unwrap_or_default()
        {
            if !tolerations.iter().any(|t| tolerates(t, taint)) {
                untolerated.push(format_taint(taint));
            }
        }
    }
    untolerated.sort();
    untolerated.dedup();
    untolerated
}

// The standard Kubernetes toleration matcher: an empty effect matches all
// effects, an empty key with Exists matches all taints.
fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = toleration.effect.as_deref() {
        if !effect.is_empty() && effect != taint.effect {
            return false;
        }
    }
    let key = toleration.key.as_deref().unwrap_or_default();
    match toleration.operator.as_deref().unwrap_or("Equal") {
        "Exists" => key.is_empty() || key == taint.key,
        _ => {
            key == taint.key
                && toleration.value.as_deref().unwrap_or_default()
                    == taint.value.as_deref().unwrap_or_default()
        }
    }
}

fn format_taint(taint: &Taint) -> String {
    let mut formatted = taint.key.clone();
    if let Some(value) = taint.value.as_deref() {
        if !value.is_empty() {
            formatted.push('=');
            formatted.push_str(value);
        }
    }
    if !taint.effect.is_empty() {
        formatted.push(':');
        formatted.push_str(&taint.effect);
    }
    formatted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree;
    use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, ReplicaSetSpec, ReplicaSetStatus};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus,
        NodeSpec, PodCondition, PodSpec, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use std::collections::BTreeMap;

    fn owned_meta(name: &str, uid: &str, owner_kind: &str, owner_uid: &str) -> ObjectMeta {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            crate::crd::ANNOTATION_SPEC_VERSION.to_string(),
            "1".to_string(),
        );
        ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(uid.to_string()),
            annotations: Some(annotations),
            owner_references: Some(vec![OwnerReference {
                api_version: "v1".to_string(),
                kind: owner_kind.to_string(),
                name: "owner".to_string(),
                uid: owner_uid.to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..Default::default()
        }
    }

    fn running_pod(name: &str, uid: &str, owner_kind: &str, owner_uid: &str) -> KubeObject {
        KubeObject::Pod(Pod {
            metadata: owned_meta(name, uid, owner_kind, owner_uid),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// One Deployment -> one ReplicaSet with 3 desired, 3 created, 2 ready.
    fn not_ready_tree() -> Vec<ObjectNode> {
        let forest = tree::build(vec![
            KubeObject::Deployment(Deployment {
                metadata: owned_meta("web", "d1", "Microservice", "ms1"),
                ..Default::default()
            }),
            KubeObject::ReplicaSet(ReplicaSet {
                metadata: owned_meta("web-abc", "rs1", "Deployment", "d1"),
                spec: Some(ReplicaSetSpec {
                    replicas: Some(3),
                    ..Default::default()
                }),
                status: Some(ReplicaSetStatus {
                    replicas: 3,
                    ready_replicas: Some(2),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            running_pod("web-1", "p1", "ReplicaSet", "rs1"),
            running_pod("web-2", "p2", "ReplicaSet", "rs1"),
            running_pod("web-3", "p3", "ReplicaSet", "rs1"),
        ]);
        forest[&("ms1".to_string(), 1)].clone()
    }

    #[test]
    fn deployment_with_unready_replicas_is_not_ready() {
        let status = service_status_for_microservice(1, &not_ready_tree(), &[]);
        assert_eq!(status.phase, ServicePhase::NotReady);
    }

    #[test]
    fn missing_controllers_report_starting() {
        let status = service_status_for_microservice(2, &not_ready_tree(), &[]);
        assert_eq!(status.phase, ServicePhase::Starting);
    }

    #[test]
    fn specs_without_controllers_are_ready() {
        let status = service_status_for_microservice(0, &[], &[]);
        assert_eq!(status.phase, ServicePhase::Ready);
    }

    fn pod_with_waiting(reason: &str, with_termination: bool) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "app".to_string(),
                    state: Some(ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some(reason.to_string()),
                            message: Some(format!("{reason} happened")),
                        }),
                        ..Default::default()
                    }),
                    last_state: with_termination.then(|| ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            reason: Some("Error".to_string()),
                            exit_code: 1,
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn waiting_reasons_are_fatal() {
        for reason in ["ImagePullBackOff", "ErrImagePull", "CreateContainerConfigError"] {
            let message = fatal_pod_state(&pod_with_waiting(reason, false), &[]).unwrap();
            assert_eq!(message, format!("{reason} happened"));
        }
    }

    #[test]
    fn crash_loop_reports_the_termination_reason() {
        let message = fatal_pod_state(&pod_with_waiting("CrashLoopBackOff", true), &[]).unwrap();
        assert_eq!(message, "CrashLoopBackOff. Termination Reason: Error");

        let without = fatal_pod_state(&pod_with_waiting("CrashLoopBackOff", false), &[]).unwrap();
        assert_eq!(without, "CrashLoopBackOff happened");
    }

    #[test]
    fn healthy_pods_are_not_fatal() {
        let pod = Pod {
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "PodScheduled".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(fatal_pod_state(&pod, &[]), None);
    }

    #[test]
    fn untolerated_taints_are_named() {
        let pod = Pod {
            spec: Some(PodSpec {
                tolerations: Some(vec![Toleration {
                    key: Some("should-be-tolerated".to_string()),
                    operator: Some("Exists".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "PodScheduled".to_string(),
                    status: "False".to_string(),
                    reason: Some("Unschedulable".to_string()),
                    message: Some(
                        "0/1 nodes are available: 1 node(s) had taints that the pod didn't \
                         tolerate."
                            .to_string(),
                    ),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let node = Node {
            spec: Some(NodeSpec {
                taints: Some(vec![
                    Taint {
                        key: "memory-pressure".to_string(),
                        ..Default::default()
                    },
                    Taint {
                        key: "should-be-tolerated".to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let message = fatal_pod_state(&pod, &[node]).unwrap();
        assert_eq!(
            message,
            "Cannot schedule Pod due to the following Node taint(s): memory-pressure."
        );
    }

    fn job_tree(status: Option<k8s_openapi::api::batch::v1::JobStatus>) -> Vec<ObjectNode> {
        let forest = tree::build(vec![KubeObject::Job(k8s_openapi::api::batch::v1::Job {
            metadata: owned_meta("migrate", "j1", "Microservice", "ms1"),
            status,
            ..Default::default()
        })]);
        forest[&("ms1".to_string(), 1)].clone()
    }

    #[test]
    fn job_phases_follow_conditions_and_counters() {
        use k8s_openapi::api::batch::v1::{JobCondition, JobStatus as KubeJobStatus};

        let starting = job_status_for_microservice(&job_tree(None), &[]);
        assert_eq!(starting.phase, JobPhase::Starting);

        let running = job_status_for_microservice(
            &job_tree(Some(KubeJobStatus {
                active: Some(1),
                ..Default::default()
            })),
            &[],
        );
        assert_eq!(running.phase, JobPhase::Running);

        let completed = job_status_for_microservice(
            &job_tree(Some(KubeJobStatus {
                succeeded: Some(1),
                conditions: Some(vec![JobCondition {
                    type_: "Complete".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            })),
            &[],
        );
        assert_eq!(completed.phase, JobPhase::Completed);

        let failed = job_status_for_microservice(
            &job_tree(Some(KubeJobStatus {
                failed: Some(1),
                conditions: Some(vec![JobCondition {
                    type_: "Failed".to_string(),
                    status: "True".to_string(),
                    message: Some("backoff limit exceeded".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            })),
            &[],
        );
        assert_eq!(failed.phase, JobPhase::Failed);
        assert_eq!(failed.message, "backoff limit exceeded");
    }

    #[test]
    fn expected_controllers_counts_only_non_job_kinds() {
        let manifests = vec![
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: a\n".to_string(),
            "apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: b\n".to_string(),
            "apiVersion: v1\nkind: Secret\nmetadata:\n  name: c\n".to_string(),
            "apiVersion: apps/v1\nkind: DaemonSet\nmetadata:\n  name: d\n".to_string(),
        ];
        assert_eq!(expected_non_job_controllers(&manifests), 2);
    }
}
