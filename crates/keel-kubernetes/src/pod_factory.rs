use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, EnvVarSource, NodeAffinity, NodeSelectorRequirement,
    NodeSelectorTerm, ObjectFieldSelector, Pod, PodSpec, PreferredSchedulingTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::Resource;
use rand::distr::Uniform;
use rand::Rng;

use crate::error::{BackendError, BackendResult};
use crate::id::ExecutorId;
use crate::options::ExecutorBackendOptions;

/// The label carrying the application id on every executor pod.
/// The backend watches pods by this label.
pub const APP_ID_LABEL: &str = "keel.dev/app-id";
/// The label carrying the executor id on every executor pod.
pub const EXECUTOR_ID_LABEL: &str = "keel.dev/executor-id";

const EXECUTOR_ID_ENV: &str = "KEEL_EXECUTOR_ID";
const APPLICATION_ID_ENV: &str = "KEEL_APPLICATION_ID";
const DRIVER_URL_ENV: &str = "KEEL_DRIVER_URL";
const EXECUTOR_POD_IP_ENV: &str = "KEEL_EXECUTOR_POD_IP";

/// Produces a ready-to-submit executor pod spec.
/// Implementations must be pure and must not touch the cluster.
pub trait ExecutorPodFactory: Send + Sync + 'static {
    fn create(
        &self,
        executor_id: ExecutorId,
        app_id: &str,
        driver_url: &str,
        env_overrides: &[(String, String)],
        owner_pod: &Pod,
        node_locality: &HashMap<String, usize>,
    ) -> Pod;
}

/// The default [`ExecutorPodFactory`].
pub struct ExecutorPodBuilder {
    /// An opaque name that makes executor pod names unique across
    /// driver instances sharing a namespace.
    instance: String,
    image: String,
    image_pull_policy: String,
}

impl ExecutorPodBuilder {
    pub fn new(options: &ExecutorBackendOptions) -> BackendResult<Self> {
        if options.image.is_empty() {
            return Err(BackendError::InvalidArgument(
                "the executor image must be configured".to_string(),
            ));
        }
        let instance = options
            .executor_pod_name_prefix
            .clone()
            .unwrap_or_else(Self::generate_name);
        Ok(Self {
            instance,
            image: options.image.clone(),
            image_pull_policy: options.image_pull_policy.clone(),
        })
    }

    pub fn generate_name() -> String {
        rand::rng()
            .sample_iter(Uniform::new(0, 36).unwrap())
            .take(10)
            .map(|i| if i < 10 { b'0' + i } else { b'a' + i - 10 })
            .map(char::from)
            .collect()
    }

    fn build_pod_labels(&self, executor_id: ExecutorId, app_id: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app.kubernetes.io/name".to_string(), "keel".to_string()),
            (
                "app.kubernetes.io/component".to_string(),
                "executor".to_string(),
            ),
            (APP_ID_LABEL.to_string(), app_id.to_string()),
            (EXECUTOR_ID_LABEL.to_string(), executor_id.to_string()),
        ])
    }

    fn build_pod_env(
        &self,
        executor_id: ExecutorId,
        app_id: &str,
        driver_url: &str,
        env_overrides: &[(String, String)],
    ) -> Vec<EnvVar> {
        let mut env = vec![
            EnvVar {
                name: EXECUTOR_ID_ENV.to_string(),
                value: Some(executor_id.to_string()),
                value_from: None,
            },
            EnvVar {
                name: APPLICATION_ID_ENV.to_string(),
                value: Some(app_id.to_string()),
                value_from: None,
            },
            EnvVar {
                name: DRIVER_URL_ENV.to_string(),
                value: Some(driver_url.to_string()),
                value_from: None,
            },
            EnvVar {
                name: EXECUTOR_POD_IP_ENV.to_string(),
                value: None,
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "status.podIP".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            },
        ];
        env.extend(env_overrides.iter().map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            value_from: None,
        }));
        env
    }

    fn build_owner_references(&self, owner_pod: &Pod) -> Vec<OwnerReference> {
        vec![OwnerReference {
            api_version: Pod::API_VERSION.to_string(),
            kind: Pod::KIND.to_string(),
            name: owner_pod.metadata.name.clone().unwrap_or_default(),
            uid: owner_pod.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            ..Default::default()
        }]
    }

    /// Build a node affinity that prefers the nodes with the most pending
    /// tasks. This is a preference; the cluster scheduler is free to place
    /// the pod elsewhere.
    fn build_node_affinity(&self, node_locality: &HashMap<String, usize>) -> Option<Affinity> {
        if node_locality.is_empty() {
            return None;
        }
        let mut nodes = node_locality.iter().collect::<Vec<_>>();
        nodes.sort();
        let terms = nodes
            .into_iter()
            .map(|(node, &count)| PreferredSchedulingTerm {
                weight: count.clamp(1, 100) as i32,
                preference: NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: "kubernetes.io/hostname".to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![node.clone()]),
                    }]),
                    ..Default::default()
                },
            })
            .collect();
        Some(Affinity {
            node_affinity: Some(NodeAffinity {
                preferred_during_scheduling_ignored_during_execution: Some(terms),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

impl ExecutorPodFactory for ExecutorPodBuilder {
    fn create(
        &self,
        executor_id: ExecutorId,
        app_id: &str,
        driver_url: &str,
        env_overrides: &[(String, String)],
        owner_pod: &Pod,
        node_locality: &HashMap<String, usize>,
    ) -> Pod {
        let name = format!("{}-exec-{}", self.instance, executor_id);
        Pod {
            metadata: ObjectMeta {
                name: Some(name),
                labels: Some(self.build_pod_labels(executor_id, app_id)),
                owner_references: Some(self.build_owner_references(owner_pod)),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "executor".to_string(),
                    command: Some(vec!["keel".to_string()]),
                    args: Some(vec!["executor".to_string()]),
                    env: Some(self.build_pod_env(
                        executor_id,
                        app_id,
                        driver_url,
                        env_overrides,
                    )),
                    image: Some(self.image.clone()),
                    image_pull_policy: Some(self.image_pull_policy.clone()),
                    ..Default::default()
                }],
                affinity: self.build_node_affinity(node_locality),
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            status: None,
        }
    }
}
