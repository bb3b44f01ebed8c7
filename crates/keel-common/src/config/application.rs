use std::collections::BTreeMap;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::config::loader::{deserialize_non_empty_string, deserialize_non_zero};
use crate::error::{CommonError, CommonResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub cluster: ClusterConfig,
    pub kubernetes: KubernetesConfig,
}

impl AppConfig {
    pub fn load() -> CommonResult<Self> {
        Figment::from(Toml::string(DEFAULT_CONFIG))
            .merge(Env::prefixed("KEEL_").map(|p| p.as_str().replace("__", ".").into()))
            .extract()
            .map_err(|e| CommonError::InvalidArgument(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// The host that executors use to reach the driver.
    pub driver_external_host: String,
    /// The port that executors use to reach the driver.
    pub driver_external_port: u16,
    /// The number of executors to request when dynamic allocation is disabled.
    pub executor_instances: usize,
    pub dynamic_allocation_enabled: bool,
    pub dynamic_allocation_min_executors: usize,
    pub dynamic_allocation_max_executors: usize,
    pub dynamic_allocation_initial_executors: usize,
    /// The fraction of the initial executors that must have registered
    /// before the application is considered ready, or zero if not set.
    #[serde(deserialize_with = "deserialize_non_zero")]
    pub min_registered_resources_ratio: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// The namespace that all executor pods are created in.
    pub namespace: String,
    /// The name of the pod that runs the driver.
    /// This is used to set owner references for executor pods.
    pub driver_pod_name: String,
    pub image: String,
    pub image_pull_policy: String,
    /// The prefix of the name of executor pods,
    /// or empty to generate an opaque prefix at startup.
    #[serde(deserialize_with = "deserialize_non_empty_string")]
    pub executor_pod_name_prefix: Option<String>,
    /// The maximum number of executor pods created in one allocation round.
    pub allocation_batch_size: usize,
    /// The delay between executor allocation rounds.
    pub allocation_batch_delay_secs: u64,
    /// Additional environment variables for executor containers.
    pub executor_env: BTreeMap<String, String>,
}
