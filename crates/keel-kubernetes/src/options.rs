use std::time::Duration;

use keel_common::config::AppConfig;

use crate::error::{BackendError, BackendResult};

/// The fraction of the initial executors that must have registered before
/// the application is considered ready, unless configured otherwise.
pub const DEFAULT_MIN_REGISTERED_RATIO: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct ExecutorBackendOptions {
    pub namespace: String,
    pub driver_pod_name: String,
    /// The URL that executors use to connect back to the driver scheduler.
    pub driver_url: String,
    pub image: String,
    pub image_pull_policy: String,
    /// The prefix of executor pod names, or [`None`] to generate
    /// an opaque prefix at startup.
    pub executor_pod_name_prefix: Option<String>,
    pub allocation_batch_size: usize,
    pub allocation_batch_delay: Duration,
    pub min_registered_ratio: f64,
    pub initial_executors: usize,
    pub dynamic_allocation_enabled: bool,
    pub executor_env: Vec<(String, String)>,
}

impl TryFrom<&AppConfig> for ExecutorBackendOptions {
    type Error = BackendError;

    fn try_from(config: &AppConfig) -> BackendResult<Self> {
        if config.kubernetes.namespace.is_empty() {
            return Err(BackendError::InvalidArgument(
                "the Kubernetes namespace must be configured".to_string(),
            ));
        }
        if config.kubernetes.driver_pod_name.is_empty() {
            return Err(BackendError::InvalidArgument(
                "the driver pod name must be configured".to_string(),
            ));
        }
        if config.kubernetes.allocation_batch_size == 0 {
            return Err(BackendError::InvalidArgument(
                "the allocation batch size must be positive".to_string(),
            ));
        }
        if config.kubernetes.allocation_batch_delay_secs == 0 {
            return Err(BackendError::InvalidArgument(
                "the allocation batch delay must be positive".to_string(),
            ));
        }
        let min_registered_ratio = config
            .cluster
            .min_registered_resources_ratio
            .unwrap_or(DEFAULT_MIN_REGISTERED_RATIO);
        if !(0.0..=1.0).contains(&min_registered_ratio) {
            return Err(BackendError::InvalidArgument(
                "the minimum registered resources ratio must be between 0 and 1".to_string(),
            ));
        }
        let initial_executors = if config.cluster.dynamic_allocation_enabled {
            config
                .cluster
                .dynamic_allocation_initial_executors
                .max(config.cluster.dynamic_allocation_min_executors)
                .max(config.cluster.executor_instances)
        } else {
            config.cluster.executor_instances
        };
        let driver_url = format!(
            "keel://{}:{}",
            config.cluster.driver_external_host, config.cluster.driver_external_port
        );
        Ok(Self {
            namespace: config.kubernetes.namespace.clone(),
            driver_pod_name: config.kubernetes.driver_pod_name.clone(),
            driver_url,
            image: config.kubernetes.image.clone(),
            image_pull_policy: config.kubernetes.image_pull_policy.clone(),
            executor_pod_name_prefix: config.kubernetes.executor_pod_name_prefix.clone(),
            allocation_batch_size: config.kubernetes.allocation_batch_size,
            allocation_batch_delay: Duration::from_secs(
                config.kubernetes.allocation_batch_delay_secs,
            ),
            min_registered_ratio,
            initial_executors,
            dynamic_allocation_enabled: config.cluster.dynamic_allocation_enabled,
            executor_env: config
                .kubernetes
                .executor_env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use keel_common::config::AppConfig;

    use super::*;
    use crate::error::BackendError;

    fn base_config() -> AppConfig {
        let mut config = AppConfig::load().expect("configuration should load");
        config.kubernetes.driver_pod_name = "keel-driver".to_string();
        config
    }

    #[test]
    fn test_options_from_default_config() {
        let config = base_config();
        let options = ExecutorBackendOptions::try_from(&config).unwrap();
        assert_eq!(options.namespace, "default");
        assert_eq!(options.driver_pod_name, "keel-driver");
        assert_eq!(options.allocation_batch_size, 5);
        assert_eq!(options.allocation_batch_delay, Duration::from_secs(1));
        assert_eq!(options.min_registered_ratio, DEFAULT_MIN_REGISTERED_RATIO);
        assert_eq!(options.initial_executors, 2);
        assert_eq!(options.driver_url, "keel://127.0.0.1:7077");
    }

    #[test]
    fn test_user_ratio_wins_over_default() {
        let mut config = base_config();
        config.cluster.min_registered_resources_ratio = Some(0.5);
        let options = ExecutorBackendOptions::try_from(&config).unwrap();
        assert_eq!(options.min_registered_ratio, 0.5);
    }

    #[test]
    fn test_initial_executors_with_dynamic_allocation() {
        let mut config = base_config();
        config.cluster.dynamic_allocation_enabled = true;
        config.cluster.dynamic_allocation_min_executors = 3;
        config.cluster.dynamic_allocation_initial_executors = 1;
        config.cluster.executor_instances = 0;
        let options = ExecutorBackendOptions::try_from(&config).unwrap();
        assert_eq!(options.initial_executors, 3);
        assert!(options.dynamic_allocation_enabled);
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let mut config = base_config();
        config.kubernetes.driver_pod_name = String::new();
        assert!(matches!(
            ExecutorBackendOptions::try_from(&config),
            Err(BackendError::InvalidArgument(_))
        ));

        let mut config = base_config();
        config.kubernetes.allocation_batch_size = 0;
        assert!(matches!(
            ExecutorBackendOptions::try_from(&config),
            Err(BackendError::InvalidArgument(_))
        ));

        let mut config = base_config();
        config.kubernetes.allocation_batch_delay_secs = 0;
        assert!(matches!(
            ExecutorBackendOptions::try_from(&config),
            Err(BackendError::InvalidArgument(_))
        ));

        let mut config = base_config();
        config.cluster.min_registered_resources_ratio = Some(1.5);
        assert!(matches!(
            ExecutorBackendOptions::try_from(&config),
            Err(BackendError::InvalidArgument(_))
        ));
    }
}
