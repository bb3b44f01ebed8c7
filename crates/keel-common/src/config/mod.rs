mod application;
mod loader;

pub use application::{AppConfig, ClusterConfig, KubernetesConfig};
