use std::time::Duration;

use clap::Parser;
use keel_control::ControlConfig;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    #[arg(long, env = "KEEL_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// State is kept in memory when unset.
    #[arg(long, env = "ETCD_ENDPOINT")]
    pub etcd_endpoint: Option<String>,

    #[arg(long, env = "KEEL_NAMESPACE", default_value = "ai")]
    pub namespace: String,

    #[arg(long, env = "KEEL_DEPLOYMENT_NAME", default_value = "active-llm")]
    pub deployment_name: String,

    /// Manage an in-process stand-in instead of a cluster InferenceService.
    #[arg(long, env = "KEEL_IN_MEMORY_CLUSTER", default_value_t = false)]
    pub in_memory_cluster: bool,

    #[arg(long, env = "CATALOG_ROOT", default_value = "/workspace/catalog")]
    pub catalog_root: String,

    #[arg(long, env = "CATALOG_MODELS_DIR", default_value = "models")]
    pub catalog_models_dir: String,

    #[arg(long, env = "CATALOG_TTL_SECS", default_value_t = 30)]
    pub catalog_ttl_secs: u64,

    #[arg(long, env = "INFERENCE_MODEL_ROOT", default_value = "/mnt/models")]
    pub inference_model_root: String,

    #[arg(long, env = "WEIGHTS_PVC_NAME")]
    pub weights_pvc_name: Option<String>,

    /// Local mount of the weights volume. Weight installs are disabled when unset.
    #[arg(long, env = "WEIGHTS_STORAGE_PATH")]
    pub weights_storage_path: Option<String>,

    #[arg(long, env = "WEIGHT_INSTALL_TIMEOUT_SECS", default_value_t = 6 * 60 * 60)]
    pub install_timeout_secs: u64,

    /// 0 means unlimited retries.
    #[arg(long, env = "WEIGHT_INSTALL_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    #[arg(long, env = "WEIGHT_INSTALL_CONCURRENCY", default_value_t = 2)]
    pub install_concurrency: usize,

    /// Hand installs to queue workers instead of running them here. Needs etcd.
    #[arg(long, env = "KEEL_USE_QUEUE", default_value_t = false)]
    pub use_queue: bool,

    #[arg(long, env = "KEEL_SUBSCRIBER_BUFFER", default_value_t = 16)]
    pub subscriber_buffer: usize,

    #[arg(long, env = "KEEL_REPLAY_WINDOW", default_value_t = 5)]
    pub replay_window: usize,

    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,

    /// OTLP/HTTP endpoint for exporting traces.
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Bearer token for the OTLP endpoint.
    #[arg(long, env = "OTEL_EXPORTER_OTLP_TOKEN", hide_env_values = true)]
    pub otlp_token: Option<String>,
}

impl Args {
    pub fn control_config(&self) -> ControlConfig {
        let defaults = ControlConfig::default();
        ControlConfig {
            namespace: self.namespace.clone(),
            deployment_name: self.deployment_name.clone(),
            catalog_root: self.catalog_root.clone(),
            catalog_models_dir: self.catalog_models_dir.clone(),
            catalog_ttl: Duration::from_secs(self.catalog_ttl_secs),
            inference_model_root: self.inference_model_root.clone(),
            weights_pvc_name: self.weights_pvc_name.clone().filter(|s| !s.is_empty()),
            weights_storage_path: self
                .weights_storage_path
                .clone()
                .unwrap_or(defaults.weights_storage_path),
            install_timeout: Duration::from_secs(self.install_timeout_secs),
            default_max_attempts: self.max_attempts,
            install_concurrency: self.install_concurrency,
            subscriber_buffer: self.subscriber_buffer,
            replay_window: self.replay_window,
            hf_token: self.hf_token.clone().filter(|s| !s.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_control_config() {
        let args = Args::parse_from(["keel-server"]);
        let cfg = args.control_config();
        let defaults = ControlConfig::default();
        assert_eq!(cfg.namespace, defaults.namespace);
        assert_eq!(cfg.deployment_name, defaults.deployment_name);
        assert_eq!(cfg.catalog_ttl, defaults.catalog_ttl);
        assert_eq!(cfg.install_timeout, defaults.install_timeout);
        assert_eq!(cfg.default_max_attempts, 3);
        assert_eq!(cfg.replay_window, 5);
        assert!(args.weights_storage_path.is_none());
    }

    #[test]
    fn test_blank_optional_values_are_dropped() {
        let args = Args::parse_from(["keel-server", "--weights-pvc-name", "", "--hf-token", ""]);
        let cfg = args.control_config();
        assert!(cfg.weights_pvc_name.is_none());
        assert!(cfg.hf_token.is_none());
    }
}
