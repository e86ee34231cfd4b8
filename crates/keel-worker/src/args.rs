use std::time::Duration;

use clap::Parser;
use keel_control::ControlConfig;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    #[arg(long, env = "ETCD_ENDPOINT", default_value = "http://127.0.0.1:2379")]
    pub etcd_endpoint: String,

    /// Defaults to a random id per process.
    #[arg(long, env = "KEEL_WORKER_ID")]
    pub worker_id: Option<String>,

    #[arg(long, env = "WEIGHTS_STORAGE_PATH", default_value = "/mnt/models")]
    pub weights_storage_path: String,

    #[arg(long, env = "WEIGHTS_PVC_NAME")]
    pub weights_pvc_name: Option<String>,

    #[arg(long, env = "INFERENCE_MODEL_ROOT", default_value = "/mnt/models")]
    pub inference_model_root: String,

    #[arg(long, env = "WEIGHT_INSTALL_TIMEOUT_SECS", default_value_t = 6 * 60 * 60)]
    pub install_timeout_secs: u64,

    #[arg(long, env = "WEIGHT_INSTALL_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    /// Fallback poll interval when the queue watch is quiet or unavailable.
    #[arg(long, env = "KEEL_WORKER_POLL_SECS", default_value_t = 10)]
    pub poll_secs: u64,

    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,

    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "OTEL_EXPORTER_OTLP_TOKEN", hide_env_values = true)]
    pub otlp_token: Option<String>,
}

impl Args {
    pub fn control_config(&self) -> ControlConfig {
        ControlConfig {
            inference_model_root: self.inference_model_root.clone(),
            weights_pvc_name: self.weights_pvc_name.clone().filter(|s| !s.is_empty()),
            weights_storage_path: self.weights_storage_path.clone(),
            install_timeout: Duration::from_secs(self.install_timeout_secs),
            default_max_attempts: self.max_attempts,
            // one claimed message at a time
            install_concurrency: 1,
            hf_token: self.hf_token.clone().filter(|s| !s.is_empty()),
            ..ControlConfig::default()
        }
    }
}
