use std::time::Duration;

use crate::error::{ControlError, Result};

#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Namespace of the managed InferenceService.
    pub namespace: String,
    /// Name of the single managed InferenceService.
    pub deployment_name: String,

    pub catalog_root: String,
    /// Subdirectory of `catalog_root` holding one JSON file per model.
    pub catalog_models_dir: String,
    pub catalog_ttl: Duration,

    /// Mount point of the weights volume inside the inference pod.
    pub inference_model_root: String,
    /// PVC backing the weights volume; enables `pvc://` results for installs.
    pub weights_pvc_name: Option<String>,
    /// Local mount of the weights volume in this process.
    pub weights_storage_path: String,

    pub install_timeout: Duration,
    /// Applied when a request does not specify one. 0 means unlimited.
    pub default_max_attempts: u32,
    /// Concurrent inline installs.
    pub install_concurrency: usize,

    pub subscriber_buffer: usize,
    /// Number of recent jobs replayed to a new subscriber.
    pub replay_window: usize,

    pub hf_token: Option<String>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            namespace: "ai".to_string(),
            deployment_name: "active-llm".to_string(),
            catalog_root: "/workspace/catalog".to_string(),
            catalog_models_dir: "models".to_string(),
            catalog_ttl: Duration::from_secs(30),
            inference_model_root: "/mnt/models".to_string(),
            weights_pvc_name: None,
            weights_storage_path: "/mnt/models".to_string(),
            install_timeout: Duration::from_secs(6 * 60 * 60),
            default_max_attempts: 3,
            install_concurrency: 2,
            subscriber_buffer: 16,
            replay_window: 5,
            hf_token: None,
        }
    }
}

/// An optional subsystem, decided once at startup.
#[derive(Debug, Clone)]
pub enum Capability<T> {
    Enabled(T),
    Disabled { reason: &'static str },
}

impl<T> Capability<T> {
    pub fn disabled(reason: &'static str) -> Self {
        Capability::Disabled { reason }
    }

    pub fn from_option(value: Option<T>, reason: &'static str) -> Self {
        match value {
            Some(v) => Capability::Enabled(v),
            None => Capability::Disabled { reason },
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Capability::Enabled(_))
    }

    pub fn get(&self) -> Option<&T> {
        match self {
            Capability::Enabled(v) => Some(v),
            Capability::Disabled { .. } => None,
        }
    }

    /// Borrow the subsystem or fail with `FeatureDisabled`.
    pub fn require(&self) -> Result<&T> {
        match self {
            Capability::Enabled(v) => Ok(v),
            Capability::Disabled { reason } => Err(ControlError::FeatureDisabled(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_require() {
        let on: Capability<u8> = Capability::from_option(Some(1), "unused");
        assert_eq!(*on.require().unwrap(), 1);

        let off: Capability<u8> = Capability::from_option(None, "weight storage not configured");
        assert!(!off.is_enabled());
        let err = off.require().unwrap_err();
        assert_eq!(err.to_string(), "feature disabled: weight storage not configured");
    }
}
