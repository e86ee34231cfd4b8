//! Typed KServe `InferenceService` document rendered from a catalog model.

use std::collections::BTreeMap;
use std::path::Path;

use keel_common::{EnvVar, Model, Resources, Storage, Toleration, Volume, VolumeMount};
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "serving.kserve.io";
pub const VERSION: &str = "v1beta1";
pub const API_VERSION: &str = "serving.kserve.io/v1beta1";
pub const KIND: &str = "InferenceService";
pub const PLURAL: &str = "inferenceservices";

pub const MODEL_ID_ANNOTATION: &str = "keel/model-id";
pub const SECRET_NAME_ANNOTATION: &str = "serving.kserve.io/secretName";
pub const READONLY_ANNOTATION: &str = "storage.kserve.io/readonly";
pub const HF_TOKEN_SECRET: &str = "hf-token";
pub const DEFAULT_RUNTIME: &str = "vllm-runtime";
pub const MODEL_ID_ENV: &str = "MODEL_ID";

const PVC_SCHEME: &str = "pvc://";
const SERVED_NAME_FLAG: &str = "--served-model-name";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferenceService {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: InferenceServiceSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferenceServiceSpec {
    pub predictor: Predictor,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Predictor {
    pub min_replicas: u32,
    pub model: ModelSpec,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub model_format: ModelFormat,
    pub runtime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Storage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelFormat {
    pub name: String,
}

impl InferenceService {
    pub fn model_id(&self) -> Option<&str> {
        self.metadata.annotations.get(MODEL_ID_ANNOTATION).map(String::as_str)
    }

    pub fn with_resource_version(mut self, version: Option<String>) -> Self {
        self.metadata.resource_version = version;
        self
    }

    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// Renders the single managed `InferenceService` for a model.
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    namespace: String,
    name: String,
    /// Where the weights volume is mounted inside the predictor.
    model_root: Option<String>,
}

impl ManifestBuilder {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            model_root: None,
        }
    }

    pub fn with_model_root(mut self, root: impl Into<String>) -> Self {
        self.model_root = Some(root.into()).filter(|r: &String| !r.is_empty());
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn build(&self, model: &Model) -> InferenceService {
        let storage_uri = model.storage_uri.clone().filter(|s| !s.is_empty()).or_else(|| {
            model
                .hf_model_id
                .as_deref()
                .filter(|id| !id.is_empty())
                .map(|id| format!("hf://{id}"))
        });
        let pvc_storage = storage_uri.as_deref().is_some_and(|u| u.starts_with(PVC_SCHEME));

        let model_spec = ModelSpec {
            model_format: ModelFormat {
                name: "custom".to_string(),
            },
            runtime: model
                .runtime
                .clone()
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| DEFAULT_RUNTIME.to_string()),
            storage_uri,
            env: prepare_env(
                &model.env,
                model.storage_uri.as_deref().unwrap_or_default(),
                self.model_root.as_deref(),
            ),
            storage: model.storage.clone(),
            args: vllm_args(model),
            resources: model.resources.clone(),
            volume_mounts: model.volume_mounts.clone(),
        };

        let mut annotations = BTreeMap::new();
        annotations.insert(SECRET_NAME_ANNOTATION.to_string(), HF_TOKEN_SECRET.to_string());
        annotations.insert(MODEL_ID_ANNOTATION.to_string(), model.id.clone());
        if pvc_storage {
            annotations.insert(READONLY_ANNOTATION.to_string(), "false".to_string());
        }

        InferenceService {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ObjectMeta {
                name: self.name.clone(),
                namespace: self.namespace.clone(),
                annotations,
                resource_version: None,
            },
            spec: InferenceServiceSpec {
                predictor: Predictor {
                    min_replicas: 1,
                    model: model_spec,
                    node_selector: model.node_selector.clone(),
                    tolerations: model.tolerations.clone(),
                    resources: model.resources.clone(),
                    volumes: model.volumes.clone(),
                },
            },
        }
    }
}

/// Server flags derived from the model's vLLM block.
pub fn vllm_args(model: &Model) -> Vec<String> {
    let Some(vllm) = &model.vllm else {
        return Vec::new();
    };
    let mut args = Vec::new();
    if let Some(tp) = vllm.tensor_parallel_size {
        args.extend(["--tensor-parallel-size".to_string(), tp.to_string()]);
    }
    if let Some(dtype) = vllm.dtype.as_deref().filter(|d| !d.is_empty()) {
        args.extend(["--dtype".to_string(), dtype.to_string()]);
    }
    if let Some(util) = vllm.gpu_memory_utilization {
        args.extend(["--gpu-memory-utilization".to_string(), format!("{util:.6}")]);
    }
    if let Some(len) = vllm.max_model_len {
        args.extend(["--max-model-len".to_string(), len.to_string()]);
    }
    if vllm.trust_remote_code == Some(true) {
        args.push("--trust-remote-code".to_string());
    }

    let served = model
        .served_model_name
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .or(model.hf_model_id.as_deref().filter(|s| !s.trim().is_empty()));
    if let Some(name) = served {
        args.extend([SERVED_NAME_FLAG.to_string(), name.trim().to_string()]);
    }

    // the served name above is authoritative
    args.extend(
        vllm.extra_args
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty() && !a.starts_with(SERVED_NAME_FLAG))
            .map(str::to_string),
    );
    args
}

/// Path inside the predictor where `pvc://claim/sub` storage is mounted.
pub fn local_model_path(storage_uri: &str, model_root: Option<&str>) -> Option<String> {
    let root = model_root?;
    let rest = storage_uri.strip_prefix(PVC_SCHEME)?;
    let sub = rest.split_once('/').map(|(_, sub)| sub.trim_matches('/')).unwrap_or("");
    if sub.is_empty() {
        return Some(root.to_string());
    }
    Some(Path::new(root).join(sub).to_string_lossy().into_owned())
}

/// Point `MODEL_ID` at the mounted weights for volume-backed models. An
/// absolute value set in the catalog is left alone.
pub fn prepare_env(env: &[EnvVar], storage_uri: &str, model_root: Option<&str>) -> Vec<EnvVar> {
    let mut env = env.to_vec();
    let Some(local) = local_model_path(storage_uri, model_root) else {
        return env;
    };
    match env.iter_mut().find(|e| e.name == MODEL_ID_ENV) {
        Some(var) if var.value.as_deref().is_some_and(|v| v.starts_with('/')) => {}
        Some(var) => {
            var.value = Some(local);
            var.value_from = None;
        }
        None => env.push(EnvVar::literal(MODEL_ID_ENV, local)),
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_common::{EnvVarSource, KeySelector, VllmConfig};

    fn builder() -> ManifestBuilder {
        ManifestBuilder::new("ai", "active-llm").with_model_root("/mnt/models")
    }

    #[test]
    fn test_vllm_args_order_and_extra_filtering() {
        let model = Model {
            id: "m".into(),
            hf_model_id: Some("Repo/Model".into()),
            served_model_name: Some("Repo/Model".into()),
            vllm: Some(VllmConfig {
                tensor_parallel_size: Some(2),
                dtype: Some("bfloat16".into()),
                gpu_memory_utilization: Some(0.5),
                max_model_len: Some(2048),
                trust_remote_code: Some(true),
                extra_args: vec![
                    "--speculative-decoding".into(),
                    "eagle".into(),
                    "".into(),
                    " --served-model-name bad".into(),
                    "--custom-flag=1".into(),
                ],
            }),
            ..Default::default()
        };
        assert_eq!(
            vllm_args(&model),
            vec![
                "--tensor-parallel-size", "2",
                "--dtype", "bfloat16",
                "--gpu-memory-utilization", "0.500000",
                "--max-model-len", "2048",
                "--trust-remote-code",
                "--served-model-name", "Repo/Model",
                "--speculative-decoding",
                "eagle",
                "--custom-flag=1",
            ]
        );
    }

    #[test]
    fn test_served_name_falls_back_to_hf_id() {
        let model = Model {
            id: "m".into(),
            hf_model_id: Some("Fallback/Model".into()),
            vllm: Some(VllmConfig::default()),
            ..Default::default()
        };
        assert_eq!(vllm_args(&model), vec!["--served-model-name", "Fallback/Model"]);
        assert!(vllm_args(&Model { vllm: None, ..model }).is_empty());
    }

    #[test]
    fn test_local_model_path() {
        assert_eq!(local_model_path("pvc://weights/org/m/", Some("/mnt/models")).as_deref(), Some("/mnt/models/org/m"));
        assert_eq!(local_model_path("pvc://weights", Some("/mnt/models")).as_deref(), Some("/mnt/models"));
        assert_eq!(local_model_path("hf://org/m", Some("/mnt/models")), None);
        assert_eq!(local_model_path("pvc://weights/x", None), None);
    }

    #[test]
    fn test_model_id_env_rewrite() {
        let secret = EnvVar {
            name: MODEL_ID_ENV.into(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(KeySelector { name: "s".into(), key: "k".into(), optional: None }),
                config_map_key_ref: None,
            }),
        };
        let env = prepare_env(&[secret], "pvc://weights/org/m", Some("/mnt/models"));
        assert_eq!(env, vec![EnvVar::literal(MODEL_ID_ENV, "/mnt/models/org/m")]);

        let absolute = vec![EnvVar::literal(MODEL_ID_ENV, "/data/custom")];
        assert_eq!(prepare_env(&absolute, "pvc://weights/org/m", Some("/mnt/models")), absolute);

        let env = prepare_env(&[EnvVar::literal("A", "1")], "pvc://weights/org/m", Some("/mnt/models"));
        assert_eq!(env.len(), 2);
        assert_eq!(env[1].name, MODEL_ID_ENV);

        let untouched = vec![EnvVar::literal(MODEL_ID_ENV, "org/m")];
        assert_eq!(prepare_env(&untouched, "hf://org/m", Some("/mnt/models")), untouched);
    }

    #[test]
    fn test_build_hf_model_defaults() {
        let model = Model {
            id: "qwen".into(),
            hf_model_id: Some("Qwen/Qwen2.5-7B".into()),
            ..Default::default()
        };
        let isvc = builder().build(&model);
        let value = isvc.to_value().unwrap();

        assert_eq!(value["apiVersion"], API_VERSION);
        assert_eq!(value["kind"], KIND);
        assert_eq!(value["metadata"]["name"], "active-llm");
        assert_eq!(value["metadata"]["annotations"][MODEL_ID_ANNOTATION], "qwen");
        assert_eq!(value["metadata"]["annotations"][SECRET_NAME_ANNOTATION], HF_TOKEN_SECRET);
        assert!(value["metadata"]["annotations"].get(READONLY_ANNOTATION).is_none());
        assert_eq!(value["spec"]["predictor"]["minReplicas"], 1);
        let model_spec = &value["spec"]["predictor"]["model"];
        assert_eq!(model_spec["modelFormat"]["name"], "custom");
        assert_eq!(model_spec["runtime"], DEFAULT_RUNTIME);
        assert_eq!(model_spec["storageUri"], "hf://Qwen/Qwen2.5-7B");
        assert!(model_spec.get("env").is_none());
        assert_eq!(isvc.model_id(), Some("qwen"));
    }

    #[test]
    fn test_build_pvc_model_is_writable_and_rewrites_env() {
        let model = Model {
            id: "local".into(),
            storage_uri: Some("pvc://weights/org/m".into()),
            runtime: Some("custom-runtime".into()),
            resources: Some(Resources {
                limits: [("nvidia.com/gpu".to_string(), "1".to_string())].into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let value = builder().build(&model).to_value().unwrap();
        assert_eq!(value["metadata"]["annotations"][READONLY_ANNOTATION], "false");
        let predictor = &value["spec"]["predictor"];
        assert_eq!(predictor["model"]["runtime"], "custom-runtime");
        assert_eq!(predictor["model"]["env"][0]["value"], "/mnt/models/org/m");
        assert_eq!(predictor["resources"]["limits"]["nvidia.com/gpu"], "1");
        assert_eq!(predictor["model"]["resources"], predictor["resources"]);
    }
}
