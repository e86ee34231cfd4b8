//! Pre-flight checks for candidate catalog entries.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_common::Model;
use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<CheckResult>,
    pub generated_at: DateTime<Utc>,
}

#[async_trait]
pub trait Validator: Send + Sync {
    /// `raw` is the payload as submitted; `model` its parsed form.
    async fn validate(&self, raw: &serde_json::Value, model: &Model) -> ValidationReport;
}

/// Checks that need no cluster access: identity, storage source, the
/// weights cache and vLLM parameter ranges.
#[derive(Debug, Clone, Default)]
pub struct StructuralValidator {
    weights_pvc: Option<String>,
    model_root: Option<String>,
}

fn id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").ok())
        .as_ref()
}

/// `pvc://claim/sub` into `(claim, sub)`; `sub` may be empty.
fn parse_pvc(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix("pvc://")?;
    let (claim, sub) = rest.split_once('/').unwrap_or((rest, ""));
    if claim.is_empty() {
        return None;
    }
    Some((claim, sub.trim_matches('/')))
}

impl StructuralValidator {
    pub fn new(weights_pvc: Option<String>, model_root: Option<String>) -> Self {
        Self {
            weights_pvc: weights_pvc.filter(|s| !s.is_empty()),
            model_root: model_root.filter(|s| !s.is_empty()),
        }
    }

    fn identity_errors(model: &Model, errors: &mut Vec<String>) {
        if model.id.trim().is_empty() {
            errors.push("id is required".to_string());
        } else if id_pattern().is_some_and(|re| !re.is_match(&model.id)) {
            errors.push(format!(
                "id {:?} may only contain letters, digits, '.', '_' and '-'",
                model.id
            ));
        }
        let has_source = model.storage_uri.as_deref().is_some_and(|s| !s.is_empty())
            || model.hf_model_id.as_deref().is_some_and(|s| !s.is_empty());
        if !has_source {
            errors.push("either storageUri or hfModelId is required".to_string());
        }
        if model.runtime.as_deref().is_some_and(|r| r.trim().is_empty()) {
            errors.push("runtime must not be blank".to_string());
        }
    }

    fn vllm_check(model: &Model) -> CheckResult {
        let Some(vllm) = &model.vllm else {
            return CheckResult::new("vllm", CheckStatus::Pass, "no vLLM overrides");
        };
        let mut problems = Vec::new();
        if vllm.tensor_parallel_size == Some(0) {
            problems.push("tensorParallelSize must be at least 1".to_string());
        }
        if let Some(util) = vllm.gpu_memory_utilization {
            if !(util > 0.0 && util <= 1.0) {
                problems.push(format!("gpuMemoryUtilization {util} must be in (0, 1]"));
            }
        }
        if vllm.max_model_len == Some(0) {
            problems.push("maxModelLen must be positive".to_string());
        }
        if problems.is_empty() {
            CheckResult::new("vllm", CheckStatus::Pass, "vLLM parameters in range")
        } else {
            CheckResult::new("vllm", CheckStatus::Fail, problems.join("; "))
        }
    }

    fn storage_check(&self, model: &Model) -> CheckResult {
        let Some(uri) = model.storage_uri.as_deref().filter(|s| !s.is_empty()) else {
            return CheckResult::new("storage", CheckStatus::Warn, "model has no storageUri configured");
        };
        let Some((claim, _)) = parse_pvc(uri) else {
            return CheckResult::new("storage", CheckStatus::Pass, "storageUri does not reference a PVC");
        };
        match self.weights_pvc.as_deref() {
            Some(configured) if configured != claim => CheckResult::new(
                "storage",
                CheckStatus::Warn,
                format!("PVC {claim} differs from configured cache {configured}"),
            )
            .with("pvc", claim),
            _ => CheckResult::new("storage", CheckStatus::Pass, format!("storageUri references PVC {claim}"))
                .with("pvc", claim),
        }
    }

    fn local_cache_check(&self, model: &Model) -> CheckResult {
        let Some(root) = self.model_root.as_deref() else {
            return CheckResult::new("local-cache", CheckStatus::Warn, "inference model root not configured");
        };
        let pvc = model.storage_uri.as_deref().and_then(parse_pvc);
        let Some((claim, sub)) = pvc.filter(|(_, sub)| !sub.is_empty()) else {
            return CheckResult::new("local-cache", CheckStatus::Warn, "storageUri does not provide a PVC subpath");
        };
        let local = Path::new(root).join(sub);
        let shown = local.display().to_string();
        match std::fs::metadata(&local) {
            Ok(meta) if meta.is_dir() => {
                CheckResult::new("local-cache", CheckStatus::Pass, format!("cached weights located at {shown}"))
                    .with("path", shown)
            }
            Ok(_) => CheckResult::new(
                "local-cache",
                CheckStatus::Fail,
                format!("{shown} exists but is not a directory"),
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CheckResult::new(
                "local-cache",
                CheckStatus::Warn,
                format!("weights not present at {shown} (PVC {claim})"),
            ),
            Err(e) => CheckResult::new("local-cache", CheckStatus::Warn, format!("failed to stat {shown}: {e}")),
        }
    }
}

#[async_trait]
impl Validator for StructuralValidator {
    async fn validate(&self, raw: &serde_json::Value, model: &Model) -> ValidationReport {
        let mut errors = Vec::new();
        if !raw.is_object() {
            errors.push("model payload must be a JSON object".to_string());
        }
        Self::identity_errors(model, &mut errors);

        let checks = vec![
            self.storage_check(model),
            self.local_cache_check(model),
            Self::vllm_check(model),
        ];
        let valid = errors.is_empty() && checks.iter().all(|c| c.status != CheckStatus::Fail);
        ValidationReport {
            valid,
            errors,
            checks,
            generated_at: Utc::now(),
        }
    }
}
