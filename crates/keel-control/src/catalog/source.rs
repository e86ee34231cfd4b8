use std::path::PathBuf;

use async_trait::async_trait;
use keel_common::Model;
use tracing::{debug, warn};

use crate::error::{ControlError, Result};

/// Where catalog models come from. Implementations return
/// [`ControlError::CatalogNotReady`] when the source is expected to appear
/// later (e.g. a sync sidecar has not populated it yet).
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn load(&self) -> Result<Vec<Model>>;
}

/// Reads `{root}/{models_dir}/*.json`, one model per file. Unreadable or
/// id-less files are skipped with a warning.
#[derive(Debug, Clone)]
pub struct DirCatalogSource {
    root: PathBuf,
    models_dir: String,
}

impl DirCatalogSource {
    pub fn new(root: impl Into<PathBuf>, models_dir: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            models_dir: models_dir.into(),
        }
    }

    pub fn models_path(&self) -> PathBuf {
        self.root.join(&self.models_dir)
    }

    async fn load_file(path: &std::path::Path) -> Result<Model> {
        let data = tokio::fs::read(path).await?;
        let model: Model = serde_json::from_slice(&data)?;
        if model.id.trim().is_empty() {
            return Err(ControlError::invalid("model config missing 'id' field"));
        }
        Ok(model)
    }
}

#[async_trait]
impl CatalogSource for DirCatalogSource {
    async fn load(&self) -> Result<Vec<Model>> {
        let dir = self.models_path();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ControlError::CatalogNotReady(format!(
                    "models directory missing: {}",
                    dir.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut models: Vec<Model> = Vec::with_capacity(paths.len());
        for path in paths {
            match Self::load_file(&path).await {
                Ok(model) => {
                    debug!(model_id = %model.id, path = %path.display(), "loaded catalog model");
                    // a later file with the same id wins, matching a keyed reload
                    models.retain(|m| m.id != model.id);
                    models.push(model);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping catalog file"),
            }
        }
        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_dir_is_not_ready() {
        let tmp = tempfile::tempdir().unwrap();
        let source = DirCatalogSource::new(tmp.path(), "models");
        let err = source.load().await.unwrap_err();
        assert!(matches!(err, ControlError::CatalogNotReady(_)));
    }

    #[tokio::test]
    async fn test_loads_json_and_skips_bad_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("models");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("b.json"), r#"{"id":"beta","runtime":"vllm-runtime"}"#).unwrap();
        std::fs::write(dir.join("a.json"), r#"{"id":"alpha"}"#).unwrap();
        std::fs::write(dir.join("broken.json"), "{not json").unwrap();
        std::fs::write(dir.join("noid.json"), r#"{"displayName":"x"}"#).unwrap();
        std::fs::write(dir.join("README.md"), "ignored").unwrap();

        let models = DirCatalogSource::new(tmp.path(), "models").load().await.unwrap();
        let ids: Vec<_> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);
    }
}
