//! Reconciles the single active inference deployment against a catalog model.

mod client;
mod cluster;
pub mod manifest;

pub use client::{resource_version, DeploymentClient, MemoryDeploymentClient};
pub use cluster::KubeDeploymentClient;
pub use manifest::{InferenceService, ManifestBuilder};

use std::sync::Arc;

use keel_common::Model;
use serde::Serialize;
use tracing::info;

use crate::error::{ControlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationAction {
    Deleted,
    AlreadyDeleted,
}

/// What a real activation would do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DryRunAction {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationResult {
    pub action: ActivationAction,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeactivationResult {
    pub action: DeactivationAction,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DryRunResult {
    pub action: DryRunAction,
    pub manifest: InferenceService,
}

pub struct ActivationEngine {
    client: Arc<dyn DeploymentClient>,
    builder: ManifestBuilder,
}

impl ActivationEngine {
    pub fn new(client: Arc<dyn DeploymentClient>, builder: ManifestBuilder) -> Self {
        Self { client, builder }
    }

    pub fn name(&self) -> &str {
        self.client.name()
    }

    pub fn render(&self, model: &Model) -> InferenceService {
        self.builder.build(model)
    }

    /// Update the resource if it exists, otherwise create it. Conflicts are
    /// returned to the caller unretried.
    pub async fn activate(&self, model: &Model) -> Result<ActivationResult> {
        let manifest = self.render(model);
        let action = match self.client.get().await? {
            Some(live) => {
                info!(model_id = %model.id, name = %self.name(), "updating InferenceService");
                let manifest = manifest.with_resource_version(resource_version(&live));
                self.client.replace(&manifest, false).await?;
                ActivationAction::Updated
            }
            None => {
                info!(model_id = %model.id, name = %self.name(), "creating InferenceService");
                self.client.create(&manifest, false).await?;
                ActivationAction::Created
            }
        };
        Ok(ActivationResult {
            action,
            name: self.name().to_string(),
        })
    }

    /// Server-side validation without persisting. A create that loses a race
    /// to a concurrent writer is re-run as an update.
    pub async fn dry_run(&self, model: &Model) -> Result<DryRunResult> {
        let manifest = self.render(model);
        let live = match self.client.get().await? {
            Some(live) => live,
            None => match self.client.create(&manifest, true).await {
                Ok(()) => {
                    return Ok(DryRunResult {
                        action: DryRunAction::Create,
                        manifest,
                    })
                }
                Err(ControlError::AlreadyExists(_)) => self.client.get().await?.ok_or_else(|| {
                    ControlError::Conflict(format!("{} changed during dry-run", self.name()))
                })?,
                Err(e) => return Err(e),
            },
        };
        let versioned = manifest.clone().with_resource_version(resource_version(&live));
        self.client.replace(&versioned, true).await?;
        Ok(DryRunResult {
            action: DryRunAction::Update,
            manifest,
        })
    }

    /// Delete the resource. Deleting an absent resource succeeds.
    pub async fn deactivate(&self) -> Result<DeactivationResult> {
        let action = if self.client.delete().await? {
            info!(name = %self.name(), "InferenceService deleted");
            DeactivationAction::Deleted
        } else {
            info!(name = %self.name(), "InferenceService already deleted");
            DeactivationAction::AlreadyDeleted
        };
        Ok(DeactivationResult {
            action,
            name: self.name().to_string(),
        })
    }

    pub async fn get_active(&self) -> Result<Option<serde_json::Value>> {
        self.client.get().await
    }

    /// Catalog id stamped on the live resource.
    pub async fn current_model_id(&self) -> Result<Option<String>> {
        Ok(self.client.get().await?.and_then(|live| {
            live["metadata"]["annotations"][manifest::MODEL_ID_ANNOTATION]
                .as_str()
                .map(str::to_string)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn model(id: &str) -> Model {
        Model {
            id: id.into(),
            hf_model_id: Some(format!("org/{id}")),
            ..Default::default()
        }
    }

    fn engine() -> (ActivationEngine, Arc<MemoryDeploymentClient>) {
        let client = Arc::new(MemoryDeploymentClient::new("active-llm"));
        let engine = ActivationEngine::new(client.clone(), ManifestBuilder::new("ai", "active-llm"));
        (engine, client)
    }

    #[tokio::test]
    async fn test_activate_creates_then_updates() {
        let (engine, _) = engine();
        let first = engine.activate(&model("a")).await.unwrap();
        assert_eq!(first.action, ActivationAction::Created);
        assert_eq!(first.name, "active-llm");

        let second = engine.activate(&model("b")).await.unwrap();
        assert_eq!(second.action, ActivationAction::Updated);
        assert_eq!(engine.current_model_id().await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_deactivate_is_idempotent() {
        let (engine, _) = engine();
        engine.activate(&model("a")).await.unwrap();
        assert_eq!(engine.deactivate().await.unwrap().action, DeactivationAction::Deleted);
        assert_eq!(engine.deactivate().await.unwrap().action, DeactivationAction::AlreadyDeleted);
        assert!(engine.get_active().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dry_run_does_not_persist() {
        let (engine, _) = engine();
        let result = engine.dry_run(&model("a")).await.unwrap();
        assert_eq!(result.action, DryRunAction::Create);
        assert_eq!(result.manifest.model_id(), Some("a"));
        assert!(engine.get_active().await.unwrap().is_none());

        engine.activate(&model("a")).await.unwrap();
        let result = engine.dry_run(&model("b")).await.unwrap();
        assert_eq!(result.action, DryRunAction::Update);
        assert_eq!(engine.current_model_id().await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_conflict_propagates() {
        let (engine, client) = engine();
        engine.activate(&model("a")).await.unwrap();
        client.inject_conflicts(1);
        let err = engine.activate(&model("b")).await.unwrap_err();
        assert!(matches!(err, ControlError::Conflict(_)));
    }

    /// Reports the resource absent once, as if a concurrent create landed
    /// right after the existence check.
    struct LateCreator {
        inner: MemoryDeploymentClient,
        hide_once: AtomicBool,
    }

    #[async_trait]
    impl DeploymentClient for LateCreator {
        fn name(&self) -> &str {
            self.inner.name()
        }
        async fn get(&self) -> Result<Option<serde_json::Value>> {
            if self.hide_once.swap(false, Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.get().await
        }
        async fn create(&self, manifest: &InferenceService, dry_run: bool) -> Result<()> {
            self.inner.create(manifest, dry_run).await
        }
        async fn replace(&self, manifest: &InferenceService, dry_run: bool) -> Result<()> {
            self.inner.replace(manifest, dry_run).await
        }
        async fn delete(&self) -> Result<bool> {
            self.inner.delete().await
        }
    }

    #[tokio::test]
    async fn test_dry_run_create_race_reports_update() {
        let client = Arc::new(LateCreator {
            inner: MemoryDeploymentClient::new("active-llm"),
            hide_once: AtomicBool::new(false),
        });
        let engine = ActivationEngine::new(client.clone(), ManifestBuilder::new("ai", "active-llm"));
        engine.activate(&model("a")).await.unwrap();

        client.hide_once.store(true, Ordering::SeqCst);
        let result = engine.dry_run(&model("b")).await.unwrap();
        assert_eq!(result.action, DryRunAction::Update);
    }
}
