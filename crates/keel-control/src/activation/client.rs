use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::manifest::InferenceService;
use crate::error::{ControlError, Result};

/// Operations on the one named deployment resource.
///
/// `create` on an existing resource fails with `AlreadyExists`; `replace`
/// with a stale resource version fails with `Conflict`.
#[async_trait]
pub trait DeploymentClient: Send + Sync {
    fn name(&self) -> &str;

    /// The live resource as returned by the cluster, or `None` when absent.
    async fn get(&self) -> Result<Option<serde_json::Value>>;

    async fn create(&self, manifest: &InferenceService, dry_run: bool) -> Result<()>;

    async fn replace(&self, manifest: &InferenceService, dry_run: bool) -> Result<()>;

    /// Returns false when there was nothing to delete.
    async fn delete(&self) -> Result<bool>;
}

/// Reads `metadata.resourceVersion` off a live resource.
pub fn resource_version(live: &serde_json::Value) -> Option<String> {
    live.pointer("/metadata/resourceVersion")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Keeps the resource in memory. Used in tests and when the server runs
/// without a cluster.
pub struct MemoryDeploymentClient {
    name: String,
    current: Mutex<Option<serde_json::Value>>,
    version: AtomicU64,
    injected_conflicts: AtomicUsize,
}

impl MemoryDeploymentClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current: Mutex::new(None),
            version: AtomicU64::new(0),
            injected_conflicts: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` writes fail with a conflict.
    pub fn inject_conflicts(&self, n: usize) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    fn take_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn stamp(&self, manifest: &InferenceService) -> Result<serde_json::Value> {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let mut value = manifest.to_value()?;
        value["metadata"]["resourceVersion"] = version.to_string().into();
        Ok(value)
    }
}

#[async_trait]
impl DeploymentClient for MemoryDeploymentClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self) -> Result<Option<serde_json::Value>> {
        Ok(self.current.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn create(&self, manifest: &InferenceService, dry_run: bool) -> Result<()> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if current.is_some() {
            return Err(ControlError::AlreadyExists(self.name.clone()));
        }
        if !dry_run {
            *current = Some(self.stamp(manifest)?);
        }
        Ok(())
    }

    async fn replace(&self, manifest: &InferenceService, dry_run: bool) -> Result<()> {
        if self.take_conflict() {
            return Err(ControlError::Conflict(format!("{} was modified concurrently", self.name)));
        }
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        let Some(live) = current.as_ref() else {
            return Err(ControlError::DeploymentNotFound(self.name.clone()));
        };
        if let Some(expected) = manifest.metadata.resource_version.as_deref() {
            if resource_version(live).as_deref() != Some(expected) {
                return Err(ControlError::Conflict(format!(
                    "{} resource version {expected} is stale",
                    self.name
                )));
            }
        }
        if !dry_run {
            *current = Some(self.stamp(manifest)?);
        }
        Ok(())
    }

    async fn delete(&self) -> Result<bool> {
        Ok(self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some())
    }
}
