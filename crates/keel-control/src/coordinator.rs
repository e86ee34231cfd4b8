//! The control plane's single entry point: composes the catalog, jobs,
//! activation and events, and writes the audit trail.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_common::event::types;
use keel_common::history::{HISTORY_MODEL_ACTIVATED, HISTORY_MODEL_DEACTIVATED};
use keel_common::{
    Event, HistoryEntry, Job, JobLogEntry, JobStatus, Model, NewHistoryEntry, WeightInstallRequest,
};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::activation::{ActivationEngine, ActivationResult, DeactivationResult, DryRunResult};
use crate::catalog::{CatalogManager, CatalogSnapshot, CatalogStatus};
use crate::config::Capability;
use crate::error::{ControlError, ErrorKind, Result};
use crate::events::{EventBus, EventStream};
use crate::jobs::{JobFilter, JobOrchestrator, Submission, WeightInfo, WeightInventory};
use crate::metrics::{CatalogMetrics, JobMetrics};
use crate::store::StateStore;
use crate::validator::{ValidationReport, Validator};

/// Optional subsystems, decided once at startup.
pub struct Capabilities {
    pub jobs: Capability<Arc<JobOrchestrator>>,
    pub weights: Capability<WeightInventory>,
    pub validator: Capability<Arc<dyn Validator>>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            jobs: Capability::disabled("weight installs are not configured"),
            weights: Capability::disabled("weights storage is not configured"),
            validator: Capability::disabled("model validation is not configured"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Activation {
    pub model: Model,
    pub result: ActivationResult,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Promotion {
    pub previous_model_id: Option<String>,
    pub model: Model,
    pub result: ActivationResult,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub event: Option<String>,
    pub model_id: Option<String>,
    /// 0 means no limit.
    pub limit: usize,
}

impl HistoryFilter {
    fn matches(&self, entry: &HistoryEntry) -> bool {
        let wanted = |f: &Option<String>| f.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        if let Some(event) = wanted(&self.event) {
            if !entry.event.eq_ignore_ascii_case(&event) {
                return false;
            }
        }
        if let Some(model) = wanted(&self.model_id) {
            if !entry.model_id.as_deref().is_some_and(|m| m.eq_ignore_ascii_case(&model)) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSummary {
    pub status: CatalogStatus,
    pub model_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    pub jobs: bool,
    pub queue: bool,
    pub weights: bool,
    pub validator: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub catalog: CatalogSummary,
    pub active_model_id: Option<String>,
    pub jobs: BTreeMap<JobStatus, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,
    pub features: Features,
}

pub struct Coordinator {
    catalog: CatalogManager,
    activation: ActivationEngine,
    store: StateStore,
    events: EventBus,
    capabilities: Capabilities,
    replay_window: usize,
}

impl Coordinator {
    pub fn new(
        catalog: CatalogManager,
        activation: ActivationEngine,
        store: StateStore,
        events: EventBus,
        capabilities: Capabilities,
        replay_window: usize,
    ) -> Self {
        Self {
            catalog,
            activation,
            store,
            events,
            capabilities,
            replay_window,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn jobs(&self) -> Result<&Arc<JobOrchestrator>> {
        self.capabilities.jobs.require()
    }

    async fn record_history(&self, event: &str, model_id: Option<&str>, metadata: serde_json::Value) {
        let entry = NewHistoryEntry::new(event, model_id.map(str::to_string), metadata);
        if let Err(e) = self.store.append_history(entry).await {
            warn!(event, error = %e, "failed to record history");
        }
    }

    // ---- catalog ----

    pub async fn catalog(&self, force: bool) -> Result<CatalogSnapshot> {
        self.catalog.get(force).await
    }

    pub async fn list_models(&self) -> Result<Vec<Model>> {
        Ok(self.catalog.get(false).await?.models)
    }

    pub async fn get_model(&self, id: &str) -> Result<Model> {
        self.catalog.model(id, false).await
    }

    pub async fn refresh_catalog(&self, force: bool) -> Result<CatalogSnapshot> {
        self.catalog.get(force).await
    }

    // ---- activation ----

    /// Activate a catalog model against a freshly refreshed catalog. A
    /// cluster conflict triggers one more refresh-and-activate round.
    pub async fn activate(&self, model_id: &str, requested_by: Option<&str>) -> Result<Activation> {
        let model = self.catalog.model(model_id, true).await?;
        self.events.publish(Event::new(
            types::ACTIVATION_STARTED,
            json!({
                "modelId": model.id,
                "displayName": model.display_name_or_id(),
                "storageUri": model.storage_uri,
                "runtime": model.runtime,
                "hfModelId": model.hf_model_id,
                "requestedBy": requested_by,
                "requestedAt": Utc::now(),
            }),
        ));

        let (model, outcome) = match self.activation.activate(&model).await {
            Err(e) if e.kind() == ErrorKind::Conflict => {
                warn!(model_id, error = %e, "activation conflicted, rechecking catalog and retrying once");
                match self.catalog.model(model_id, true).await {
                    Ok(fresh) => {
                        let outcome = self.activation.activate(&fresh).await;
                        (fresh, outcome)
                    }
                    Err(refresh_err) => (model, Err(refresh_err)),
                }
            }
            outcome => (model, outcome),
        };

        match outcome {
            Ok(result) => {
                let meta = json!({
                    "action": result.action,
                    "modelId": model.id,
                    "displayName": model.display_name_or_id(),
                    "requestedBy": requested_by,
                });
                info!(model_id, action = ?result.action, "model activated");
                self.record_history(HISTORY_MODEL_ACTIVATED, Some(&model.id), meta.clone()).await;
                self.events.publish(Event::new(types::ACTIVATION_COMPLETED, meta));
                Ok(Activation { model, result })
            }
            Err(e) => {
                warn!(model_id, error = %e, "model activation failed");
                self.events.publish(Event::new(
                    types::ACTIVATION_FAILED,
                    json!({
                        "modelId": model.id,
                        "displayName": model.display_name_or_id(),
                        "error": e.to_string(),
                    }),
                ));
                Err(e)
            }
        }
    }

    /// Activate `candidate_id` only if the live model is still `expected_current`.
    pub async fn promote(
        &self,
        candidate_id: &str,
        expected_current: Option<&str>,
        requested_by: Option<&str>,
    ) -> Result<Promotion> {
        let current = self.activation.current_model_id().await?;
        if let (Some(expected), Some(live)) = (expected_current.filter(|s| !s.is_empty()), current.as_deref()) {
            if expected != live {
                return Err(ControlError::ActiveModelMismatch {
                    expected: expected.to_string(),
                    current: current.clone(),
                });
            }
        }
        let Activation { model, result } = self.activate(candidate_id, requested_by).await?;
        Ok(Promotion {
            previous_model_id: current,
            model,
            result,
        })
    }

    pub async fn deactivate(&self, requested_by: Option<&str>) -> Result<DeactivationResult> {
        self.events.publish(Event::new(
            types::DEACTIVATION_STARTED,
            json!({ "requestedBy": requested_by, "requestedAt": Utc::now() }),
        ));
        match self.activation.deactivate().await {
            Ok(result) => {
                info!(action = ?result.action, "active model deactivated");
                let meta = json!({ "action": result.action });
                self.record_history(HISTORY_MODEL_DEACTIVATED, None, meta.clone()).await;
                self.events.publish(Event::new(types::DEACTIVATION_COMPLETED, meta));
                Ok(result)
            }
            Err(e) => {
                warn!(error = %e, "deactivation failed");
                self.events.publish(Event::new(
                    types::DEACTIVATION_FAILED,
                    json!({ "error": e.to_string() }),
                ));
                Err(e)
            }
        }
    }

    pub async fn get_active(&self) -> Result<Option<serde_json::Value>> {
        self.activation.get_active().await
    }

    pub async fn dry_run(&self, model_id: &str) -> Result<DryRunResult> {
        let model = self.catalog.model(model_id, false).await?;
        self.activation.dry_run(&model).await
    }

    // ---- jobs ----

    pub async fn install_weights(&self, request: WeightInstallRequest) -> Result<Submission> {
        self.jobs()?.submit(request).await
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        self.jobs()?.get_job(id).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.jobs()?.list_jobs(filter).await
    }

    pub async fn job_logs(&self, id: &str) -> Result<Vec<JobLogEntry>> {
        self.jobs()?.job_logs(id).await
    }

    pub async fn cancel_job(&self, id: &str) -> Result<Job> {
        self.jobs()?.cancel(id).await
    }

    pub async fn retry_job(&self, id: &str) -> Result<Submission> {
        self.jobs()?.retry(id).await
    }

    pub async fn delete_jobs(&self, status: Option<JobStatus>) -> Result<u64> {
        self.jobs()?.delete_jobs(status).await
    }

    // ---- weights ----

    pub async fn list_weights(&self) -> Result<Vec<WeightInfo>> {
        let inventory = self.capabilities.weights.require()?.clone();
        tokio::task::spawn_blocking(move || inventory.list())
            .await
            .map_err(anyhow::Error::from)?
    }

    pub async fn get_weights(&self, name: &str) -> Result<WeightInfo> {
        let inventory = self.capabilities.weights.require()?.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || inventory.get(&name))
            .await
            .map_err(anyhow::Error::from)?
    }

    pub async fn delete_weights(&self, name: &str) -> Result<()> {
        let inventory = self.capabilities.weights.require()?.clone();
        let owned = name.to_string();
        tokio::task::spawn_blocking(move || inventory.delete(&owned))
            .await
            .map_err(anyhow::Error::from)??;
        info!(name, "weights deleted");
        Ok(())
    }

    // ---- validation ----

    pub async fn validate_model(&self, raw: serde_json::Value) -> Result<ValidationReport> {
        let validator = self.capabilities.validator.require()?;
        let model: Model = serde_json::from_value(raw.clone())
            .map_err(|e| ControlError::invalid(format!("malformed model: {e}")))?;
        Ok(validator.validate(&raw, &model).await)
    }

    // ---- history & events ----

    pub async fn list_history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>> {
        let mut entries: Vec<HistoryEntry> = self
            .store
            .list_history(0)
            .await?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        if filter.limit > 0 {
            entries.truncate(filter.limit);
        }
        Ok(entries)
    }

    pub async fn clear_history(&self) -> Result<u64> {
        self.store.clear_history().await
    }

    /// Recent jobs replayed between seed markers, then live events.
    pub async fn subscribe(&self) -> Result<EventStream> {
        self.events.subscribe_with_replay(&self.store, self.replay_window).await
    }

    pub fn catalog_metrics(&self) -> &CatalogMetrics {
        self.catalog.metrics()
    }

    /// `None` when weight installs are disabled.
    pub fn job_metrics(&self) -> Option<&JobMetrics> {
        self.capabilities.jobs.get().map(|orch| orch.metrics())
    }

    pub async fn queue_depth(&self) -> Option<usize> {
        match self.capabilities.jobs.get() {
            Some(orch) => orch.queue_depth().await,
            None => None,
        }
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let snapshot = self.catalog.peek().await;
        let active_model_id = match self.activation.current_model_id().await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "failed to read active model");
                None
            }
        };
        let (jobs, queue_depth, queue) = match self.capabilities.jobs.get() {
            Some(orch) => (orch.counts().await?, orch.queue_depth().await, orch.queue_enabled()),
            None => (BTreeMap::new(), None, false),
        };
        Ok(StatusReport {
            catalog: CatalogSummary {
                status: snapshot.status,
                model_count: snapshot.models.len(),
                observed_at: snapshot.observed_at,
            },
            active_model_id,
            jobs,
            queue_depth,
            features: Features {
                jobs: self.capabilities.jobs.is_enabled(),
                queue,
                weights: self.capabilities.weights.is_enabled(),
                validator: self.capabilities.validator.is_enabled(),
            },
        })
    }
}
