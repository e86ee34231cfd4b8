//! Catalog consistency: serves a best-effort-fresh model list that stays
//! available while the catalog source is missing, falling back to the last
//! persisted live snapshot.

mod source;

pub use source::{CatalogSource, DirCatalogSource};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use keel_common::Model;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{ControlError, Result};
use crate::metrics::CatalogMetrics;
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CatalogStatus {
    /// No refresh has happened yet.
    #[default]
    Unknown,
    /// Read from the source within the current TTL window.
    Live,
    /// Source not ready and nothing to fall back to.
    Syncing,
    /// Hydrated from the persisted snapshot.
    Cache,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSnapshot {
    pub models: Vec<Model>,
    pub status: CatalogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

impl CatalogSnapshot {
    pub fn find(&self, id: &str) -> Option<&Model> {
        self.models.iter().find(|m| m.id == id)
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    models: Vec<Model>,
    status: CatalogStatus,
    last_refresh: Option<DateTime<Utc>>,
    observed_at: Option<DateTime<Utc>>,
}

impl CatalogState {
    fn snapshot(&self) -> CatalogSnapshot {
        CatalogSnapshot {
            models: self.models.clone(),
            status: self.status,
            observed_at: self.observed_at,
        }
    }
}

pub struct CatalogManager {
    source: Arc<dyn CatalogSource>,
    store: Option<StateStore>,
    ttl: Duration,
    state: Mutex<CatalogState>,
    metrics: CatalogMetrics,
}

impl CatalogManager {
    pub fn new(source: Arc<dyn CatalogSource>, store: Option<StateStore>, ttl: Duration) -> Self {
        Self {
            source,
            store,
            ttl,
            state: Mutex::new(CatalogState::default()),
            metrics: CatalogMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &CatalogMetrics {
        &self.metrics
    }

    /// Current view, refreshing first when forced, never refreshed, past the
    /// TTL, or still syncing. Callers waiting on the lock during a refresh
    /// get its result instead of issuing another read.
    pub async fn get(&self, force: bool) -> Result<CatalogSnapshot> {
        let mut state = self.state.lock().await;
        if !self.needs_refresh(&state, force) {
            return Ok(state.snapshot());
        }

        let started = Instant::now();
        let loaded = self.source.load().await;
        self.metrics
            .observe_refresh(started.elapsed(), loaded.as_ref().ok().map(Vec::len));
        match loaded {
            Ok(models) => {
                let now = Utc::now();
                state.models = models;
                state.status = CatalogStatus::Live;
                state.last_refresh = Some(now);
                state.observed_at = Some(now);
                info!(count = state.models.len(), "catalog refreshed from source");

                if let Some(store) = &self.store {
                    if let Err(e) = store.save_catalog_snapshot(&state.models).await {
                        warn!(error = %e, "failed to persist catalog snapshot");
                    }
                }
            }
            Err(ControlError::CatalogNotReady(reason)) => {
                warn!(%reason, "catalog source not ready");
                state.models.clear();
                state.status = CatalogStatus::Syncing;
                state.last_refresh = None;
                state.observed_at = None;
                self.hydrate_from_snapshot(&mut state).await;
            }
            Err(e) => return Err(e),
        }
        Ok(state.snapshot())
    }

    /// The cached view without any I/O.
    pub async fn peek(&self) -> CatalogSnapshot {
        self.state.lock().await.snapshot()
    }

    pub async fn model(&self, id: &str, force: bool) -> Result<Model> {
        self.get(force)
            .await?
            .find(id)
            .cloned()
            .ok_or_else(|| ControlError::ModelNotFound(id.to_string()))
    }

    fn needs_refresh(&self, state: &CatalogState, force: bool) -> bool {
        if force || state.status == CatalogStatus::Syncing {
            return true;
        }
        let Some(last) = state.last_refresh else {
            return true;
        };
        // a clock step backwards reads as "fresh"
        (Utc::now() - last)
            .to_std()
            .map(|elapsed| elapsed > self.ttl)
            .unwrap_or(false)
    }

    async fn hydrate_from_snapshot(&self, state: &mut CatalogState) {
        let Some(store) = &self.store else { return };
        match store.load_catalog_snapshot().await {
            Ok(Some(record)) if !record.models.is_empty() => {
                info!(
                    count = record.models.len(),
                    updated_at = %record.updated_at,
                    "serving catalog from persisted snapshot"
                );
                state.models = record.models;
                state.status = CatalogStatus::Cache;
                state.last_refresh = Some(record.updated_at);
                state.observed_at = Some(record.updated_at);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to load catalog snapshot"),
        }
    }
}
