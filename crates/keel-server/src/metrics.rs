use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use keel_common::JOB_TYPE_WEIGHT_INSTALL;
use keel_control::{Coordinator, HistogramSnapshot, JobMetrics};

use crate::state::AppState;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
    /// Open `/events` streams (gauge).
    pub sse_connections: AtomicU64,
    /// Frames written to `/events` streams, by event type.
    pub sse_events: DashMap<String, AtomicU64>,
}

impl Metrics {
    pub fn observe_sse_event(&self, kind: &str) {
        let kind = if kind.is_empty() { "unknown" } else { kind };
        if let Some(n) = self.sse_events.get(kind) {
            n.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.sse_events
            .entry(kind.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Counts the stream as open until the returned guard drops.
    pub fn track_sse_connection(self: &std::sync::Arc<Self>) -> SseConnection {
        self.sse_connections.fetch_add(1, Ordering::Relaxed);
        SseConnection(self.clone())
    }
}

pub struct SseConnection(std::sync::Arc<Metrics>);

impl Drop for SseConnection {
    fn drop(&mut self) {
        self.0.sse_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

fn scalar(body: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = write!(body, "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n");
}

fn histogram_series(body: &mut String, name: &str, labels: &str, snap: &HistogramSnapshot) {
    for (bound, count) in &snap.buckets {
        let _ = writeln!(body, "{name}_bucket{{{labels},le=\"{bound}\"}} {count}");
    }
    let _ = writeln!(body, "{name}_bucket{{{labels},le=\"+Inf\"}} {}", snap.count);
    let _ = writeln!(body, "{name}_sum{{{labels}}} {}", snap.sum_secs);
    let _ = writeln!(body, "{name}_count{{{labels}}} {}", snap.count);
}

fn render_jobs(body: &mut String, jobs: &JobMetrics) {
    body.push_str(
        "# HELP keel_job_status_total Jobs that reached a terminal status.\n\
         # TYPE keel_job_status_total counter\n",
    );
    for status in JobMetrics::terminal_statuses() {
        let _ = writeln!(
            body,
            "keel_job_status_total{{type=\"{JOB_TYPE_WEIGHT_INSTALL}\",status=\"{status}\"}} {}",
            jobs.status_total(*status)
        );
    }
    body.push_str(
        "# HELP keel_job_duration_seconds Duration of executed job attempts.\n\
         # TYPE keel_job_duration_seconds histogram\n",
    );
    for status in JobMetrics::terminal_statuses() {
        if let Some(snap) = jobs.duration(*status) {
            let labels = format!("type=\"{JOB_TYPE_WEIGHT_INSTALL}\",status=\"{status}\"");
            histogram_series(body, "keel_job_duration_seconds", &labels, &snap);
        }
    }
}

/// Prometheus text exposition of request, stream, job and catalog metrics.
pub fn render_metrics(metrics: &Metrics, coordinator: &Coordinator, queue_depth: Option<usize>) -> String {
    let mut body = String::new();

    scalar(&mut body, "keel_requests_total", "counter", "Total requests handled.", metrics.requests_total.load(Ordering::Relaxed));
    scalar(&mut body, "keel_requests_inflight", "gauge", "Currently in-flight requests.", metrics.requests_inflight.load(Ordering::Relaxed));
    scalar(&mut body, "keel_responses_2xx", "counter", "Total 2xx responses.", metrics.status_2xx.load(Ordering::Relaxed));
    scalar(&mut body, "keel_responses_4xx", "counter", "Total 4xx responses.", metrics.status_4xx.load(Ordering::Relaxed));
    scalar(&mut body, "keel_responses_5xx", "counter", "Total 5xx responses.", metrics.status_5xx.load(Ordering::Relaxed));

    scalar(&mut body, "keel_sse_connections", "gauge", "Open event streams.", metrics.sse_connections.load(Ordering::Relaxed));
    body.push_str(
        "# HELP keel_sse_events_total Events written to event streams.\n\
         # TYPE keel_sse_events_total counter\n",
    );
    let mut kinds: Vec<(String, u64)> = metrics
        .sse_events
        .iter()
        .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
        .collect();
    kinds.sort();
    for (kind, n) in kinds {
        let _ = writeln!(body, "keel_sse_events_total{{type=\"{kind}\"}} {n}");
    }
    scalar(
        &mut body,
        "keel_event_subscribers",
        "gauge",
        "Subscribers attached to the in-process event bus.",
        coordinator.events().subscriber_count(),
    );

    if let Some(jobs) = coordinator.job_metrics() {
        render_jobs(&mut body, jobs);
    }
    if let Some(depth) = queue_depth {
        scalar(&mut body, "keel_job_queue_depth", "gauge", "Queued jobs waiting for a worker.", depth);
    }

    let catalog = coordinator.catalog_metrics();
    body.push_str(
        "# HELP keel_catalog_refresh_total Catalog source reads by outcome.\n\
         # TYPE keel_catalog_refresh_total counter\n",
    );
    let _ = writeln!(
        body,
        "keel_catalog_refresh_total{{status=\"success\"}} {}",
        catalog.refresh_success.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        body,
        "keel_catalog_refresh_total{{status=\"failed\"}} {}",
        catalog.refresh_failed.load(Ordering::Relaxed)
    );
    scalar(
        &mut body,
        "keel_catalog_models",
        "gauge",
        "Models held after the most recent successful refresh.",
        catalog.models_cached.load(Ordering::Relaxed),
    );
    body.push_str(
        "# HELP keel_catalog_refresh_duration_seconds Duration of catalog source reads.\n\
         # TYPE keel_catalog_refresh_duration_seconds histogram\n",
    );
    let snap = catalog.refresh_duration.snapshot();
    for (bound, count) in &snap.buckets {
        let _ = writeln!(body, "keel_catalog_refresh_duration_seconds_bucket{{le=\"{bound}\"}} {count}");
    }
    let _ = writeln!(body, "keel_catalog_refresh_duration_seconds_bucket{{le=\"+Inf\"}} {}", snap.count);
    let _ = writeln!(body, "keel_catalog_refresh_duration_seconds_sum {}", snap.sum_secs);
    let _ = writeln!(body, "keel_catalog_refresh_duration_seconds_count {}", snap.count);

    body
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    let queue_depth = st.coordinator.queue_depth().await;
    let body = render_metrics(&st.metrics, &st.coordinator, queue_depth);
    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    st.metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).await;
    st.metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    if status >= 500 {
        st.metrics.status_5xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 400 {
        st.metrics.status_4xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 200 {
        st.metrics.status_2xx.fetch_add(1, Ordering::Relaxed);
    }

    Ok(resp)
}
