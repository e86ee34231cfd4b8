mod args;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use keel_common::telemetry::{init_tracing, TelemetryConfig};
use keel_control::jobs::{JobOrchestrator, JobSettings, KvJobQueue, LocalWeightInstaller, QueueWorker};
use keel_control::{Capability, EventBus, EventRelay, StateStore};
use keel_meta::{EtcdKvStore, KvStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::args::Args;

const CLAIM_GRACE: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _telemetry = init_tracing(&TelemetryConfig {
        service_name: "keel-worker".to_string(),
        otlp_endpoint: args.otlp_endpoint.clone(),
        otlp_token: args.otlp_token.clone(),
        default_filter: None,
    });
    let config = args.control_config();
    let worker_id = args
        .worker_id
        .clone()
        .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));
    info!(%worker_id, storage = %config.weights_storage_path, "keel-worker starting");

    let kv: Arc<dyn KvStore> =
        Arc::new(EtcdKvStore::connect(std::slice::from_ref(&args.etcd_endpoint)).await?);
    info!(endpoint = %args.etcd_endpoint, "connected to etcd");

    let shutdown = CancellationToken::new();
    let events = EventBus::new(config.subscriber_buffer);
    let relay = EventRelay::new(kv.clone()).start(&events, shutdown.clone());

    let queue = Arc::new(KvJobQueue::new(kv.clone(), config.install_timeout + CLAIM_GRACE));
    let orchestrator = Arc::new(JobOrchestrator::new(
        StateStore::new(kv),
        events,
        Arc::new(LocalWeightInstaller::with_hf_cli(config.weights_storage_path.clone())),
        // a worker never re-enqueues; retries go through the server
        Capability::disabled("workers execute queued jobs only"),
        JobSettings::from(&config),
    ));
    let worker = QueueWorker::new(
        worker_id,
        queue,
        orchestrator,
        Duration::from_secs(args.poll_secs.max(1)),
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c, stopping"),
        }
        signal.cancel();
    });

    if let Err(e) = worker.run(shutdown.clone()).await {
        error!(error = %e, "queue worker failed");
        shutdown.cancel();
    }
    if let Err(e) = relay.await {
        warn!(error = %e, "event relay task failed");
    }
    info!("keel-worker stopped");
    Ok(())
}
