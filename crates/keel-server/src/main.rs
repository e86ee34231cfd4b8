mod args;
mod handlers;
mod metrics;
mod state;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use keel_common::telemetry::{init_tracing, TelemetryConfig};
use keel_control::activation::{
    ActivationEngine, DeploymentClient, KubeDeploymentClient, ManifestBuilder, MemoryDeploymentClient,
};
use keel_control::catalog::{CatalogManager, DirCatalogSource};
use keel_control::jobs::{JobOrchestrator, JobQueue, JobSettings, KvJobQueue, LocalWeightInstaller, WeightInventory};
use keel_control::validator::{StructuralValidator, Validator};
use keel_control::{Capabilities, Capability, Coordinator, EventBus, EventRelay, StateStore};
use keel_meta::{EtcdKvStore, KvStore, MemoryKvStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::args::Args;
use crate::handlers::router;
use crate::state::AppState;

/// Extra time a queue claim stays exclusive beyond the install timeout.
const CLAIM_GRACE: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _telemetry = init_tracing(&TelemetryConfig {
        service_name: "keel-server".to_string(),
        otlp_endpoint: args.otlp_endpoint.clone(),
        otlp_token: args.otlp_token.clone(),
        default_filter: None,
    });
    let config = args.control_config();
    info!(namespace = %config.namespace, deployment = %config.deployment_name, "keel-server starting");

    let shared = args.etcd_endpoint.is_some();
    let kv: Arc<dyn KvStore> = match &args.etcd_endpoint {
        Some(endpoint) => {
            let kv = EtcdKvStore::connect(std::slice::from_ref(endpoint)).await?;
            info!(%endpoint, "connected to etcd");
            Arc::new(kv)
        }
        None => {
            warn!("no etcd endpoint configured, state is kept in memory");
            Arc::new(MemoryKvStore::new())
        }
    };
    let store = StateStore::new(kv.clone());
    let events = EventBus::new(config.subscriber_buffer);
    let shutdown = CancellationToken::new();

    let relay = shared.then(|| EventRelay::new(kv.clone()).start(&events, shutdown.clone()));

    let catalog = CatalogManager::new(
        Arc::new(DirCatalogSource::new(
            config.catalog_root.clone(),
            config.catalog_models_dir.clone(),
        )),
        Some(store.clone()),
        config.catalog_ttl,
    );

    let client: Arc<dyn DeploymentClient> = if args.in_memory_cluster {
        warn!("managing an in-memory InferenceService");
        Arc::new(MemoryDeploymentClient::new(config.deployment_name.clone()))
    } else {
        Arc::new(KubeDeploymentClient::connect(&config.namespace, config.deployment_name.clone()).await?)
    };
    let builder = ManifestBuilder::new(config.namespace.clone(), config.deployment_name.clone())
        .with_model_root(config.inference_model_root.clone());
    let activation = ActivationEngine::new(client, builder);

    let queue: Capability<Arc<dyn JobQueue>> = match (args.use_queue, shared) {
        (true, true) => Capability::Enabled(Arc::new(KvJobQueue::new(
            kv.clone(),
            config.install_timeout + CLAIM_GRACE,
        ))),
        (true, false) => {
            warn!("queue requested without etcd, running installs inline");
            Capability::disabled("queue requires a shared store")
        }
        (false, _) => Capability::disabled("queue not enabled"),
    };

    let (jobs, weights) = match &args.weights_storage_path {
        Some(path) => {
            let installer = Arc::new(LocalWeightInstaller::with_hf_cli(path.clone()));
            let orchestrator = Arc::new(JobOrchestrator::new(
                store.clone(),
                events.clone(),
                installer,
                queue,
                JobSettings::from(&config),
            ));
            (
                Capability::Enabled(orchestrator),
                Capability::Enabled(WeightInventory::new(path.clone())),
            )
        }
        None => {
            warn!("WEIGHTS_STORAGE_PATH not set, weight installs disabled");
            (
                Capability::disabled("weights storage is not configured"),
                Capability::disabled("weights storage is not configured"),
            )
        }
    };
    let orchestrator = jobs.get().cloned();

    let validator: Arc<dyn Validator> = Arc::new(StructuralValidator::new(
        config.weights_pvc_name.clone(),
        args.weights_storage_path.clone(),
    ));
    let capabilities = Capabilities {
        jobs,
        weights,
        validator: Capability::Enabled(validator),
    };

    let coordinator = Arc::new(Coordinator::new(
        catalog,
        activation,
        store,
        events,
        capabilities,
        config.replay_window,
    ));
    let app = router(AppState::new(coordinator));

    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    info!(addr = %args.listen_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    info!("shutting down");
    shutdown.cancel();
    if let Some(orchestrator) = orchestrator {
        orchestrator.shutdown().await;
    }
    if let Some(relay) = relay {
        if let Err(e) = relay.await {
            warn!(error = %e, "event relay task failed");
        }
    }
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    }
}
