//! vmscaler
//!
//! Keeps a pool of scale sets sized to the desired node count stored on the
//! resource group, and deletes preempted instances reported on the eviction
//! queue.
//!
//! ## Architecture
//!
//! - **Operation tracker**: Actor that watches in-flight control plane operations
//! - **Reconciler**: Drains the eviction queue and runs planning passes
//! - **Collaborators**: Fleet, tag store and queue clients (in-memory for now)

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleetscale_vmscaler::actors::{OperationTracker, Supervisor, TrackerConfig};
use fleetscale_vmscaler::cloud::Clients;
use fleetscale_vmscaler::config::Config;
use fleetscale_vmscaler::drain::DrainConfig;
use fleetscale_vmscaler::memory::{InMemoryFleet, InMemoryQueue, InMemoryTagStore};
use fleetscale_vmscaler::reconciler::{Reconciler, ReconcilerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.as_str().into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vmscaler");
    info!(
        resource_group = %config.resource_group,
        location = %config.location,
        vm_sku = %config.vm_sku,
        vms_per_scale_set = config.vms_per_scale_set,
        queue_name = %config.queue_name,
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create the collaborators (in-memory for now)
    let clients = Clients {
        fleet: Arc::new(InMemoryFleet::new()),
        tags: Arc::new(InMemoryTagStore::new()),
        queue: Arc::new(InMemoryQueue::new()),
        resource_group: config.resource_group.clone(),
    };

    // Start the operation tracker
    let mut supervisor = Supervisor::new(shutdown_rx.clone());
    let tracker = OperationTracker::spawn(&mut supervisor, TrackerConfig::default());

    // Start the reconciliation loop
    let reconciler = Reconciler::new(
        clients,
        tracker,
        config.planner(),
        config.template(),
        DrainConfig::default(),
        ReconcilerConfig::default(),
    );
    let mut reconciler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut reconciler_handle => {
            if let Err(e) = result {
                error!(error = %e, "Reconciler task panicked");
            } else {
                info!("Reconciler exited");
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if !reconciler_handle.is_finished() {
        if let Err(e) = reconciler_handle.await {
            error!(error = %e, "Reconciler task panicked");
        }
    }
    supervisor.stop_all().await;

    info!("vmscaler shutdown complete");
    Ok(())
}
