//! VirtualCluster Operator
//!
//! Provisions nested tenant control planes and schedules tenant namespaces
//! across super clusters.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! virtualcluster-operator --super-clusters /etc/vc/super-clusters.yaml
//!
//! # Run with custom log level
//! RUST_LOG=debug virtualcluster-operator
//! ```

use clap::Parser;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use virtualcluster_operator::controllers::CrdSliceResolver;
use virtualcluster_operator::leader_election::{self, LeaderElector, LeaseSettings};
use virtualcluster_operator::scheduler::{self, DirtyVirtualClusters, SchedulerEngine};
use virtualcluster_operator::scheduler::cache::SchedulerCache;
use virtualcluster_operator::tenant::KubeTenantGateway;
use virtualcluster_operator::{
    NamespaceReconciler, Patroller, ProvisionerController, TenantRegistrar,
};

/// VirtualCluster Operator
#[derive(Parser, Debug)]
#[command(name = "virtualcluster-operator")]
#[command(version, about = "Kubernetes operator for nested tenant control planes")]
struct Args {
    /// Enable leader election for HA deployments
    #[arg(long, default_value = "false")]
    leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    leader_election_namespace: String,

    /// Name of the leader election Lease
    #[arg(long, default_value = "virtualcluster-scheduler-leader")]
    leader_election_lock: String,

    /// Global deadline for each component readiness wait, in seconds
    #[arg(long, default_value = "600")]
    provisioner_timeout_secs: u64,

    /// Patrol interval, in seconds
    #[arg(long, default_value = "60")]
    patrol_period_secs: u64,

    /// Full tenant namespace resync interval, in seconds
    #[arg(long, default_value = "300")]
    resync_period_secs: u64,

    /// Namespace reconcile workers
    #[arg(long, default_value = "4")]
    scheduler_workers: usize,

    /// Path to the super cluster inventory YAML
    #[arg(long, default_value = "")]
    super_clusters: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    info!("Starting VirtualCluster Operator");
    info!("Leader election: {}", args.leader_election);

    // Create Kubernetes client for the host cluster
    let client = Client::try_default().await?;
    info!("Connected to host API server");

    // Leader election: the scheduler cache and the patroller belong to the
    // single elected leader
    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        info!("Leader election namespace: {}", ns);
        let elector = LeaderElector::new(
            client.clone(),
            &ns,
            &args.leader_election_lock,
            LeaseSettings::default(),
        );
        elector.acquire().await?;
        Some(Arc::new(elector))
    } else {
        None
    };

    // Scheduler core
    let cache = Arc::new(SchedulerCache::new());
    if !args.super_clusters.is_empty() {
        let inventory = std::fs::read_to_string(&args.super_clusters)?;
        let count = scheduler::load_inventory(&inventory, &cache)?;
        info!("Registered {} super cluster(s) from {}", count, args.super_clusters);
    } else {
        info!("No super cluster inventory given; namespace scheduling is idle");
    }
    let engine = Arc::new(SchedulerEngine::new(Arc::clone(&cache)));
    let dirty = Arc::new(DirtyVirtualClusters::new());
    let gateway = Arc::new(KubeTenantGateway::new());
    let slices = Arc::new(CrdSliceResolver::new(client.clone()));

    let reconciler = Arc::new(NamespaceReconciler::new(
        Arc::clone(&engine),
        gateway.clone(),
        slices.clone(),
        Arc::clone(&dirty),
    ));
    let queue = reconciler.queue();

    let shutdown = CancellationToken::new();

    // Provisioner controller on the kube runtime
    let provisioner = Arc::new(ProvisionerController::new(
        client.clone(),
        Duration::from_secs(args.provisioner_timeout_secs),
    ));
    let provisioner_handle = tokio::spawn(async move {
        if let Err(e) = provisioner.run().await {
            error!("Provisioner controller error: {}", e);
        }
    });

    // Namespace reconcile workers
    let workers_handle = {
        let reconciler = Arc::clone(&reconciler);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            reconciler.run_workers(args.scheduler_workers, shutdown).await;
        })
    };

    // Tenant discovery and cache warm-up
    let registrar = Arc::new(TenantRegistrar::new(
        client.clone(),
        gateway.clone(),
        Arc::clone(&engine),
        slices,
        Arc::clone(&dirty),
        Arc::clone(&queue),
    ));
    let registrar_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            registrar.run(shutdown).await;
        })
    };

    // Patroller
    let patroller = Arc::new(Patroller::new(
        client.clone(),
        gateway.clone(),
        Arc::clone(&queue),
        Duration::from_secs(args.patrol_period_secs),
    ));
    let patrol_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            patroller.run(shutdown).await;
        })
    };

    // Periodic full resync of tenant namespaces into the work queue
    let resync_handle = {
        let reconciler = Arc::clone(&reconciler);
        let shutdown = shutdown.clone();
        let period = Duration::from_secs(args.resync_period_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                reconciler.resync().await;
            }
        })
    };

    // Lease renewal: cancels the shutdown token if leadership is lost
    if let Some(e) = &elector {
        tokio::spawn(Arc::clone(e).run_renewal(shutdown.clone()));
    }

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = shutdown.cancelled() => {
            error!("Leadership lost, initiating shutdown");
        }
        result = provisioner_handle => {
            if let Err(e) = result {
                error!("Provisioner task failed: {}", e);
            }
        }
    }

    // Stop the leader-owned loops and let a standby take over immediately
    shutdown.cancel();
    for handle in [workers_handle, registrar_handle, patrol_handle, resync_handle] {
        let _ = handle.await;
    }
    if let Some(e) = &elector {
        e.release().await;
    }

    info!("VirtualCluster Operator shutting down");
    Ok(())
}
