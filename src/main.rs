//! Kubewarden Addon Provider
//!
//! Installs Kubewarden on Cluster API workload clusters and deploys
//! Kubewarden policies to them.
//!
//! ## Usage
//!
//! ```bash
//! # Run the provider (requires kubeconfig for the management cluster)
//! kubewarden-addon-provider
//!
//! # Override provider settings from a file
//! kubewarden-addon-provider --config /etc/kubewarden-addon-provider/config.yaml
//!
//! # Run with custom log level
//! RUST_LOG=debug kubewarden-addon-provider
//! ```

use clap::Parser;
use kube::Client;
use kubewarden_addon_provider::install::{HelmCli, HttpCrdBundle};
use kubewarden_addon_provider::leader_election::{self, LeaderElector, DEFAULT_LEASE_NAME};
use kubewarden_addon_provider::remote::KubeconfigSecretProvider;
use kubewarden_addon_provider::store::{KubeClusterStore, KubeResourceStore};
use kubewarden_addon_provider::{
    AddonController, AddonReconciler, KubewardenAddon, KubewardenPolicy, PolicyController,
    PolicyReconciler, ProviderConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Kubewarden Addon Provider
#[derive(Parser, Debug)]
#[command(name = "kubewarden-addon-provider")]
#[command(version, about = "Cluster API addon provider for Kubewarden")]
struct Args {
    /// Enable leader election for HA deployments
    #[arg(long, default_value = "false")]
    leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    leader_election_namespace: String,

    /// Name of the leader election Lease
    #[arg(long, default_value = DEFAULT_LEASE_NAME)]
    leader_election_id: String,

    /// Namespace to watch (empty for all namespaces)
    #[arg(long, default_value = "")]
    namespace: String,

    /// YAML file overriding the built-in provider settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Connect timeout for workload cluster clients, in seconds
    #[arg(long, default_value = "10")]
    remote_connect_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    info!("Starting Kubewarden Addon Provider");
    info!("Leader election: {}", args.leader_election);
    info!(
        "Watching namespace: {}",
        if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        }
    );

    let config = match &args.config {
        Some(path) => {
            info!("Loading provider config from {}", path.display());
            ProviderConfig::from_file(path)?
        }
        None => ProviderConfig::default(),
    };
    config.validate()?;
    let config = Arc::new(config);

    let client = Client::try_default().await?;
    info!("Connected to management cluster API server");

    // Leader election: acquire the lease before starting controllers
    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        info!("Leader election namespace: {}", ns);
        let elector = LeaderElector::new(client.clone(), &ns, &args.leader_election_id);
        elector.acquire().await?;
        Some(Arc::new(elector))
    } else {
        None
    };

    let namespace = (!args.namespace.is_empty()).then(|| args.namespace.clone());
    let field_manager = config.field_manager.as_str();
    let clusters = Arc::new(KubeClusterStore::new(client.clone(), field_manager));
    let remotes = Arc::new(KubeconfigSecretProvider::new(
        client.clone(),
        Duration::from_secs(args.remote_connect_timeout),
        config.remote_call_timeout(),
        field_manager,
    ));

    let addon_controller = Arc::new(AddonController::new(
        client.clone(),
        namespace.clone(),
        AddonReconciler::new(
            clusters.clone(),
            Arc::new(KubeResourceStore::<KubewardenAddon>::new(client.clone(), field_manager)),
            remotes.clone(),
            Arc::new(HelmCli::new(config.helm_binary.clone())),
            Arc::new(HttpCrdBundle::new((*config).clone(), config.remote_call_timeout())?),
            Arc::clone(&config),
        ),
    ));

    let policy_controller = Arc::new(PolicyController::new(
        client.clone(),
        namespace,
        PolicyReconciler::new(
            clusters,
            Arc::new(KubeResourceStore::<KubewardenPolicy>::new(client.clone(), field_manager)),
            remotes,
            Arc::clone(&config),
        ),
    ));

    // Run controllers concurrently
    let addon_handle = {
        let controller = Arc::clone(&addon_controller);
        tokio::spawn(async move {
            if let Err(e) = controller.run().await {
                error!("KubewardenAddon controller error: {}", e);
            }
        })
    };

    let policy_handle = {
        let controller = Arc::clone(&policy_controller);
        tokio::spawn(async move {
            if let Err(e) = controller.run().await {
                error!("KubewardenPolicy controller error: {}", e);
            }
        })
    };

    // Periodic lease renewal (no-op future when leader election is disabled)
    let elector_for_renew = elector.clone();
    let renew_handle = tokio::spawn(async move {
        match elector_for_renew {
            Some(e) => loop {
                tokio::time::sleep(e.renew_interval()).await;
                match e.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("Lost leader lease");
                        break;
                    }
                    Err(err) => {
                        error!("Failed to renew leader lease: {}", err);
                        break;
                    }
                }
            },
            None => std::future::pending::<()>().await,
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = addon_handle => {
            if let Err(e) = result {
                error!("KubewardenAddon controller task failed: {}", e);
            }
        }
        result = policy_handle => {
            if let Err(e) = result {
                error!("KubewardenPolicy controller task failed: {}", e);
            }
        }
        _ = renew_handle => {
            error!("Leader lease lost, initiating shutdown");
        }
    }

    if let Some(e) = &elector {
        e.release().await;
    }

    info!("Kubewarden Addon Provider shutting down");
    Ok(())
}
