//! Hoard Operator - cluster-wide model cache coordination

use clap::Parser;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hoard_common::crd::{CacheNode, CacheNodeGroup, ModelCache};
use hoard_common::{FIELD_MANAGER, HOARD_SYSTEM_NAMESPACE};

mod controller_runner;

/// Hoard - pre-stages large model artifacts onto cluster nodes
#[derive(Parser, Debug)]
#[command(name = "hoard", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Namespace holding the operator and the per-node-group download PVCs
    #[arg(long, env = "HOARD_CACHE_NAMESPACE", default_value = HOARD_SYSTEM_NAMESPACE)]
    cache_namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        print_crds()?;
        return Ok(());
    }

    run_controller(cli.cache_namespace).await
}

/// Print all Hoard CRD manifests to stdout as one YAML stream
fn print_crds() -> anyhow::Result<()> {
    let crds = [
        serde_yaml::to_string(&ModelCache::crd())?,
        serde_yaml::to_string(&CacheNodeGroup::crd())?,
        serde_yaml::to_string(&CacheNode::crd())?,
    ];
    println!("{}", crds.join("---\n"));
    Ok(())
}

/// Ensure all Hoard CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply.
/// This ensures the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for (name, crd) in [
        ("modelcaches.hoard.dev", ModelCache::crd()),
        ("cachenodegroups.hoard.dev", CacheNodeGroup::crd()),
        ("cachenodes.hoard.dev", CacheNode::crd()),
    ] {
        tracing::info!(crd = %name, "Installing CRD...");
        crds.patch(name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    tracing::info!("All Hoard CRDs installed/updated");
    Ok(())
}

/// Run in controller mode
async fn run_controller(cache_namespace: String) -> anyhow::Result<()> {
    tracing::info!("Hoard controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let (group_store, group_reflector) =
        controller_runner::build_group_reflector(client.clone());
    let controller =
        controller_runner::build_model_cache_controller(client, cache_namespace, group_store);

    tracing::info!("Starting Hoard controllers...");

    tokio::select! {
        _ = controller => {
            tracing::info!("ModelCache controller completed");
        }
        _ = group_reflector => {
            tracing::info!("CacheNodeGroup reflector completed");
        }
    }

    tracing::info!("Hoard controller shutting down");
    Ok(())
}
