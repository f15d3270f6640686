//! Preview Operator - ephemeral per-pull-request environments on Kubernetes

use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use preview_common::crd::PreviewEnvironment;
use preview_common::telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
use preview_environment::{CleanupScheduler, ClusterClientImpl, Context};
use preview_operator::controller_runner::build_preview_controller;
use preview_operator::settings::OperatorArgs;
use preview_operator::startup::ensure_crds_installed;

/// Preview - per-pull-request preview environments driven by a CRD
#[derive(Parser, Debug)]
#[command(name = "preview-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Reconciles PreviewEnvironment records and runs the TTL cleanup
    /// scheduler in the same process.
    Controller(OperatorArgs),

    /// Delete expired environments
    Cleanup {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,

        #[command(flatten)]
        args: OperatorArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&PreviewEnvironment::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(OperatorArgs::from_env()?).await,
        Some(Commands::Cleanup { once, args }) => run_cleanup(args, once).await,
    }
}

fn init(args: &OperatorArgs) -> anyhow::Result<TelemetryGuard> {
    let guard = init_telemetry(TelemetryConfig {
        otlp_endpoint: args.otlp_endpoint.clone(),
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;
    tracing::debug!(otlp = guard.is_exporting(), "telemetry initialized");
    Ok(guard)
}

async fn run_controller(args: OperatorArgs) -> anyhow::Result<()> {
    let _telemetry = init(&args)?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let config = args.preview_config();
    tracing::info!(
        control_namespace = %config.control_namespace,
        gitops_namespace = %config.gitops_namespace,
        base_domain = %config.base_domain,
        "starting preview operator"
    );

    let scheduler = CleanupScheduler::new(
        Arc::new(ClusterClientImpl::new(client.clone())),
        config.control_namespace.clone(),
        config.cleanup_interval,
    );
    let ctx = Arc::new(Context::from_client(client.clone(), config));

    let cancel = CancellationToken::new();
    let cleanup_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    build_preview_controller(client, ctx, args.watch_options()).await;

    tracing::info!("controller stopped, shutting down cleanup scheduler");
    cancel.cancel();
    if let Err(e) = cleanup_task.await {
        tracing::warn!(error = %e, "cleanup scheduler task failed");
    }

    tracing::info!("Shutting down");
    Ok(())
}

async fn run_cleanup(args: OperatorArgs, once: bool) -> anyhow::Result<()> {
    let _telemetry = init(&args)?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let config = args.preview_config();
    let scheduler = CleanupScheduler::new(
        Arc::new(ClusterClientImpl::new(client)),
        config.control_namespace.clone(),
        config.cleanup_interval,
    );

    if once {
        let summary = scheduler
            .run_once(Utc::now())
            .await
            .map_err(|e| anyhow::anyhow!("Cleanup pass failed: {}", e))?;
        tracing::info!(
            scanned = summary.scanned,
            expired = summary.expired,
            deleted = summary.deleted,
            failed = summary.failed,
            "cleanup pass complete"
        );
        if summary.failed > 0 {
            anyhow::bail!("{} expired environments could not be deleted", summary.failed);
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for shutdown signal");
        }
        signal_cancel.cancel();
    });
    scheduler.run(cancel).await;
    Ok(())
}
