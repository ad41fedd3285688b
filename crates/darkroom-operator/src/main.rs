//! Darkroom Operator - runs Darkroom image proxies on Kubernetes

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use kube::Client;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use darkroom_api::{router, AppState, KubeStore, Manager, ManagerConfig, ReflectorCache, VersionInfo};
use darkroom_common::leader_election::LeaderElector;
use darkroom_common::LEADER_ELECTION_ID;
use darkroom_operator::controller_runner::build_darkroom_controller;
use darkroom_operator::health::{serve_probes, Readiness, DEFAULT_PROBE_ADDR};
use darkroom_operator::startup::{crd_yaml, ensure_crds_installed, registry};
use darkroom_operator::webhook::{serve_webhooks, DEFAULT_CERT_DIR, DEFAULT_WEBHOOK_PORT};

/// Darkroom - Kubernetes operator for Darkroom image proxies
#[derive(Parser, Debug)]
#[command(name = "darkroom-operator", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller and admission webhooks
    Controller(ControllerArgs),
    /// Run the REST API server
    ApiServer(ApiServerArgs),
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Only reconcile while holding the leader lease
    #[arg(long)]
    leader_elect: bool,

    /// Address serving /healthz and /readyz
    #[arg(long, default_value = DEFAULT_PROBE_ADDR)]
    health_probe_bind_address: SocketAddr,

    /// Port of the admission webhook server
    #[arg(long, default_value_t = DEFAULT_WEBHOOK_PORT)]
    webhook_port: u16,

    /// Directory containing tls.crt and tls.key for the webhook server
    #[arg(long, default_value = DEFAULT_CERT_DIR)]
    webhook_cert_dir: PathBuf,

    /// Namespace holding the leader lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    namespace: String,
}

#[derive(Args, Debug)]
struct ApiServerArgs {
    /// Port to serve on
    #[arg(long, default_value_t = darkroom_api::DEFAULT_PORT)]
    port: u16,

    /// Origin allowed to make cross-origin requests (repeatable)
    #[arg(long)]
    allowed_origin: Vec<String>,

    /// Only cache Darkrooms from this namespace
    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install the rustls crypto provider");
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_yaml(&registry())?);
        return Ok(());
    }

    let shutdown = shutdown_on_signal();
    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args, shutdown).await,
        Some(Commands::ApiServer(args)) => run_api_server(args, shutdown).await,
        None => anyhow::bail!("no command given, expected `controller` or `api-server`"),
    }
}

/// Token cancelled on SIGINT or SIGTERM
fn shutdown_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received");
        cancel.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM, only SIGINT stops the process");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn flatten(joined: Result<anyhow::Result<()>, JoinError>) -> anyhow::Result<()> {
    joined.map_err(|e| anyhow::anyhow!("task failed: {}", e))?
}

/// Run the Darkroom controller
///
/// Probes and webhooks serve from the start; reconciling only begins once
/// leadership is held (when `--leader-elect` is set).
async fn run_controller(args: ControllerArgs, shutdown: CancellationToken) -> anyhow::Result<()> {
    tracing::info!("Darkroom controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client, &registry()).await?;

    let readiness = Readiness::default();
    let mut probes = tokio::spawn(serve_probes(
        args.health_probe_bind_address,
        readiness.clone(),
        shutdown.clone(),
    ));
    let webhook_addr = SocketAddr::from(([0, 0, 0, 0], args.webhook_port));
    let mut webhooks = tokio::spawn({
        let cert_dir = args.webhook_cert_dir.clone();
        let shutdown = shutdown.clone();
        async move { serve_webhooks(webhook_addr, &cert_dir, shutdown).await }
    });

    let mut guard = if args.leader_elect {
        let identity = std::env::var("HOSTNAME")
            .unwrap_or_else(|_| format!("darkroom-{}", std::process::id()));
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            LEADER_ELECTION_ID,
            &args.namespace,
            &identity,
        ));
        tokio::select! {
            guard = elector.acquire() => Some(guard),
            _ = shutdown.cancelled() => return Ok(()),
            result = &mut webhooks => return flatten(result),
        }
    } else {
        None
    };

    readiness.set_ready();
    let controller = build_darkroom_controller(client, shutdown.clone());
    let leadership_lost = async {
        match guard.as_mut() {
            Some(guard) => guard.lost().await,
            None => std::future::pending().await,
        }
    };

    let outcome = tokio::select! {
        _ = controller => Ok(()),
        result = &mut webhooks => flatten(result),
        result = &mut probes => flatten(result),
        _ = leadership_lost => Err(anyhow::anyhow!("leadership lost")),
    };
    shutdown.cancel();

    if outcome.is_ok() {
        if let Some(guard) = guard {
            guard.release().await;
        }
    }
    tracing::info!("Darkroom controller stopped");
    outcome
}

/// Run the REST API server behind its watch cache
async fn run_api_server(args: ApiServerArgs, shutdown: CancellationToken) -> anyhow::Result<()> {
    tracing::info!(port = args.port, "Darkroom API server starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let cache = Arc::new(ReflectorCache::new(client.clone(), args.namespace.as_deref()));
    let state = AppState {
        store: Arc::new(KubeStore::new(client, cache.reader())),
        version: VersionInfo::current(),
    };
    let config = ManagerConfig {
        addr: SocketAddr::from(([0, 0, 0, 0], args.port)),
        ..Default::default()
    };

    let manager = Manager::new(cache, router(state, &args.allowed_origin), config);
    manager.start(shutdown).await?;
    Ok(())
}
