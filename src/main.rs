mod backends;
mod config;
mod enforcement;
mod error;
mod evaluator;
mod identity;
mod metrics;
mod policy;
mod reconcile;
mod requests;
mod state;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backends::runner::{CommandRunner, ContainerRunner};
use crate::backends::{detect_backends, select_backend};
use crate::config::Settings;
use crate::enforcement::EnforcementController;
use crate::identity::IdentityResolver;
use crate::metrics::MetricsClient;
use crate::policy::PolicyStore;
use crate::reconcile::ReconciliationLoop;
use crate::requests::RequestQueue;
use crate::state::{JsonStateStore, MemoryStateStore, StateStore};

/// wg-quota - enforce traffic quotas on a WireGuard gateway
#[derive(Parser, Debug)]
#[command(name = "wg-quota")]
#[command(version)]
#[command(about = "Blocks WireGuard clients that exceed their traffic quota", long_about = None)]
struct Args {
    /// Quota policy file (JSON keyed by client id)
    #[arg(long, env = "WGQ_POLICY_PATH", default_value = config::DEFAULT_POLICY_PATH)]
    policy_path: PathBuf,

    /// WireGuard peer configuration with named peer blocks
    #[arg(long, env = "WGQ_PEER_CONFIG_PATH", default_value = config::DEFAULT_PEER_CONFIG_PATH)]
    peer_config_path: PathBuf,

    /// Prometheus instant-query endpoint
    #[arg(long, env = "WGQ_METRICS_ENDPOINT", default_value = config::DEFAULT_METRICS_ENDPOINT)]
    metrics_endpoint: String,

    /// Container to run firewall commands in (empty = run on the host)
    #[arg(long, env = "WGQ_ENFORCEMENT_TARGET", default_value = config::DEFAULT_ENFORCEMENT_TARGET)]
    enforcement_target: String,

    #[arg(long, env = "WGQ_POLL_INTERVAL_SECONDS", default_value_t = 30)]
    poll_interval_seconds: u64,

    #[arg(long, env = "WGQ_METRICS_TIMEOUT_SECONDS", default_value_t = 10)]
    metrics_timeout_seconds: u64,

    #[arg(long, env = "WGQ_COMMAND_TIMEOUT_SECONDS", default_value_t = 10)]
    command_timeout_seconds: u64,

    /// Evaluate usage as of this many seconds ago (0 = latest sample)
    #[arg(long, env = "WGQ_QUERY_OFFSET_SECONDS", default_value_t = 0)]
    query_offset_seconds: u64,

    /// Enforcement backend to use (default: best available)
    #[arg(long, env = "WGQ_BACKEND", value_name = "BACKEND")]
    backend: Option<String>,

    /// Interface that carries client traffic, used for shaping
    #[arg(long, env = "WGQ_SHAPING_INTERFACE", default_value = "wg0")]
    shaping_interface: String,

    /// Persist enforcement state to this file (default: memory only)
    #[arg(long, env = "WGQ_STATE_PATH")]
    state_path: Option<PathBuf>,

    /// Directory the running loop picks release requests up from
    #[arg(long, env = "WGQ_REQUEST_DIR", default_value = config::DEFAULT_REQUEST_DIR)]
    request_dir: PathBuf,

    /// Run a single pass and exit
    #[arg(long)]
    once: bool,

    /// List all available backends and exit
    #[arg(long)]
    list_backends: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue removal of any block or shaping applied to a client
    Release {
        /// Tunnel address, or a client name from the peer configuration
        target: String,
    },
}

impl Args {
    fn settings(&self) -> Settings {
        let offset = Duration::from_secs(self.query_offset_seconds);
        Settings {
            policy_path: self.policy_path.clone(),
            peer_config_path: self.peer_config_path.clone(),
            metrics_endpoint: self.metrics_endpoint.clone(),
            enforcement_target: config::non_empty(Some(self.enforcement_target.clone())),
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            metrics_timeout: Duration::from_secs(self.metrics_timeout_seconds),
            command_timeout: Duration::from_secs(self.command_timeout_seconds),
            query_offset: (!offset.is_zero()).then_some(offset),
            backend: config::non_empty(self.backend.clone()),
            shaping_interface: self.shaping_interface.clone(),
            state_path: self.state_path.clone(),
            request_dir: self.request_dir.clone(),
        }
    }
}

async fn print_available_backends(runner: &dyn CommandRunner) {
    println!("wg-quota - Enforcement backends on {}\n", runner.target());

    for backend in detect_backends(runner).await {
        let status = if backend.available {
            "available"
        } else {
            "unavailable"
        };
        println!(
            "  {:20} [priority: {:?}] {}",
            backend.name, backend.priority, status
        );
    }

    #[cfg(not(feature = "throttle-tc-htb"))]
    println!("\n  (speed limits need a build with --features throttle-tc-htb)");
}

fn open_state_store(settings: &Settings) -> Result<Box<dyn StateStore>> {
    match &settings.state_path {
        Some(path) => {
            let store = JsonStateStore::open(path)
                .with_context(|| format!("Failed to open state file {:?}", path))?;
            Ok(Box::new(store))
        }
        None => Ok(Box::new(MemoryStateStore::new())),
    }
}

/// Cancel `token` on SIGINT or SIGTERM
async fn wait_for_shutdown(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT"),
                    _ = terminate.recv() => log::info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                log::info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("Received Ctrl+C");
    }

    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    pretty_env_logger::formatted_timed_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let settings = args.settings();
    settings.validate().context("Invalid configuration")?;

    let runner: Arc<dyn CommandRunner> = Arc::new(ContainerRunner::new(
        settings.enforcement_target.clone(),
        settings.command_timeout,
    ));

    if args.list_backends {
        print_available_backends(runner.as_ref()).await;
        return Ok(());
    }

    let resolver = IdentityResolver::new(&settings.peer_config_path);

    // The running loop owns enforcement state; the CLI only queues
    if let Some(Command::Release { target }) = &args.command {
        if target.parse::<IpAddr>().is_err() {
            match resolver.resolve(target).await {
                Ok(identity) => println!("'{}' is currently {}", target, identity.address),
                Err(e) => log::warn!("{}; queueing by name anyway", e),
            }
        }

        let queue = RequestQueue::new(&settings.request_dir);
        let path = queue
            .submit(target)
            .with_context(|| format!("Failed to queue release of '{}'", target))?;
        println!("Queued release of '{}' as {:?}", target, path);
        println!("It is applied at the start of the next pass");
        return Ok(());
    }

    let backend = select_backend(
        settings.backend.as_deref(),
        runner.clone(),
        &settings.shaping_interface,
    )
    .await
    .context("Failed to set up enforcement backend")?;
    backend
        .check_ready()
        .await
        .with_context(|| format!("Enforcement target {} is not usable", runner.target()))?;

    let store = open_state_store(&settings)?;
    let controller = EnforcementController::new(backend, store);

    let peers = resolver
        .snapshot()
        .await
        .context("Peer configuration unavailable")?;
    log::info!(
        "Peer configuration {:?} lists {} named peer(s)",
        resolver.path(),
        peers.names().len()
    );

    let metrics = MetricsClient::new(&settings.metrics_endpoint, settings.metrics_timeout)
        .context("Failed to create metrics client")?;
    log::info!("Reading usage from {}", metrics.endpoint());

    let policies = PolicyStore::new(&settings.policy_path);
    log::info!("Enforcing policies from {:?}", policies.path());

    let requests = RequestQueue::new(&settings.request_dir);
    log::info!("Accepting release requests in {:?}", requests.dir());

    let mut reconciler = ReconciliationLoop::new(policies, resolver, Arc::new(metrics), controller)
        .with_window(settings.query_offset)
        .with_requests(requests);

    if args.once {
        reconciler.run_pass().await;
        return Ok(());
    }

    let cancel = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(cancel.clone()));

    reconciler.run(settings.poll_interval, cancel).await;
    log::info!("Stopped after {} pass(es)", reconciler.passes());

    Ok(())
}
