use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use peerwarden_core::Gateway;
use peerwarden_core::audit::StoreAuditSink;
use peerwarden_core::config::{self, Secrets};
use peerwarden_core::db::{self, PeerStore};
use peerwarden_core::enforce::{self, local_now};
use peerwarden_core::keys::AesKeyCipher;
use peerwarden_core::live::CurrentInterface;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "Peer lifecycle and reconciliation daemon for a WireGuard gateway")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/peerwarden/gateway.toml")]
    config: PathBuf,

    /// Run one reconciliation pass and exit
    #[arg(long)]
    once: bool,
}

type SharedGateway = Arc<Gateway<CurrentInterface>>;

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM, waiting for ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

fn spawn_loops(
    tasks: &mut JoinSet<()>,
    gateway: &SharedGateway,
    shutdown: &watch::Receiver<bool>,
) {
    let config = gateway.config();

    let gw = gateway.clone();
    tasks.spawn(enforce::run_every(
        "reconcile",
        config.reconcile_cooldown(),
        shutdown.clone(),
        move || {
            let gw = gw.clone();
            async move {
                gw.reconcile_if_due().await;
            }
        },
    ));

    let gw = gateway.clone();
    tasks.spawn(enforce::run_every(
        "expiry",
        Duration::from_secs(config.expiry_interval_secs),
        shutdown.clone(),
        move || {
            let gw = gw.clone();
            async move {
                if let Err(e) = gw.expiry_pass().await {
                    error!(error = %e, reason = %e.reason(), "expiry pass failed");
                }
            }
        },
    ));

    let gw = gateway.clone();
    tasks.spawn(enforce::run_every(
        "quota",
        Duration::from_secs(config.quota_interval_secs),
        shutdown.clone(),
        move || {
            let gw = gw.clone();
            async move {
                if let Err(e) = gw.quota_pass().await {
                    error!(error = %e, reason = %e.reason(), "quota pass failed");
                }
            }
        },
    ));

    let gw = gateway.clone();
    tasks.spawn(enforce::run_every(
        "schedule",
        Duration::from_secs(config.schedule_interval_secs),
        shutdown.clone(),
        move || {
            let gw = gw.clone();
            async move {
                if let Err(e) = gw.schedule_pass(local_now()).await {
                    error!(error = %e, reason = %e.reason(), "schedule pass failed");
                }
            }
        },
    ));
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    info!(config = %args.config.display(), version = env!("GIT_VERSION"), "starting peerwarden-daemon");

    let config = config::load(&args.config).await?;
    let secrets = Secrets::from_env()?;
    let database_url = secrets
        .database_url
        .clone()
        .unwrap_or_else(|| config.database_url.clone());

    let pool = db::create_pool(&database_url).await?;
    db::migrate(&pool).await?;
    info!("database migrations applied");

    let store = PeerStore::new(pool);
    let live = CurrentInterface::new(&config.interface, config.live_timeout());
    let gateway: SharedGateway = Arc::new(Gateway::new(
        config,
        store.clone(),
        Arc::new(AesKeyCipher::new(secrets.key_secret)),
        live,
        Arc::new(StoreAuditSink::new(store)),
    ));

    gateway.bootstrap_interface().await?;
    let report = gateway.reconcile_now().await?;
    info!(mutations = report.mutations(), "startup reconciliation complete");

    if args.once {
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    spawn_loops(&mut tasks, &gateway, &shutdown_rx);

    shutdown_signal().await;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "background task ended abnormally");
        }
    }
    info!("stopped");
    Ok(())
}
