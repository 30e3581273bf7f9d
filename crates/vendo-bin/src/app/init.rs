//! Daemon initialization: singleton enforcement, collaborator wiring, and
//! the background reconciliation loops.

use std::sync::Arc;
use tokio::net::UnixListener;
use tracing::{info, warn};
use vendo_config::{Config, Paths};
use vendo_core::{spawn_coin_deadline_poller, spawn_idle_monitor, spawn_ticker, Engine};
use vendo_database::SessionStore;
use vendo_lifecycle::DaemonInfo;
use vendo_policy::{ShellPacketPolicy, ShellPolicyConfig};

/// Run the daemon until interrupted.
pub async fn run_daemon(
    config: Config,
    paths: Paths,
    _foreground: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    paths.ensure_dirs()?;

    let mut info = DaemonInfo::from_paths(&paths);
    let pid = match info.acquire() {
        Ok(pid) => pid,
        Err(err) => {
            eprintln!("Error: vendod is already running against this state directory ({err})");
            std::process::exit(1);
        }
    };
    info!(pid, base_dir = %paths.base_dir().display(), "vendod starting");

    // The control socket doubles as the daemon's liveness probe: `stop` and
    // `status` only need to know a connection succeeds, so the listener
    // accepts and drops every connection without speaking a protocol.
    let listener = UnixListener::bind(paths.socket_file())?;
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((_stream, _addr)) => {}
                Err(err) => {
                    warn!(error = %err, "control socket accept failed");
                    break;
                }
            }
        }
    });

    let store = SessionStore::open(&paths.database_file()).await?;
    let policy = ShellPacketPolicy::new(ShellPolicyConfig::new(
        config.enforcement_binary.clone(),
        config.probe_deadline_ms,
        config.rewrite_deadline_ms,
    ));

    let engine = Arc::new(Engine::bootstrap(&config, store, Box::new(policy)).await?);

    let ticker = spawn_ticker(Arc::clone(&engine));
    let idle_monitor = spawn_idle_monitor(Arc::clone(&engine));
    let deadline_poller = spawn_coin_deadline_poller(Arc::clone(&engine));

    info!("vendod ready");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping background loops");

    ticker.abort();
    idle_monitor.abort();
    deadline_poller.abort();
    info.cleanup()?;

    Ok(())
}
