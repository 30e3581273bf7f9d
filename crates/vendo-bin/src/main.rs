//! vendod - the vendo captive-portal gateway daemon.

mod app;

use clap::{Parser, Subcommand};
use vendo_config::{init_logging, Config, Paths};

/// vendo gateway daemon command-line interface.
#[derive(Parser)]
#[command(name = "vendod")]
#[command(about = "Coin/voucher captive-portal gateway daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,
    },
    /// Stop the daemon
    Stop,
    /// Check daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = Paths::new()?;
    paths.ensure_dirs()?;
    init_logging(&cli.log_level, &paths.daemon_log_file());

    let mut config = Config::load(&paths)?;
    config.log_level = cli.log_level.clone();

    match cli.command {
        Some(Commands::Start { foreground }) => {
            app::run_daemon(config, paths, foreground).await?;
        }
        None => {
            app::run_daemon(config, paths, true).await?;
        }
        Some(Commands::Stop) => {
            app::stop_daemon(&paths).await?;
        }
        Some(Commands::Status) => {
            app::check_status(&paths).await?;
        }
    }

    Ok(())
}
