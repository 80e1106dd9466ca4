//! plugfleet - Entry Point
//!
//! Checks, downloads, deploys and rolls back plugins across a fleet of game
//! servers.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use plugfleet::app::options::{AppOptions, Command};
use plugfleet::app::run::run;
use plugfleet::app::state::{load_settings, AppState};
use plugfleet::logs::{init_logging, LogLevel, LogOptions};
use plugfleet::storage::layout::StorageLayout;
use plugfleet::utils::version_info;
use plugfleet::version::UpdatePolicy;

#[derive(Parser)]
#[command(name = "plugfleet")]
#[command(author, version, about = "Safe plugin deployment across a game server fleet")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file. Defaults to settings.json in the storage directory.
    #[arg(long, global = true, env = "PLUGFLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Report what would happen without touching any server
    #[arg(long, global = true)]
    dry_run: bool,

    /// Consider pre-release candidates
    #[arg(long, global = true)]
    include_prerelease: bool,

    /// Redeploy when the upstream spelling differs from the installed one
    #[arg(long, global = true)]
    bypass_noop: bool,

    /// Limit to these plugins
    #[arg(long = "artifact", global = true)]
    artifacts: Vec<String>,

    /// Limit to these servers
    #[arg(long = "server", global = true)]
    servers: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Report available updates
    Check,

    /// Download and verify candidates into the staging area
    Download,

    /// Deploy available updates
    Deploy,

    /// Restore plugins from their backups
    Rollback,

    /// Report version drift between servers of the same platform
    Audit,

    /// Show installed versions per server
    Status,

    /// Show recent deployment records
    History {
        /// Number of records
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Print build information
    Version,
}

impl Commands {
    fn into_command(self) -> Option<Command> {
        Some(match self {
            Commands::Check => Command::Check,
            Commands::Download => Command::Download,
            Commands::Deploy => Command::Deploy,
            Commands::Rollback => Command::Rollback,
            Commands::Audit => Command::Audit,
            Commands::Status => Command::Status,
            Commands::History { limit } => Command::History { limit },
            Commands::Version => return None,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let options = AppOptions {
        layout: StorageLayout::default(),
        config: cli.config,
        artifacts: cli.artifacts,
        servers: cli.servers,
        policy: UpdatePolicy {
            include_prerelease: cli.include_prerelease,
            bypass_noop_suppression: cli.bypass_noop,
        },
        dry_run: cli.dry_run,
        json: cli.json,
        log_level: cli.log_level,
    };

    let Some(command) = cli.command.into_command() else {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(info) => println!("{}", info),
            Err(e) => eprintln!("{}", e),
        }
        return ExitCode::SUCCESS;
    };

    // Retrieve the settings file
    let settings = match load_settings(&options.settings_file()).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to load settings: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: options
            .log_level
            .clone()
            .unwrap_or_else(|| settings.log.level.clone()),
        stdout: !options.json,
        log_dir: settings.log.to_file.then(|| {
            settings
                .log
                .dir
                .clone()
                .unwrap_or_else(|| options.layout.logs_dir().path().to_path_buf())
        }),
        json_format: settings.log.json,
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        await_shutdown_signal().await;
        warn!("Finishing in-flight work before stopping");
        let _ = cancel_tx.send(true);
    });

    let app = match AppState::init(&options, settings, cancel_rx).await {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to initialize: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Running {:?}", command);
    match run(&app, &options, command).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut sigterm), Ok(mut sigint)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) else {
            error!("Failed to install signal handlers");
            return std::future::pending().await;
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            return std::future::pending().await;
        }
        info!("Ctrl+C received, shutting down...");
    }
}
