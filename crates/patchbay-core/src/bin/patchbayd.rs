//! `patchbayd` - the media graph daemon entry point (§6).
//!
//! Loads config, sets up structured logging, and runs the C9 accept
//! loop until SIGINT/SIGTERM. Exit code 0 on clean shutdown, non-zero
//! on startup failure (socket bind, config parse, missing runtime dir).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use patchbay_conf::PatchbayConfig;
use patchbay_core::scheduler::run_graph_driver;
use patchbay_core::session::{serve, SessionState};

#[derive(Parser, Debug)]
#[command(name = "patchbayd", version, about = "Realtime media-graph daemon")]
struct Cli {
    /// Path to a config file; overrides the default search path.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease log verbosity; suppresses info-level output.
    #[arg(short, long)]
    quiet: bool,
}

fn init_tracing(config: &PatchbayConfig, cli: &Cli) {
    let default_directive = if cli.quiet {
        "warn".to_string()
    } else if cli.verbose > 0 {
        "debug".to_string()
    } else if std::env::var("DEBUG").is_ok() {
        "debug".to_string()
    } else {
        config.infra.telemetry.log_level.clone()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    let cli = Cli::parse();

    let config = match PatchbayConfig::load_from(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("patchbayd: config error: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config, &cli);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("patchbayd: failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(run(config));
    std::process::exit(exit_code);
}

async fn run(config: PatchbayConfig) -> i32 {
    let state = Arc::new(Mutex::new(SessionState::default()));

    info!(socket = %config.infra.paths.socket_path().display(), "starting patchbayd");

    tokio::spawn(run_graph_driver(state.clone()));

    tokio::select! {
        result = serve(config, state) => {
            if let Err(e) = result {
                error!(error = %e, "accept loop failed");
                return 1;
            }
            0
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
            0
        }
        _ = terminate() => {
            info!("received SIGTERM, shutting down");
            0
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    term.recv().await;
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await
}
