// hawkBit update agent for Linux: poll, download, verify, install via rauc, report.

mod agent;
mod client;
mod config;
mod download;
mod identity;
mod install;
mod supervisor;
mod transport;

#[cfg(test)]
mod testutil;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::agent::{Agent, Outcome};
use crate::client::DdiClient;
use crate::config::{Config, ConfigError, DEFAULT_CONFIG_PATH};
use crate::install::CommandInstaller;
use crate::supervisor::{NoSupervisor, Supervisor, SystemdNotify};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const EXIT_OPTIONS: u8 = 1;
const EXIT_NO_CONFIG: u8 = 3;
const EXIT_CONFIG: u8 = 4;
const EXIT_IDENTITY: u8 = 5;
const EXIT_FATAL: u8 = 6;

#[derive(Parser, Debug)]
#[command(
    name = "hawkbit-updater",
    about = "hawkBit DDI update agent",
    disable_version_flag = true
)]
struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "config-file", value_name = "FILE")]
    config_file: Option<PathBuf>,
    /// Version information
    #[arg(short = 'v', long = "version")]
    version: bool,
    /// Enable debug output
    #[arg(short = 'd', long = "debug")]
    debug: bool,
    /// Check and install new software and exit
    #[arg(short = 'r', long = "run-once")]
    run_once: bool,
    /// Log for the systemd journal (no timestamps)
    #[arg(short = 's', long = "output-systemd")]
    output_systemd: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_OPTIONS } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };
    if cli.version {
        println!("hawkbit-updater {}", VERSION);
        return ExitCode::SUCCESS;
    }

    let path = cli
        .config_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = match Config::load(&path) {
        Ok(c) => c,
        Err(e @ ConfigError::NotFound(_)) => {
            eprintln!("{}", e);
            return ExitCode::from(EXIT_NO_CONFIG);
        }
        Err(e) => {
            eprintln!("Loading config file failed: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    init_logging(&config, &cli);

    let controller = match identity::controller_id(&config) {
        Ok(id) => id,
        Err(e) => {
            error!("device identity unavailable: {}", e);
            return ExitCode::from(EXIT_IDENTITY);
        }
    };

    match run(config, &controller, cli.run_once) {
        Ok(Outcome::Fatal(reason)) => {
            error!("fatal: {}", reason);
            ExitCode::from(EXIT_FATAL)
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn init_logging(config: &Config, cli: &Cli) {
    let level = if cli.debug {
        "debug"
    } else {
        config.client.log_level.directive()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if cli.output_systemd {
        builder.without_time().with_ansi(false).init();
    } else {
        builder.init();
    }
}

fn run(config: Config, controller: &str, run_once: bool) -> anyhow::Result<Outcome> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    rt.block_on(async {
        let client =
            DdiClient::from_config(&config, controller).context("creating HTTP client")?;
        info!(
            server = client.endpoint().base(),
            controller,
            version = VERSION,
            "hawkbit-updater starting"
        );
        let installer = Arc::new(CommandInstaller::new(config.client.installer.clone()));
        let supervisor: Box<dyn Supervisor> = match SystemdNotify::from_env() {
            Some(s) => Box::new(s),
            None => Box::new(NoSupervisor),
        };
        let (force_tx, force_rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_force_check(force_tx));
        let agent = Agent::new(config, client, installer, supervisor, run_once);
        Ok::<_, anyhow::Error>(agent.run(force_rx, shutdown_signal()).await)
    })
}

/// SIGUSR1 requests an immediate check.
async fn forward_force_check(tx: mpsc::UnboundedSender<()>) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut usr1 = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot install SIGUSR1 handler: {}", e);
            return;
        }
    };
    while usr1.recv().await.is_some() {
        if tx.send(()).is_err() {
            break;
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!("cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
