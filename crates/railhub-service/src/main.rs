//! railhub service.
//!
//! Run with: `cargo run -p railhub-service`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use railhub_core::{BleConnector, BleRadio, Fleet, RadioGate, Scanner, TokioClock};
use railhub_service::{Config, Reporter};

/// Control LEGO train and switch hubs over Bluetooth LE.
#[derive(Parser, Debug)]
#[command(name = "railhub")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover, connect and supervise hubs until interrupted (default).
    Run,

    /// List hubs advertising nearby, classified by role.
    Scan {
        /// Scan duration in seconds.
        #[arg(short, long, default_value_t = 10)]
        duration: u64,
    },

    /// Print the effective configuration as TOML.
    Config {
        /// Print the built-in defaults instead.
        #[arg(long)]
        default: bool,

        /// Also write it to the configuration path.
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&args, &config)?;

    match args.command {
        Some(Command::Scan { duration }) => scan(&config, Duration::from_secs(duration)).await,
        Some(Command::Config { default, write }) => {
            show_config(args.config, config, default, write)
        }
        Some(Command::Run) | None => run(config).await,
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.validate()?;
    Ok(config)
}

fn init_logging(args: &Args, config: &Config) -> anyhow::Result<()> {
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(&config.logging.level)
                .with_context(|| format!("invalid log level '{}'", config.logging.level))?,
        }
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if args.json || config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let radio = Arc::new(BleRadio::new().await.context("no Bluetooth adapter")?);
    let connector = Arc::new(BleConnector::new(
        Arc::clone(&radio),
        config.connection_config(),
    ));
    let fleet = Fleet::new(config.fleet_config(), radio, connector)?;

    let cancel = CancellationToken::new();
    let reporter = Reporter::new(Arc::clone(&fleet), config.monitor.report_interval());
    let reporting = reporter.start(cancel.clone());

    fleet.start().await;
    info!("railhub running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Interrupted, shutting down");

    cancel.cancel();
    for handle in reporting {
        let _ = handle.await;
    }
    fleet.shutdown().await;
    Ok(())
}

async fn scan(config: &Config, duration: Duration) -> anyhow::Result<()> {
    let radio = Arc::new(BleRadio::new().await.context("no Bluetooth adapter")?);
    let scanner = Scanner::new(
        radio,
        config.fleet_config().scan.reset_adapter_on_start(false),
        RadioGate::new(),
        Arc::new(TokioClock),
    );

    info!("Scanning for hubs ({}s)...", duration.as_secs());
    let hubs = scanner.discover_for(duration).await?;
    if hubs.is_empty() {
        println!("No hubs found");
        return Ok(());
    }
    println!("{:<8} {:<24} {:<40} {:>5}", "ROLE", "NAME", "ID", "RSSI");
    for hub in hubs {
        println!(
            "{:<8} {:<24} {:<40} {:>5}",
            hub.role.to_string(),
            hub.name.as_deref().unwrap_or("-"),
            hub.address,
            hub.rssi.map_or_else(|| "-".to_string(), |r| r.to_string()),
        );
    }
    Ok(())
}

fn show_config(
    path: Option<PathBuf>,
    config: Config,
    default: bool,
    write: bool,
) -> anyhow::Result<()> {
    let config = if default { Config::default() } else { config };
    print!("{}", toml::to_string_pretty(&config)?);
    if write {
        let path = path.unwrap_or_else(Config::default_path);
        config.save(&path)?;
        eprintln!("Wrote {}", path.display());
    }
    Ok(())
}
