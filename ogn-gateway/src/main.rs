//! ogn-basestation: OGN APRS feed to BaseStation (SBS-1) gateway.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Table};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ogn_core::config::{self, Config};
use ogn_core::{aprs, basestation, icao_to_string, AircraftRegistry, Verdict};

mod aprs_client;
mod ddb;
mod gateway;
mod sink;

use crate::aprs_client::ConnectError;
use crate::ddb::{DeviceDatabase, FileSource, HttpSource};
use crate::gateway::{Gateway, Pipeline};

#[derive(Parser)]
#[command(name = "ogn-basestation", version, about = "Forward OGN beacons as BaseStation messages")]
struct Cli {
    /// Config file (default: ~/.ogn-basestation/config.yaml)
    #[arg(long, global = true, env = "OGN_BS_CONFIG")]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the OGN feed and forward to every configured output
    Run {
        /// APRS server host
        #[arg(long, env = "OGN_APRS_HOST")]
        host: Option<String>,

        /// APRS server port
        #[arg(long, env = "OGN_APRS_PORT")]
        port: Option<u16>,

        /// APRS-IS server-side filter, e.g. "r/45.2/5.8/200"
        #[arg(long)]
        filter: Option<String>,

        /// Skip the device database (no registrations, no opt-out)
        #[arg(long)]
        no_ddb: bool,
    },

    /// Run recorded APRS lines through the pipeline and print BaseStation lines
    Replay {
        /// File with one APRS line per line ("-" for stdin)
        file: PathBuf,

        /// Device database JSON file used for enrichment
        #[arg(long)]
        ddb_file: Option<PathBuf>,

        /// Only print the aircraft summary
        #[arg(short, long)]
        quiet: bool,
    },

    /// Download the device database and show an entry
    Ddb {
        /// Device id as seen on the feed, e.g. FLRDDEEFF
        device_id: Option<String>,

        /// Read from a local JSON file instead of downloading
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn load(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => config::load_config_from(path).with_context(|| format!("reading {}", path.display())),
        None => Ok(config::load_config()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Run {
            host,
            port,
            filter,
            no_ddb,
        } => {
            let mut config = load(cli.config.as_ref())?;
            if let Some(host) = host {
                config.feed.host = host;
            }
            if let Some(port) = port {
                config.feed.port = port;
            }
            if filter.is_some() {
                config.feed.filter = filter;
            }
            if no_ddb {
                config.ddb.enabled = false;
            }
            cmd_run(config).await
        }
        Commands::Replay {
            file,
            ddb_file,
            quiet,
        } => {
            let config = load(cli.config.as_ref())?;
            cmd_replay(&config, file, ddb_file, quiet).await
        }
        Commands::Ddb { device_id, file } => {
            let config = load(cli.config.as_ref())?;
            cmd_ddb(&config, device_id.as_deref(), file).await
        }
        Commands::Init { force } => cmd_init(cli.config, force),
    }
}

async fn connect_and_run(gateway: &mut Gateway) -> Result<(), ConnectError> {
    gateway.connect().await?;
    gateway.run().await
}

async fn cmd_run(config: Config) -> Result<()> {
    if config.sinks.is_empty() {
        bail!("no outputs configured");
    }
    let mut gateway = Gateway::from_config(&config);
    info!(
        upstream = %gateway.upstream(),
        outputs = config.sinks.len(),
        ddb = config.ddb.enabled,
        "Starting ogn-basestation"
    );

    tokio::select! {
        result = connect_and_run(&mut gateway) => {
            if let Err(e) = result {
                error!(error = %e, "Upstream connection ended");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Stop ogn gateway");
        }
    }

    gateway.disconnect().await;
    Ok(())
}

async fn cmd_replay(config: &Config, file: PathBuf, ddb_file: Option<PathBuf>, quiet: bool) -> Result<()> {
    let reader: Box<dyn BufRead> = if file.to_str() == Some("-") {
        Box::new(io::stdin().lock())
    } else {
        let f = std::fs::File::open(&file).with_context(|| format!("opening {}", file.display()))?;
        Box::new(io::BufReader::new(f))
    };

    let ddb = match ddb_file {
        Some(path) => {
            let db = DeviceDatabase::new(FileSource::new(path, None), Duration::MAX);
            db.refresh().await.context("loading device database")?;
            Some(db)
        }
        None => None,
    };
    let matched = ddb.is_some();

    let registry = AircraftRegistry::new(config.tracking.sweep_interval(), config.tracking.timeout());
    let mut pipeline = Pipeline::new(registry, ddb, Vec::new());
    let mut decode_errors = 0u64;

    for line in reader.lines() {
        let Ok(line) = line else { continue };
        let raw = line.trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }
        let beacon = match aprs::parse(raw, Utc::now()) {
            Ok(b) => b,
            Err(_) => {
                decode_errors += 1;
                continue;
            }
        };
        if let Verdict::Accepted(aircraft) = pipeline.process_beacon(&beacon) {
            if !quiet {
                println!("{}", basestation::encode_now(&beacon, matched.then_some(&aircraft)));
            }
        }
    }

    let stats = pipeline.stats;
    eprintln!();
    eprintln!(
        "Beacons: {} accepted, {} rejected, {} undecodable",
        stats.accepted, stats.rejected, decode_errors
    );
    print_aircraft(&pipeline.registry());
    Ok(())
}

fn print_aircraft(registry: &AircraftRegistry) {
    if registry.is_empty() {
        return;
    }
    let mut table = Table::new();
    table.set_header(vec!["Device", "ICAO", "Registration", "CN", "Tracked", "Last seen"]);
    for ac in registry.snapshot() {
        table.add_row(vec![
            Cell::new(&ac.device_id),
            Cell::new(ac.icao.as_ref().map(icao_to_string).unwrap_or("-".into())),
            Cell::new(ac.registration.as_deref().unwrap_or("-")),
            Cell::new(ac.competition_number.as_deref().unwrap_or("-")),
            Cell::new(if ac.tracking_allowed { "Y" } else { "N" }),
            Cell::new(ac.last_seen.format("%H:%M:%S")),
        ]);
    }
    eprintln!("{table}");
}

async fn cmd_ddb(config: &Config, device_id: Option<&str>, file: Option<PathBuf>) -> Result<()> {
    let db = match file {
        Some(path) => DeviceDatabase::new(FileSource::new(path, None), Duration::MAX),
        None => {
            let mut source = HttpSource::new(&config.ddb.url);
            if let Some(url) = &config.ddb.icao_url {
                source = source.with_icao_url(url);
            } else if let Some(path) = &config.ddb.icao_path {
                source = source.with_icao_path(path);
            }
            DeviceDatabase::new(source, Duration::MAX)
        }
    };
    let count = db.refresh().await.context("loading device database")?;
    println!("Device database: {count} devices");

    let Some(device_id) = device_id else {
        return Ok(());
    };
    let snapshot = db.snapshot();
    let Some(entry) = snapshot.lookup(device_id) else {
        println!("{device_id}: not in device database");
        return Ok(());
    };

    let mut table = Table::new();
    table.set_header(vec!["Device", "Registration", "ICAO", "CN", "Tracked"]);
    table.add_row(vec![
        Cell::new(device_id),
        Cell::new(entry.registration.as_deref().unwrap_or("-")),
        Cell::new(entry.icao.as_ref().map(icao_to_string).unwrap_or("-".into())),
        Cell::new(entry.competition_number.as_deref().unwrap_or("-")),
        Cell::new(if entry.tracked { "Y" } else { "N" }),
    ]);
    println!("{table}");
    Ok(())
}

fn cmd_init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let target = path.clone().unwrap_or_else(config::config_file);
    if target.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", target.display());
    }
    let written = config::save_config(&Config::default(), path.as_deref())?;
    println!("Wrote {}", written.display());
    Ok(())
}
