//! PhotoPlace command-line geotagger
//!
//! Loads the photos of a directory, matches them against a GPS track and
//! writes a KML document (optionally copying the photos next to it).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use photoplace_common::config::{AppConfig, LoggingConfig};
use photoplace_common::events::{CallArgs, ObserverRef};
use photoplace_engine::plugins::{builtin_modules, CapabilityFilter};
use photoplace_engine::{Processing, RunMode, Session};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for photoplace
#[derive(Parser, Debug)]
#[command(name = "photoplace")]
#[command(about = "Geotag photos from a GPS track and build a KML document")]
#[command(version)]
struct Args {
    /// Config file (overrides PHOTOPLACE_CONFIG and the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the whole pipeline
    Run(RunArgs),
    /// List the built-in plugins
    Plugins,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Directory holding the photos
    #[arg(short, long)]
    photos: Option<PathBuf>,

    /// Track file (`time,lat,lon[,ele]` lines)
    #[arg(short, long)]
    track: Option<PathBuf>,

    /// KML file to write
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Camera clock offset from UTC, in minutes
    #[arg(long, allow_hyphen_values = true)]
    utc_zone: Option<i64>,

    /// Largest accepted gap between a photo and a track point, in seconds
    #[arg(long)]
    max_delta: Option<u64>,

    /// Replace positions photos already have
    #[arg(long)]
    overwrite: bool,

    /// 0: no copies, 1: geotagged photos, 2: every photo
    #[arg(long)]
    copy_mode: Option<u8>,

    /// Print every pipeline event
    #[arg(short, long)]
    verbose: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut AppConfig) {
        let main = &mut config.main;
        if let Some(photos) = &self.photos {
            main.photo_input_dir = Some(photos.clone());
        }
        if let Some(track) = &self.track {
            main.track_file = Some(track.clone());
        }
        if let Some(output) = &self.output {
            main.output_file = Some(output.clone());
        }
        if let Some(zone) = self.utc_zone {
            main.utc_zone_minutes = zone;
        }
        if let Some(delta) = self.max_delta {
            main.max_delta_seconds = delta;
        }
        if let Some(mode) = self.copy_mode {
            main.copy_mode = mode;
        }
        main.overwrite |= self.overwrite;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Config first: it carries the default log level
    let mut config = AppConfig::resolve(args.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging)?;

    match args.command {
        Command::Plugins => {
            for module in builtin_modules() {
                let state = if config.addon_enabled(module.name()) {
                    "enabled"
                } else {
                    "disabled"
                };
                println!(
                    "{} {} ({}): {}",
                    module.info.name, module.info.version, state, module.info.description
                );
            }
            Ok(())
        }
        Command::Run(run) => {
            run.apply(&mut config);
            config.validate().context("Invalid settings")?;
            run_pipeline(config, run.verbose).await
        }
    }
}

async fn run_pipeline(config: AppConfig, verbose: bool) -> Result<()> {
    let session = Session::new(config).context("Failed to start session")?;

    if verbose {
        let printer = ObserverRef::new("printer", |delivery| {
            println!("{} {:?}", delivery.event, delivery.args);
            Ok(())
        });
        session.add_notifier(&printer, &[], CallArgs::new())?;
    }

    for (name, error) in session.load_plugins(builtin_modules()) {
        warn!("Plugin '{}' not loaded: {}", name, error);
    }
    for (name, error) in session.activate_plugins(&CapabilityFilter::Headless) {
        warn!("Plugin '{}' not activated: {}", name, error);
    }
    session.init_plugins(&CapabilityFilter::Headless, None)?;

    let loaded = session.load_photos(None)?.run(CallArgs::new())?;
    let track = session.read_track(None)?.run(CallArgs::new())?;
    info!("{} photos, {} track points", loaded.total, track.points);

    let geotagged = session.geolocate()?.run(CallArgs::new())?;
    info!("{} of {} photos geotagged", geotagged.geotagged, geotagged.total);

    let report = match session.process(RunMode::Worker)? {
        Processing::Done(report) => report,
        Processing::Pending(handle) => handle.join().await?,
    };
    info!(
        "{} placemarks, {} files written",
        report.kml.placemarks, report.saved.files
    );

    session.unload_plugins(&CapabilityFilter::Any)?;
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("Invalid log level")?;

    let file_layer = match &logging.file {
        Some(path) => Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(open_log(path)?)),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

fn open_log(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Cannot open log file {}", path.display()))
}
