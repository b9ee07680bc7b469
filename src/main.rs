//! Beacon positioning engine driver
//!
//! Reads detection events as JSON lines on stdin, prints PositionUpdates on
//! stdout and logs to stderr.

use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use beacon_positioning::api::{Engine, JsonFormatter, OutputFormat, PositionFormatter};
use beacon_positioning::core::{PositionUpdate, RawDetection};
use beacon_positioning::utils::{EngineConfig, FacilityLayout, SystemClock};

#[derive(Parser, Debug)]
#[command(name = "beacon-positioning", version, about = "Track and zone-classify anonymized beacons")]
struct Cli {
    /// Engine configuration file (JSON); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Facility layout file (JSON); overrides `layout_file` in the config
    #[arg(short, long)]
    layout: Option<PathBuf>,

    /// Output format for position updates: json, csv or text
    #[arg(short, long, default_value = "json")]
    format: OutputFormat,

    /// Print the anonymized export of all tracked devices on exit
    #[arg(long)]
    export_on_exit: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let Some(layout_path) = cli.layout.clone().or_else(|| config.layout_file.clone()) else {
        bail!("no facility layout given; pass --layout or set layout_file in the config");
    };
    let layout = FacilityLayout::from_file(&layout_path)
        .with_context(|| format!("loading facility layout {}", layout_path.display()))?;

    let engine = Engine::start(config, &layout, Arc::new(SystemClock))?;
    let printer = tokio::spawn(print_updates(engine.subscribe(), PositionFormatter::new(cli.format)));

    let feed = engine.feed();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupt received, shutting down");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading detection feed")? else {
                    info!("end of detection feed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RawDetection>(&line) {
                    Ok(detection) => {
                        if feed.send(detection).await.is_err() {
                            warn!("engine stopped accepting detections");
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "skipping malformed detection"),
                }
            }
        }
    }

    drop(feed);
    let export = engine.shutdown().await?;
    printer.await.context("update printer")?;

    if cli.export_on_exit {
        println!("{}", JsonFormatter::pretty().format_export(&export)?);
    }
    Ok(())
}

async fn print_updates(mut updates: broadcast::Receiver<PositionUpdate>, formatter: PositionFormatter) {
    if let Some(header) = formatter.header() {
        println!("{header}");
    }
    loop {
        match updates.recv().await {
            Ok(update) => match formatter.render(&update) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!(error = %err, "could not format update"),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "output fell behind, updates dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
