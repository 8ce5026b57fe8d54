use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use httptap::assembly::Assembler;
use httptap::capture::{self, PortScope};
use httptap::config::Config;
use httptap::driver::{Driver, DriverConfig, interrupt_from};
use httptap::launch::launch;
use httptap::storage::EventRecorder;
use httptap::tracker::StreamRegistry;

/// Passively reassembles HTTP/1.x traffic and reports every request and
/// response seen.
#[derive(Debug, Parser)]
#[command(name = "httptap", version)]
struct Cli {
    /// Interface to capture from
    #[arg(long)]
    iface: Option<String>,

    /// Replay a pcap file instead of capturing live
    #[arg(long)]
    infile: Option<PathBuf>,

    /// Command to run while capturing; the capture drains once it exits
    #[arg(short = 'e', long = "exec")]
    command: Option<String>,

    /// YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write every storage event to this file as JSON lines
    #[arg(long)]
    events: Option<PathBuf>,

    /// TCP port to observe; may be repeated
    #[arg(long = "port")]
    ports: Vec<u16>,

    /// Log every packet and stream event
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "trace" } else { "info" };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let mut cfg = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load(),
    };
    if let Some(iface) = cli.iface {
        cfg.capture.interface = iface;
    }
    if let Some(infile) = cli.infile {
        cfg.capture.input_file = Some(infile);
    }
    if let Some(events) = cli.events {
        cfg.storage.events_path = Some(events);
    }
    if !cli.ports.is_empty() {
        cfg.scope.ports = cli.ports;
    }
    cfg.log_packets |= cli.verbose;
    cfg.resolve();
    cfg.validate()?;

    let recorder = Arc::new(
        EventRecorder::open(cfg.storage.events_path.as_deref())
            .await
            .context("opening storage")?,
    );
    let registry = Arc::new(StreamRegistry::new(recorder.clone(), cfg.queue_capacity));
    let assembler = Assembler::new(registry.clone());

    let packets = capture::open(&cfg.capture).context("opening capture source")?;
    let command = cli.command.as_deref().map(launch).transpose()?;

    let mut driver = Driver::new(
        DriverConfig::from(&cfg),
        Box::new(PortScope::new(cfg.scope.ports.clone())),
        registry,
        assembler,
    );

    let summary = driver
        .run(packets, command, interrupt_from(tokio::signal::ctrl_c()))
        .await?;
    tracing::info!(
        packets = summary.packets,
        in_scope = summary.in_scope,
        streams = summary.streams_opened,
        "capture finished"
    );

    let report = driver.report(&recorder).await?;
    print!("{report}");

    Ok(())
}
