#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use decoy_config::{ConfigPaths, RouterConfig, load_router_config};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use utils::resolve_config_path;

mod replay;
mod router;

use replay::replay;
use router::Router;

#[derive(Parser)]
#[command(name = "decoyd")]
#[command(version, about = "Decoy routing sentinel detector")]
struct Cli {
    /// Router config file (default: $DECOY_CONFIG_ROOT/router.yaml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the config and list the detectors it defines
    CheckConfig,
    /// Run a text trace through the router
    Replay {
        /// Trace of `net <hex>`, `ctl <hex>` and `tick <secs>` lines
        trace: PathBuf,
        /// Write outputs here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print each detector's flow table when done
        #[arg(long)]
        dump_flows: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::CheckConfig => {
            print_detectors(&config);
            Ok(())
        }
        Command::Replay {
            trace,
            output,
            dump_flows,
        } => cmd_replay(&config, trace, output, dump_flows),
    }
}

fn load_config(path: Option<&str>) -> Result<RouterConfig> {
    let paths = ConfigPaths::from_env();
    let path = path
        .map(resolve_config_path)
        .unwrap_or_else(|| paths.router.clone());
    load_router_config(&path, &paths).with_context(|| format!("load {}", path.display()))
}

fn print_detectors(config: &RouterConfig) {
    for detector in &config.detectors {
        println!(
            "{:<6} port {:<5} sentinel-length {:<2} literal {:<5} mirror {}",
            detector.kind.as_str(),
            detector.port(),
            detector.sentinel_length,
            detector.sentinel.is_some(),
            detector.mirror_reverse,
        );
    }
    match &config.notification {
        Some(n) => println!("notifications: port {} from {}", n.port, n.local_addr),
        None => println!("notifications: off"),
    }
    match &config.encoder {
        Some(e) => println!("encoder: heartbeat {}s", e.heartbeat_secs),
        None => println!("encoder: none (redirected traffic is dropped)"),
    }
}

fn cmd_replay(
    config: &RouterConfig,
    trace: PathBuf,
    output: Option<PathBuf>,
    dump_flows: bool,
) -> Result<()> {
    let input = File::open(&trace).with_context(|| format!("open trace {}", trace.display()))?;
    let mut writer: Box<dyn Write> = match &output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(std::io::stdout())),
    };

    let mut router = Router::from_config(config);
    let summary = replay(&mut router, BufReader::new(input), &mut writer, Instant::now())?;
    writer.flush()?;
    info!(
        packets = summary.packets,
        chunks = summary.chunks,
        ticks = summary.ticks,
        network_out = summary.network_out,
        control_out = summary.control_out,
        "replay finished"
    );

    if dump_flows {
        for detector in router.registry().detectors() {
            let stats = detector.stats();
            eprintln!(
                "{} port {}: packets {} flows {} redirected {} rejected {} evicted {}",
                detector.kind().as_str(),
                detector.port(),
                stats.packets,
                stats.new_flows,
                stats.redirected,
                stats.rejected,
                stats.evicted,
            );
            for flow in detector.snapshot() {
                eprintln!(
                    "  {} {} active={} buffered={}",
                    flow.key,
                    flow.state.as_str(),
                    flow.active,
                    flow.buffered_bytes
                );
            }
        }
    }
    Ok(())
}
