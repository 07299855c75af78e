//! # Aerolink Ground Station
//!
//! Receives the vehicle's FEC-coded video over one or more radio
//! interfaces (UDP sockets standing in for the radio NICs), recovers it
//! with FEC and selective retransmission, steers video quality and
//! keyframe interval, and writes the recovered stream out.
//!
//! ## Usage
//!
//! ```bash
//! # Interfaces and links from a config file, video to a file
//! aerolink-station --config station.toml --output capture.h264
//!
//! # Demo against the built-in vehicle simulator with 5% loss
//! aerolink-station --simulate 5 --metrics-port 9100
//! ```

use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use anyhow::Context;
use bytes::Bytes;

use aerolink_station::config::StationConfig;
use aerolink_station::metrics::MetricsServer;
use aerolink_station::net::interface::{InterfaceConfig, RadioInterface, RadioTx};
use aerolink_station::net::selector::LinkSelector;
use aerolink_station::net::transport::{RadioFrame, UdpRadio, spawn_reader};
use aerolink_station::runtime::StationLoop;
use aerolink_station::sim::{SimConfig, SimStats, SimUplink, VehicleSim, spawn_simulator};
use aerolink_station::sink::OutputSink;

/// Radio input backlog between reader threads and the station loop.
const FRAME_CHANNEL_CAPACITY: usize = 4096;

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => StationConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StationConfig::default(),
    };

    tracing::info!(
        config = ?args.config,
        interfaces = config.interfaces.len(),
        links = config.links.len(),
        output = ?args.output,
        metrics_port = ?args.metrics_port,
        simulate = ?args.simulate_loss,
        "aerolink-station starting"
    );

    // ── Graceful shutdown ───────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            shutdown.store(true, Ordering::Relaxed);
        })?;
    }

    // ── Radio interfaces ────────────────────────────────────────
    let (frames_tx, frames_rx) = crossbeam_channel::bounded::<RadioFrame>(FRAME_CHANNEL_CAPACITY);
    let mut readers: Vec<JoinHandle<()>> = Vec::new();
    let mut simulator: Option<JoinHandle<SimStats>> = None;
    let mut interfaces = Vec::new();

    if let Some(loss_pct) = args.simulate_loss {
        let (uplink_tx, uplink_rx) = crossbeam_channel::bounded::<Bytes>(1024);
        let link = config.links.first().map_or(0, |l| l.id);
        interfaces.push(RadioInterface::new(
            InterfaceConfig::wifi("sim", link),
            Some(Box::new(SimUplink::new(uplink_tx))),
        ));
        let sim = VehicleSim::new(SimConfig {
            seed: args.seed,
            loss: (loss_pct / 100.0).clamp(0.0, 1.0),
            ..SimConfig::default()
        });
        simulator = Some(spawn_simulator(
            sim,
            0,
            frames_tx.clone(),
            uplink_rx,
            shutdown.clone(),
        )?);
        tracing::info!(loss_pct, seed = args.seed, "vehicle simulator running");
    } else {
        for (index, spec) in config.interfaces.iter().enumerate() {
            let name = spec.config.name.as_str();
            let (tx, rx_socket): (Option<Box<dyn RadioTx>>, Option<UdpSocket>) =
                match (spec.bind, spec.peer) {
                    (Some(bind), Some(peer)) => {
                        let radio = UdpRadio::open(name, bind, peer)?;
                        let socket = radio.try_clone_socket()?;
                        let tx: Box<dyn RadioTx> = Box::new(radio);
                        (Some(tx), Some(socket))
                    }
                    (Some(bind), None) => {
                        let socket = UdpSocket::bind(bind)
                            .with_context(|| format!("binding {name} to {bind}"))?;
                        (None, Some(socket))
                    }
                    _ => {
                        tracing::warn!(interface = name, "no bind address, interface unused");
                        (None, None)
                    }
                };
            if let Some(socket) = rx_socket {
                readers.push(spawn_reader(
                    index,
                    name,
                    socket,
                    frames_tx.clone(),
                    shutdown.clone(),
                )?);
            }
            tracing::info!(
                interface = name,
                bind = ?spec.bind,
                peer = ?spec.peer,
                capabilities = ?spec.config.capabilities.names(),
                "radio interface ready"
            );
            interfaces.push(RadioInterface::new(spec.config.clone(), tx));
        }
        if readers.is_empty() {
            anyhow::bail!(
                "no radio interface can receive. Configure [[interfaces]] with a bind address or use --simulate.\nRun with --help for usage."
            );
        }
    }
    drop(frames_tx);

    // ── Output sink ─────────────────────────────────────────────
    let sink = match &args.output {
        Some(target) => OutputSink::open(target)?,
        None => OutputSink::null(),
    };

    // ── Station loop ────────────────────────────────────────────
    let selector = LinkSelector::new(config.links.clone(), interfaces);
    let mut station = StationLoop::new(&config, selector, sink).with_frames(frames_rx);

    // ── Metrics server (optional) ───────────────────────────────
    let metrics_bind: Option<SocketAddr> = args
        .metrics_port
        .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
        .or(config.telemetry.metrics_bind);
    let mut metrics = match metrics_bind {
        Some(addr) => Some(MetricsServer::start(addr, station.snapshots())?),
        None => None,
    };

    station.run(&shutdown);

    // ── Cleanup ─────────────────────────────────────────────────
    shutdown.store(true, Ordering::Relaxed);
    if let Some(server) = metrics.as_mut() {
        server.stop();
    }
    for reader in readers {
        let _ = reader.join();
    }
    if let Some(sim) = simulator
        && let Ok(stats) = sim.join()
    {
        tracing::info!(
            blocks = stats.blocks,
            dropped = stats.packets_dropped,
            requests = stats.requests_received,
            retransmitted = stats.retransmissions_sent,
            "vehicle simulator summary"
        );
    }
    station.sink_mut().flush();
    let st = station.pipeline().stats();
    tracing::info!(
        clean = st.blocks_clean,
        reconstructed = st.blocks_reconstructed,
        bad = st.blocks_bad,
        forwarded = st.forwarded_packets,
        "aerolink-station stopped"
    );

    Ok(())
}

// ─── CLI Parsing ────────────────────────────────────────────────────────────

struct Args {
    config: Option<PathBuf>,
    output: Option<String>,
    metrics_port: Option<u16>,
    simulate_loss: Option<f64>,
    seed: u64,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = None;
    let mut output = None;
    let mut metrics_port = None;
    let mut simulate_loss = None;
    let mut seed = 1u64;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--config requires a value"))?;
                config = Some(PathBuf::from(val));
            }
            "--output" | "-o" => {
                i += 1;
                output = Some(
                    args.get(i)
                        .ok_or_else(|| anyhow::anyhow!("--output requires a value"))?
                        .clone(),
                );
            }
            "--metrics-port" | "-m" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--metrics-port requires a value"))?;
                metrics_port = Some(
                    val.parse()
                        .map_err(|e| anyhow::anyhow!("invalid port '{}': {}", val, e))?,
                );
            }
            "--simulate" | "-s" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--simulate requires a loss percentage"))?;
                let loss: f64 = val
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid loss '{}': {}", val, e))?;
                if !(0.0..=100.0).contains(&loss) {
                    anyhow::bail!("loss must be between 0 and 100, got {loss}");
                }
                simulate_loss = Some(loss);
            }
            "--seed" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--seed requires a value"))?;
                seed = val
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid seed '{}': {}", val, e))?;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nRun with --help for usage.");
            }
        }
        i += 1;
    }

    // Fallback: env vars
    if config.is_none() {
        config = std::env::var("AEROLINK_CONFIG")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
    }
    if metrics_port.is_none()
        && let Ok(val) = std::env::var("METRICS_PORT")
    {
        metrics_port = val.parse().ok();
    }

    Ok(Args {
        config,
        output,
        metrics_port,
        simulate_loss,
        seed,
    })
}

fn print_help() {
    eprintln!(
        r#"aerolink-station — Long-range video link ground station

USAGE:
  aerolink-station [--config <path>] [OPTIONS]

OPTIONS:
  --config, -c <path>        Station config (TOML); interfaces, links, tuning
  --output, -o <path|->      Write recovered video to a file, or stdout with '-'
  --metrics-port, -m <port>  Prometheus metrics on 0.0.0.0:<port>/metrics
  --simulate, -s <loss%>     Run against the built-in vehicle simulator
  --seed <n>                 Simulator seed (default: 1)
  --help, -h                 Show this help

ENVIRONMENT VARIABLES:
  AEROLINK_CONFIG  Config path (fallback for --config)
  METRICS_PORT     Prometheus port (fallback for --metrics-port)
  RUST_LOG         Log level filter (e.g. info, debug, aerolink_transport=trace)

EXAMPLES:
  # Two radios, recovered video to a file
  aerolink-station --config station.toml --output capture.h264

  # Simulated vehicle with 10% loss, metrics on :9100
  aerolink-station --simulate 10 --metrics-port 9100
"#
    );
}
