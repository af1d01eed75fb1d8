//! senseye - distributed indoor sensing agent
//!
//! Every device runs this identical binary. It loads configuration from
//! `~/.senseye/config.toml` (CLI flags win), spawns the mesh and pipeline
//! tasks, and either runs the sensing loop until interrupted or performs
//! a one-shot calibration.
//!
//! Exit codes: 0 normal, 1 configuration or I/O error, 2 calibration
//! failed.

use std::net::SocketAddr;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use senseye_common::{
    init_logging, load_and_validate_config, parse_acoustic_arg, LogLevel, NodeRole, SenseyeConfig,
};
use senseye_mapping::FloorPlan;
use senseye_node::{
    tasks::DEFAULT_CHANNEL_CAPACITY, MeshTask, NodeTaskBase, PipelineMessage, PipelineTask,
    ReplayScanner, ServiceRegistry, StaticRegistry,
};

/// senseye - distributed RF/acoustic indoor sensing
#[derive(Parser, Debug)]
#[command(name = "senseye")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Subcommand: `calibrate` runs one calibration and exits
    command: Option<String>,

    /// Run without the status reporter
    #[arg(long)]
    headless: bool,

    /// Node name
    #[arg(long, default_value = "")]
    name: String,

    /// Node role
    #[arg(long, value_name = "fixed|mobile", default_value = "fixed")]
    role: String,

    /// Acoustic mode: off, on-demand, or an interval such as 10m or 1h
    #[arg(long, default_value = "off")]
    acoustic: String,

    /// Mesh TCP port
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Debug logging
    #[arg(long)]
    debug: bool,
}

fn build_config(args: &Args) -> Result<SenseyeConfig> {
    let defaults = SenseyeConfig::default();
    let mut config = load_and_validate_config(&defaults.config_path())
        .context("failed to load configuration")?;

    if !args.name.is_empty() {
        config.node_name = args.name.clone();
    }
    config.role = args
        .role
        .parse::<NodeRole>()
        .map_err(anyhow::Error::msg)
        .context("invalid --role")?;
    let (mode, interval) = parse_acoustic_arg(&args.acoustic).context("invalid --acoustic")?;
    config.acoustic.mode = mode;
    if let Some(interval) = interval {
        config.acoustic.interval_s = interval;
    }
    if let Some(port) = args.port {
        config.mesh.port = port;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn parse_static_peers(config: &SenseyeConfig) -> Result<Vec<(String, SocketAddr)>> {
    config
        .mesh
        .static_peers
        .iter()
        .map(|entry| {
            let (node_id, addr) = entry
                .split_once('@')
                .with_context(|| format!("static peer missing '@': {entry}"))?;
            let addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("bad static peer address: {entry}"))?;
            Ok((node_id.to_string(), addr))
        })
        .collect()
}

struct NodeApp {
    task_base: NodeTaskBase,
}

impl NodeApp {
    async fn start(config: SenseyeConfig) -> Result<Self> {
        info!(
            node_id = %config.node_id,
            name = %config.node_name,
            role = %config.role,
            port = config.mesh.port,
            "starting node"
        );

        std::fs::create_dir_all(&config.data_dir).context("failed to create data dir")?;

        let floorplan = FloorPlan::load(&config.floorplan_path())
            .map(|plan| {
                if plan.is_some() {
                    info!("loaded floorplan from {:?}", config.floorplan_path());
                }
                plan
            })
            .unwrap_or_else(|e| {
                warn!("failed to load floorplan, starting fresh: {e}");
                None
            });

        let (task_base, channels) = NodeTaskBase::new(DEFAULT_CHANNEL_CAPACITY);
        let (mesh_events_tx, mesh_events_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);

        // Service discovery: the registry collaborator feeds peer events.
        let mut registry = StaticRegistry::new(parse_static_peers(&config)?);
        registry
            .register(
                &config.node_id,
                config.mesh.port,
                config.role,
                config.position,
            )
            .await
            .context("service registration failed")?;
        let discovery_rx = registry.events();

        // Mesh task.
        let mesh = MeshTask::new(
            config.node_id.clone(),
            config.role,
            config.position,
            config.mesh.clone(),
            mesh_events_tx,
        );
        let bind: SocketAddr = ([0, 0, 0, 0], config.mesh.port).into();
        mesh.spawn(bind, channels.mesh_rx, discovery_rx)
            .await
            .context("failed to bind mesh listener")?;

        // Pipeline task. Platform scanners plug in through the Scanner
        // collaborator; without one the node still fuses peer beliefs.
        let pipeline = PipelineTask::new(
            config.clone(),
            Box::new(ReplayScanner::default()),
            None,
            floorplan,
        );
        let mesh_tx = task_base.mesh_tx.clone();
        let snapshot_tx = channels.snapshot_tx;
        tokio::spawn(pipeline.run(channels.pipeline_rx, mesh_events_rx, mesh_tx, snapshot_tx));

        Ok(Self { task_base })
    }

    /// Periodic status report for interactive runs. The dashboard renderer
    /// is an external collaborator; this prints the snapshot summary.
    fn spawn_status_reporter(&self) {
        let mut snapshot_rx = self.task_base.snapshot_rx.clone();
        tokio::spawn(async move {
            loop {
                if snapshot_rx.changed().await.is_err() {
                    break;
                }
                let snapshot = snapshot_rx.borrow().clone();
                let online = snapshot.nodes.iter().filter(|n| n.online).count();
                info!(
                    nodes_online = online,
                    devices = snapshot.devices.len(),
                    zones_active = snapshot
                        .zone_motion
                        .values()
                        .filter(|&&intensity| intensity > 0.1)
                        .count(),
                    map_age_s = snapshot.map_age as u64,
                    status = ?snapshot.calibration_status,
                    "world"
                );
            }
        });
    }

    async fn calibrate(&self) -> Result<(), String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.task_base
            .pipeline_tx
            .send(PipelineMessage::Calibrate {
                reply: Some(reply_tx),
            })
            .await
            .map_err(|e| format!("pipeline unavailable: {e}"))?;
        reply_rx
            .await
            .map_err(|e| format!("calibration reply lost: {e}"))?
    }

    async fn run_until_shutdown(&self) -> Result<()> {
        signal::ctrl_c().await.context("signal handler failed")?;
        info!("received Ctrl+C, shutting down");
        self.task_base.shutdown_all().await;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(if args.debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    });

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e:#}");
            return ExitCode::from(1);
        }
    };

    let app = match NodeApp::start(config).await {
        Ok(app) => app,
        Err(e) => {
            error!("startup failed: {e:#}");
            return ExitCode::from(1);
        }
    };

    match args.command.as_deref() {
        Some("calibrate") => match app.calibrate().await {
            Ok(()) => {
                info!("calibration complete");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("calibration failed: {e}");
                ExitCode::from(2)
            }
        },
        Some(other) => {
            error!("unknown command: {other}");
            ExitCode::from(1)
        }
        None => {
            if !args.headless {
                app.spawn_status_reporter();
            }
            match app.run_until_shutdown().await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("runtime error: {e:#}");
                    ExitCode::from(1)
                }
            }
        }
    }
}
