//! `prfusion` CLI: fusion server, simulated sensor nodes, offline runs and replays.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fusion_server::{
    protocol::{decode_line, encode_line},
    FusionServer, NodeMessage, ServerConfig, ServerMessage,
};
use sim::replay::{load_replay, save_replay, GroundTruthFrame, ReplayLog};
use sim::scenarios::{Scenario, ScenarioKind};
use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tracing::{info, warn};
use tracker_core::{
    DetectionBatch, FusedTrack, FusionAggregator, FusionConfig, NodeId, Pipeline, PipelineConfig,
};

#[derive(Parser)]
#[command(name = "prfusion", about = "Passive-radar multi-node tracking and fusion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fusion server.
    Serve {
        /// TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the node listener address
        #[arg(long)]
        node_listen: Option<SocketAddr>,
        /// Override the HTTP / WebSocket listener address
        #[arg(long)]
        http_listen: Option<SocketAddr>,
        /// Override the fusion tick period
        #[arg(long)]
        tick_ms: Option<u64>,
    },
    /// Simulate one sensor node and stream to a fusion server.
    Node {
        #[arg(long, default_value = "127.0.0.1:7400")]
        server: SocketAddr,
        #[arg(long)]
        node_id: u32,
        #[arg(long, value_enum, default_value_t = ScenarioKind::Simple)]
        scenario: ScenarioKind,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Send raw detections and let the server track them
        #[arg(long)]
        send_detections: bool,
        /// Playback speed; 0 sends as fast as possible
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
    },
    /// Run a scenario offline: every node's tracker plus fusion, no network.
    Simulate {
        #[arg(value_enum)]
        scenario: ScenarioKind,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Output metrics to a JSON file
        #[arg(long)]
        output: Option<PathBuf>,
        /// Also save the full replay log
        #[arg(long)]
        save_replay: Option<PathBuf>,
    },
    /// Replay a recorded log through the trackers and fusion.
    Replay {
        /// Path to replay JSON file
        input: PathBuf,
        /// Output metrics to a JSON file
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            node_listen,
            http_listen,
            tick_ms,
        } => {
            let mut cfg = match config {
                Some(path) => ServerConfig::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => ServerConfig::default(),
            };
            if let Some(addr) = node_listen {
                cfg.node_listen = addr;
            }
            if let Some(addr) = http_listen {
                cfg.http_listen = addr;
            }
            if let Some(ms) = tick_ms {
                cfg.tick_ms = ms;
            }
            serve(cfg).await?;
        }
        Commands::Node {
            server,
            node_id,
            scenario,
            seed,
            send_detections,
            speed,
        } => {
            run_node(server, NodeId(node_id), scenario, seed, send_detections, speed).await?;
        }
        Commands::Simulate {
            scenario,
            seed,
            output,
            save_replay: save_path,
        } => {
            run_simulation(scenario, seed, output.as_deref(), save_path.as_deref())?;
        }
        Commands::Replay { input, output } => {
            run_replay(&input, output.as_deref())?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

async fn serve(config: ServerConfig) -> Result<()> {
    let server = FusionServer::bind(config).await?;
    println!(
        "Fusion server: nodes on {}, subscribers on http://{}/ws/fused",
        server.node_addr()?,
        server.http_addr()?
    );
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            shutdown.shutdown();
        }
    });
    server.run().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// node
// ---------------------------------------------------------------------------

async fn run_node(
    server: SocketAddr,
    node: NodeId,
    kind: ScenarioKind,
    seed: u64,
    send_detections: bool,
    speed: f64,
) -> Result<()> {
    let scenario = Scenario::build(kind, seed).only_node(node);
    if scenario.nodes.is_empty() {
        bail!("scenario '{}' has no node {node}", scenario.name);
    }

    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("connecting to {server}"))?;
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    writer
        .write_all(encode_line(&NodeMessage::Hello { node_id: node })?.as_bytes())
        .await?;
    match lines.next_line().await?.map(|l| decode_line::<ServerMessage>(&l)) {
        Some(Ok(ServerMessage::Welcome { tick_ms, .. })) => {
            info!(node = %node, tick_ms, "connected to {server}");
        }
        Some(Ok(ServerMessage::Closing { reason })) => bail!("server refused {node}: {reason}"),
        other => bail!("unexpected handshake reply: {other:?}"),
    }

    // Replies are informational; log rejections and stop on close.
    let replies = tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            match decode_line::<ServerMessage>(&line) {
                Ok(ServerMessage::Rejected {
                    reason,
                    consecutive_failures,
                }) => warn!(consecutive_failures, "batch rejected: {reason}"),
                Ok(ServerMessage::Closing { reason }) => {
                    warn!("server closing session: {reason}");
                    break;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "undecodable server reply"),
            }
        }
    });

    let mut pipeline = Pipeline::new(node, PipelineConfig::default());
    let pause = if speed > 0.0 {
        Some(Duration::from_secs_f64(scenario.tick_dt / speed))
    } else {
        None
    };

    for tick in scenario.runner() {
        if replies.is_finished() {
            break;
        }
        let Some(batch) = tick.batches.into_iter().next() else {
            continue;
        };
        let msg = if send_detections {
            NodeMessage::Detections(batch)
        } else {
            if let Err(e) = pipeline.tick(&batch) {
                warn!(error = %e, "local tick failed");
                continue;
            }
            NodeMessage::Tracks(pipeline.snapshot())
        };
        writer.write_all(encode_line(&msg)?.as_bytes()).await?;
        if let Some(pause) = pause {
            tokio::time::sleep(pause).await;
        }
    }

    let _ = writer.write_all(encode_line(&NodeMessage::Bye)?.as_bytes()).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), replies).await;
    println!("Node {node} done: {:?}", pipeline.stats());
    Ok(())
}

// ---------------------------------------------------------------------------
// simulate / replay
// ---------------------------------------------------------------------------

/// Every node's pipeline plus the aggregator, driven tick by tick.
struct OfflineFusion {
    pipelines: BTreeMap<NodeId, Pipeline>,
    aggregator: FusionAggregator,
    errors: usize,
    position_error_sum: f64,
    position_error_n: usize,
    last_fused: Vec<FusedTrack>,
}

impl OfflineFusion {
    fn new() -> Self {
        Self {
            pipelines: BTreeMap::new(),
            aggregator: FusionAggregator::new(FusionConfig::default()),
            errors: 0,
            position_error_sum: 0.0,
            position_error_n: 0,
            last_fused: Vec::new(),
        }
    }

    fn tick<'a>(
        &mut self,
        time: f64,
        batches: impl IntoIterator<Item = &'a DetectionBatch>,
        truth: Option<&GroundTruthFrame>,
    ) {
        for batch in batches {
            let pipeline = self
                .pipelines
                .entry(batch.node_id)
                .or_insert_with(|| Pipeline::new(batch.node_id, PipelineConfig::default()));
            if pipeline.tick(batch).is_err() {
                self.errors += 1;
            }
        }
        let snapshots: Vec<_> = self.pipelines.values().map(Pipeline::snapshot).collect();
        self.last_fused = self.aggregator.fuse(&snapshots, time);

        // Distance from each true target to the nearest fused track.
        if let Some(truth) = truth {
            for target in &truth.targets {
                let nearest = self
                    .last_fused
                    .iter()
                    .map(|f| {
                        (f.position[0] - target.position[0]).hypot(f.position[1] - target.position[1])
                    })
                    .fold(f64::INFINITY, f64::min);
                if nearest < 5.0 {
                    self.position_error_sum += nearest;
                    self.position_error_n += 1;
                }
            }
        }
    }

    fn mean_error(&self) -> Option<f64> {
        (self.position_error_n > 0).then(|| self.position_error_sum / self.position_error_n as f64)
    }

    fn summary(&self) -> serde_json::Value {
        let stats: BTreeMap<String, _> = self
            .pipelines
            .iter()
            .map(|(id, p)| (id.to_string(), p.stats().clone()))
            .collect();
        // Trajectories of the tracks each node still holds at the end.
        let tracks: BTreeMap<String, Vec<serde_json::Value>> = self
            .pipelines
            .iter()
            .map(|(id, p)| {
                let summaries = p
                    .tracks()
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "track_id": t.id,
                            "status": t.status,
                            "total_hits": t.total_hits,
                            "path_length": t.path_length(),
                            "history": t.history,
                        })
                    })
                    .collect();
                (id.to_string(), summaries)
            })
            .collect();
        serde_json::json!({
            "final_fused_tracks": self.last_fused.len(),
            "rejected_batches": self.errors,
            "mean_position_error": self.mean_error(),
            "nodes": stats,
            "tracks": tracks,
        })
    }
}

fn run_simulation(
    kind: ScenarioKind,
    seed: u64,
    output_path: Option<&Path>,
    replay_path: Option<&Path>,
) -> Result<()> {
    let scenario = Scenario::build(kind, seed);
    println!(
        "Running scenario '{}' (seed={}, duration={:.0}s, {} nodes)...",
        scenario.name,
        seed,
        scenario.duration,
        scenario.nodes.len()
    );

    let mut offline = OfflineFusion::new();
    let mut log = ReplayLog {
        scenario_name: scenario.name.clone(),
        seed,
        tick_dt: scenario.tick_dt,
        duration: scenario.duration,
        ..Default::default()
    };

    let start = std::time::Instant::now();
    let mut ticks = 0usize;
    for tick in scenario.runner() {
        offline.tick(tick.time, &tick.batches, Some(&tick.truth));
        ticks += 1;
        if replay_path.is_some() {
            log.batches.extend(tick.batches);
            log.ground_truth.push(tick.truth);
        }
    }
    let elapsed = start.elapsed();

    println!(
        "Done: {} ticks, {} fused tracks, mean error {}, elapsed={:.2}s",
        ticks,
        offline.last_fused.len(),
        offline
            .mean_error()
            .map_or_else(|| "n/a".to_string(), |e| format!("{e:.2}")),
        elapsed.as_secs_f64(),
    );

    if let Some(rpath) = replay_path {
        save_replay(&log, rpath)?;
        println!("Replay saved to {}", rpath.display());
    }

    if let Some(opath) = output_path {
        let mut json = offline.summary();
        json["scenario"] = serde_json::json!(scenario.name);
        json["seed"] = serde_json::json!(seed);
        json["elapsed_s"] = serde_json::json!(elapsed.as_secs_f64());
        std::fs::write(opath, serde_json::to_string_pretty(&json)?)?;
        println!("Metrics saved to {}", opath.display());
    }

    Ok(())
}

fn run_replay(input: &Path, output_path: Option<&Path>) -> Result<()> {
    let log = load_replay(input).with_context(|| format!("loading {}", input.display()))?;
    println!(
        "Replaying '{}' ({} batches)...",
        log.scenario_name,
        log.batches.len()
    );

    let mut offline = OfflineFusion::new();
    let start = std::time::Instant::now();
    for (time, batches) in log.ticks() {
        let truth = log.ground_truth.iter().find(|f| f.time == time);
        offline.tick(time, batches, truth);
    }

    let elapsed = start.elapsed();
    println!(
        "Replay done: {} fused tracks, elapsed={:.2}s",
        offline.last_fused.len(),
        elapsed.as_secs_f64()
    );

    if let Some(opath) = output_path {
        let mut json = offline.summary();
        json["scenario"] = serde_json::json!(log.scenario_name);
        json["seed"] = serde_json::json!(log.seed);
        json["elapsed_s"] = serde_json::json!(elapsed.as_secs_f64());
        std::fs::write(opath, serde_json::to_string_pretty(&json)?)?;
    }

    Ok(())
}
