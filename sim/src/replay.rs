//! Replay: serialize/deserialize simulation logs for offline runs.

use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracker_core::DetectionBatch;

/// A full recorded simulation log.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayLog {
    pub scenario_name: String,
    pub seed: u64,
    pub tick_dt: f64,
    pub duration: f64,
    /// All detection batches in chronological order
    pub batches: Vec<DetectionBatch>,
    /// Ground-truth target states, one frame per tick
    pub ground_truth: Vec<GroundTruthFrame>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthFrame {
    pub time: f64,
    pub targets: Vec<TargetState>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub id: u64,
    pub position: [f64; 2],
    pub velocity: [f64; 2],
}

impl ReplayLog {
    /// Batches grouped by timestamp, in recorded order.
    pub fn ticks(&self) -> Vec<(f64, Vec<&DetectionBatch>)> {
        let mut ticks: Vec<(f64, Vec<&DetectionBatch>)> = Vec::new();
        for batch in &self.batches {
            match ticks.last_mut() {
                Some((t, group)) if *t == batch.timestamp => group.push(batch),
                _ => ticks.push((batch.timestamp, vec![batch])),
            }
        }
        ticks
    }
}

/// Save a replay log to a JSON file.
pub fn save_replay(log: &ReplayLog, path: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, log)?;
    Ok(())
}

/// Load a replay log from a JSON file.
pub fn load_replay(path: &Path) -> anyhow::Result<ReplayLog> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let log: ReplayLog = serde_json::from_reader(reader)?;
    Ok(log)
}
