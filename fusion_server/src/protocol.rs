//! Node ↔ server wire protocol: one JSON object per line over TCP.
//!
//! ```text
//! node   → {"type":"hello","node_id":3}
//! server → {"type":"welcome","node_id":3,"tick_ms":100}
//! node   → {"type":"tracks","node_id":3,"timestamp":12.5,"tracks":[...]}
//! server → {"type":"accepted","timestamp":12.5,"tracks":4}
//! node   → {"type":"bye"}
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use tracker_core::{DetectionBatch, NodeId, TrackSnapshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeMessage {
    /// Must be the first message of a session.
    Hello { node_id: NodeId },
    /// Raw detections; the server runs the node's tracker.
    Detections(DetectionBatch),
    /// Tracks from a node that runs its own tracker.
    Tracks(TrackSnapshot),
    Bye,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        node_id: NodeId,
        tick_ms: u64,
    },
    Accepted {
        timestamp: f64,
        /// Live tracks stored for the node after this batch
        tracks: usize,
    },
    Rejected {
        reason: String,
        consecutive_failures: u32,
    },
    Closing {
        reason: String,
    },
}

pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Serialize `msg` as a single newline-terminated line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}
