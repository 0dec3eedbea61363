//! Server configuration, loaded from TOML.
//!
//! Every field has a default, so a partial file (or none at all) is valid:
//!
//! ```toml
//! node_listen = "0.0.0.0:7400"
//! tick_ms = 100
//!
//! [[nodes]]
//! id = 1
//! name = "north-mast"
//!
//! [pipeline.track_manager]
//! confirm_hits = 3
//!
//! [fusion]
//! fusion_distance = 25.0
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::{fs, net::SocketAddr, path::Path, time::Duration};
use tracker_core::{FusionConfig, NodeId, PipelineConfig};

/// One entry of the static node registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listener for sensor-node sessions
    pub node_listen: SocketAddr,
    /// HTTP / WebSocket listener for subscribers
    pub http_listen: SocketAddr,
    /// Fusion tick period
    pub tick_ms: u64,
    /// A node silent for longer than this is stale and its session torn down
    pub silence_timeout_ms: u64,
    /// Longest accepted inbound line; longer lines count as malformed
    pub max_line_bytes: usize,
    /// Consecutive malformed batches before a session is closed
    pub max_consecutive_malformed: u32,
    /// Inbound messages buffered per session before the reader waits
    pub session_queue: usize,
    /// Outbound snapshots buffered per subscriber before it is dropped
    pub subscriber_queue: usize,
    /// Expected nodes; empty accepts any node id
    pub nodes: Vec<NodeEntry>,
    /// Tracker settings for nodes that send raw detections
    pub pipeline: PipelineConfig,
    pub fusion: FusionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_listen: SocketAddr::from(([0, 0, 0, 0], 7400)),
            http_listen: SocketAddr::from(([0, 0, 0, 0], 7401)),
            tick_ms: 100,
            silence_timeout_ms: 3000,
            max_line_bytes: 1 << 20,
            max_consecutive_malformed: 5,
            session_queue: 32,
            subscriber_queue: 16,
            nodes: Vec::new(),
            pipeline: PipelineConfig::default(),
            fusion: FusionConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    /// Line limit handed to the session codec; never zero.
    pub fn line_limit(&self) -> usize {
        self.max_line_bytes.max(1)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    /// Registry lookup. An empty registry admits every node.
    pub fn is_registered(&self, node: NodeId) -> bool {
        self.nodes.is_empty() || self.nodes.iter().any(|n| n.id == node)
    }

    pub fn node_name(&self, node: NodeId) -> Option<&str> {
        self.nodes
            .iter()
            .find(|n| n.id == node)
            .and_then(|n| n.name.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg = ServerConfig::from_toml_str(
            r#"
            tick_ms = 250

            [[nodes]]
            id = 4
            name = "roof"

            [pipeline.track_manager]
            confirm_hits = 2

            [fusion]
            fusion_distance = 12.5
            "#,
        )
        .unwrap();

        assert_eq!(cfg.tick_ms, 250);
        assert_eq!(cfg.silence_timeout_ms, 3000);
        assert_eq!(cfg.max_line_bytes, 1 << 20);
        assert_eq!(cfg.pipeline.track_manager.confirm_hits, 2);
        assert_eq!(cfg.pipeline.track_manager.max_coast, 5);
        assert_eq!(cfg.fusion.fusion_distance, 12.5);
        assert_eq!(cfg.node_name(NodeId(4)), Some("roof"));
    }

    #[test]
    fn registry_filters_unknown_nodes() {
        let mut cfg = ServerConfig::default();
        assert!(cfg.is_registered(NodeId(99)));
        cfg.nodes.push(NodeEntry {
            id: NodeId(1),
            name: None,
        });
        assert!(cfg.is_registered(NodeId(1)));
        assert!(!cfg.is_registered(NodeId(99)));
    }

    #[test]
    fn shipped_config_parses() {
        let cfg = ServerConfig::from_toml_str(include_str!("../../config/fusion.toml")).unwrap();
        assert_eq!(cfg.nodes.len(), 2);
        assert_eq!(cfg.pipeline.max_detections_per_tick, Some(512));
        assert_eq!(cfg.pipeline.kf.quality_scaling, Some(20.0));
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(ServerConfig::from_toml_str("tick_ms = \"fast\"").is_err());
    }
}
