//! `tracker_core`: Per-node multi-target tracking and multi-node fusion.
//!
//! # Module layout
//! - [`types`]         IDs, state vectors, detections and wire snapshots
//! - [`error`]         Validation and invariant errors
//! - [`track`]         Track struct and status
//! - [`kf`]            Constant-velocity Kalman filter (predict / update)
//! - [`gating`]        Euclidean / Mahalanobis gating, spatial grid
//! - [`association`]   Bipartite graph, connected components, Hungarian solver
//! - [`track_manager`] Birth / confirmation / coasting / deletion logic
//! - [`pipeline`]      Per-node tracking tick with rollback
//! - [`fusion`]        Cross-node grouping and weighted fused tracks
//! - [`metrics`]       Per-node tick counters

pub mod association;
pub mod error;
pub mod fusion;
pub mod gating;
pub mod kf;
pub mod metrics;
pub mod pipeline;
pub mod track;
pub mod track_manager;
pub mod types;

pub use error::{TrackerError, ValidationError};
pub use fusion::{FusedTrack, FusedTrackSnapshot, FusionAggregator, FusionConfig};
pub use pipeline::{Pipeline, PipelineConfig, PipelineOutput};
pub use track::{HistoryPoint, Track, TrackStatus};
pub use types::{
    Detection, DetectionBatch, DetectionId, FusedId, NodeId, StateCov, StateVec, TrackId,
    TrackReport, TrackSnapshot,
};
