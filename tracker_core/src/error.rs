//! Error taxonomy of the tracking core.
//!
//! Input problems are [`ValidationError`]s and reject one batch. A
//! [`TrackerError`] other than `Validation` means a tick broke an internal
//! invariant; the pipeline rolls its track table back before returning it.

use crate::types::{DetectionId, NodeId, TrackId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("non-finite value in `{0}`")]
    NonFinite(&'static str),

    #[error("`{field}` out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("batch for {expected} carries data from {found}")]
    NodeMismatch { expected: NodeId, found: NodeId },

    #[error("detection id {0} appears twice in one batch")]
    DuplicateDetectionId(DetectionId),

    #[error("track id {0} appears twice in one snapshot")]
    DuplicateTrackId(TrackId),

    #[error("track {0} reported with status Dead")]
    DeadTrackReported(TrackId),

    #[error("batch timestamp {got} precedes previous tick at {last}")]
    OutOfOrder { last: f64, got: f64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackerError {
    #[error("invalid batch: {0}")]
    Validation(#[from] ValidationError),

    #[error("duplicate track id {0} in live set")]
    DuplicateTrackId(TrackId),

    #[error("track {0} has a non-finite state after update")]
    NonFiniteState(TrackId),
}

impl TrackerError {
    /// True for errors that aborted a tick after mutation began.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TrackerError::Validation(_))
    }
}
