//! `fusion_server`: sensor-node sessions, fusion tick and fused-track
//! publishing.
//!
//! # Module layout
//! - [`config`]          TOML server configuration and node registry
//! - [`protocol`]        Newline-delimited JSON node protocol
//! - [`snapshot_table`]  Latest per-node track snapshot, per-slot locking
//! - [`session`]         One task per node connection
//! - [`publisher`]       Bounded per-subscriber fan-out
//! - [`server`]          Listener wiring, fusion tick, HTTP / WebSocket API

pub mod config;
pub mod error;
pub mod protocol;
pub mod publisher;
pub mod server;
pub mod session;
pub mod snapshot_table;

pub use config::{NodeEntry, ServerConfig};
pub use error::{Result, ServerError};
pub use protocol::{NodeMessage, ServerMessage};
pub use publisher::{Publisher, Subscription};
pub use server::{FusionServer, ShutdownHandle};
pub use snapshot_table::{NodeStatus, SnapshotTable};
