//! `sim`: Scenario simulator: target trajectories, node detections, replay.

pub mod node_sim;
pub mod replay;
pub mod scenarios;
pub mod target;

pub use node_sim::{NodeParams, NodeSimulator, SimNode};
pub use replay::{load_replay, save_replay, ReplayLog};
pub use scenarios::{Scenario, ScenarioKind, ScenarioRunner, SimTick};
pub use target::{MotionSpec, Target};
