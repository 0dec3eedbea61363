//! Scenario definitions.
//!
//! Each scenario is a named configuration of targets and sensor nodes.
//! All scenarios are deterministic given the same seed.

use crate::{
    node_sim::{NodeParams, NodeSimulator, SimNode},
    replay::{GroundTruthFrame, TargetState},
    target::{MotionSpec, Target},
};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracker_core::{DetectionBatch, NodeId};

/// Which pre-defined scenario to load.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum ScenarioKind {
    /// 3 targets, 2 overlapping nodes, low clutter
    Simple,
    /// 2 targets crossing in front of 3 nodes
    Crossing,
    /// One target leaving one node's coverage for another's, sidestepping
    /// north mid-way
    Handover,
    /// 40 targets, 4 nodes, moderate clutter
    Dense,
}

/// A fully configured simulation scenario.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub seed: u64,
    /// Seconds
    pub duration: f64,
    /// Node tick period (s)
    pub tick_dt: f64,
    pub targets: Vec<Target>,
    pub nodes: Vec<SimNode>,
}

impl Scenario {
    /// Build the named scenario. Uses `seed` for repeatability.
    pub fn build(kind: ScenarioKind, seed: u64) -> Self {
        match kind {
            ScenarioKind::Simple => Self::simple(seed),
            ScenarioKind::Crossing => Self::crossing(seed),
            ScenarioKind::Handover => Self::handover(seed),
            ScenarioKind::Dense => Self::dense(seed),
        }
    }

    fn simple(seed: u64) -> Self {
        let targets = vec![
            Target::new(0, [-40.0, 10.0], [1.5, 0.0], MotionSpec::ConstantVelocity),
            Target::new(1, [20.0, -30.0], [0.0, 1.0], MotionSpec::ConstantVelocity),
            Target::new(2, [0.0, 40.0], [1.0, -0.5], MotionSpec::ConstantTurn { omega: 0.05 }),
        ];
        let nodes = vec![
            node(1, [-30.0, -30.0], 0.4, 0.95, 0.1),
            node(2, [30.0, 30.0], 0.6, 0.9, 0.1),
        ];
        Scenario {
            name: "simple".into(),
            seed,
            duration: 60.0,
            tick_dt: 0.5,
            targets,
            nodes,
        }
    }

    fn crossing(seed: u64) -> Self {
        let targets = vec![
            Target::new(0, [-30.0, -5.0], [1.5, 0.25], MotionSpec::ConstantVelocity),
            Target::new(1, [-30.0, 5.0], [1.5, -0.25], MotionSpec::ConstantVelocity),
        ];
        let nodes = vec![
            node(1, [0.0, -40.0], 0.3, 0.95, 0.2),
            node(2, [-40.0, 30.0], 0.5, 0.9, 0.2),
            node(3, [40.0, 30.0], 0.5, 0.9, 0.2),
        ];
        Scenario {
            name: "crossing".into(),
            seed,
            duration: 40.0,
            tick_dt: 0.5,
            targets,
            nodes,
        }
    }

    fn handover(seed: u64) -> Self {
        // Cruise, accelerate north for 4 s, then cruise again on the new heading.
        let motion = MotionSpec::Segmented {
            segments: vec![
                (0.0, MotionSpec::ConstantVelocity),
                (20.0, MotionSpec::ConstantAccel { ax: 0.0, ay: 0.5 }),
                (24.0, MotionSpec::ConstantVelocity),
            ],
        };
        let targets = vec![Target::new(0, [-150.0, 0.0], [5.0, 0.0], motion)];
        let mut west = node(1, [-100.0, 0.0], 0.5, 0.95, 0.1);
        let mut east = node(2, [100.0, 0.0], 0.5, 0.95, 0.1);
        west.params.max_range = 120.0;
        east.params.max_range = 120.0;
        Scenario {
            name: "handover".into(),
            seed,
            duration: 60.0,
            tick_dt: 0.5,
            targets,
            nodes: vec![west, east],
        }
    }

    fn dense(seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(1));
        let targets = (0..40)
            .map(|i| {
                let angle = i as f64 * std::f64::consts::TAU / 40.0;
                let r = 80.0;
                let speed = 0.5 + rng.gen::<f64>() * 1.5;
                let heading = angle + std::f64::consts::PI; // toward centre
                let motion = if i % 5 == 0 {
                    MotionSpec::ConstantTurn { omega: 0.02 }
                } else {
                    MotionSpec::ConstantVelocity
                };
                Target::new(
                    i as u64,
                    [r * angle.cos(), r * angle.sin()],
                    [speed * heading.cos(), speed * heading.sin()],
                    motion,
                )
                .visible_between(Some((i % 8) as f64), None)
            })
            .collect();
        let nodes = vec![
            node(1, [-60.0, -60.0], 0.5, 0.9, 1.0),
            node(2, [60.0, -60.0], 0.5, 0.9, 1.0),
            node(3, [60.0, 60.0], 0.5, 0.9, 1.0),
            node(4, [-60.0, 60.0], 0.5, 0.9, 1.0),
        ];
        Scenario {
            name: "dense".into(),
            seed,
            duration: 120.0,
            tick_dt: 0.5,
            targets,
            nodes,
        }
    }

    /// Step through the scenario tick by tick.
    pub fn runner(&self) -> ScenarioRunner {
        ScenarioRunner {
            targets: self.targets.clone(),
            sim: NodeSimulator::new(self.nodes.clone(), self.seed),
            t: 0.0,
            dt: self.tick_dt.max(1e-3),
            duration: self.duration,
        }
    }

    /// Restrict the scenario to a single node (for a `node` process).
    pub fn only_node(mut self, id: NodeId) -> Self {
        self.nodes.retain(|n| n.id == id);
        self
    }
}

/// One simulated tick.
#[derive(Clone, Debug)]
pub struct SimTick {
    pub time: f64,
    pub batches: Vec<DetectionBatch>,
    pub truth: GroundTruthFrame,
}

/// Iterator over the ticks of a scenario.
pub struct ScenarioRunner {
    targets: Vec<Target>,
    sim: NodeSimulator,
    t: f64,
    dt: f64,
    duration: f64,
}

impl Iterator for ScenarioRunner {
    type Item = SimTick;

    fn next(&mut self) -> Option<SimTick> {
        if self.t > self.duration {
            return None;
        }
        let time = self.t;
        let batches = self.sim.generate(&self.targets, time);
        let truth = GroundTruthFrame {
            time,
            targets: self
                .targets
                .iter()
                .filter(|t| t.is_active(time))
                .map(|t| TargetState {
                    id: t.id,
                    position: t.position(),
                    velocity: t.velocity(),
                })
                .collect(),
        };
        for target in &mut self.targets {
            target.step(time, self.dt);
        }
        self.t += self.dt;
        Some(SimTick {
            time,
            batches,
            truth,
        })
    }
}

fn node(id: u32, position: [f64; 2], noise_std: f64, p_detection: f64, clutter_rate: f64) -> SimNode {
    SimNode {
        id: NodeId(id),
        params: NodeParams {
            position,
            noise_std,
            p_detection,
            clutter_rate,
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_covers_duration() {
        let scenario = Scenario::build(ScenarioKind::Simple, 1);
        let ticks: Vec<SimTick> = scenario.runner().collect();
        assert_eq!(ticks.len(), 121);
        assert!(ticks.iter().all(|t| t.batches.len() == 2));
        assert!(ticks.windows(2).all(|w| w[1].time > w[0].time));
    }

    #[test]
    fn only_node_keeps_one() {
        let scenario = Scenario::build(ScenarioKind::Crossing, 1).only_node(NodeId(2));
        assert_eq!(scenario.nodes.len(), 1);
        let tick = scenario.runner().next().unwrap();
        assert_eq!(tick.batches[0].node_id, NodeId(2));
    }

    #[test]
    fn handover_target_sidesteps_and_stays_covered() {
        let scenario = Scenario::build(ScenarioKind::Handover, 1);
        let ranges: Vec<f64> = scenario.nodes.iter().map(|n| n.params.max_range).collect();
        let positions: Vec<[f64; 2]> = scenario.nodes.iter().map(|n| n.params.position).collect();
        let ticks: Vec<SimTick> = scenario.runner().collect();

        let velocity_at = |t: f64| {
            ticks
                .iter()
                .find(|tick| (tick.time - t).abs() < 1e-9)
                .map(|tick| tick.truth.targets[0].velocity)
                .unwrap()
        };
        assert_eq!(velocity_at(10.0), [5.0, 0.0]);
        assert!((velocity_at(30.0)[1] - 2.0).abs() < 1e-9);

        for tick in &ticks {
            let [x, y] = tick.truth.targets[0].position;
            let covered = positions
                .iter()
                .zip(&ranges)
                .any(|(p, r)| (x - p[0]).hypot(y - p[1]) <= *r);
            assert!(covered, "target uncovered at t={}", tick.time);
        }
    }

    #[test]
    fn dense_targets_appear_over_time() {
        let scenario = Scenario::build(ScenarioKind::Dense, 3);
        let mut runner = scenario.runner();
        let first = runner.next().unwrap();
        assert_eq!(first.truth.targets.len(), 5);
    }
}
