use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tracker_core::fusion::{FusionAggregator, FusionConfig};
use tracker_core::pipeline::{Pipeline, PipelineConfig};
use tracker_core::track::TrackStatus;
use tracker_core::types::{
    Detection, DetectionBatch, DetectionId, NodeId, TrackId, TrackReport, TrackSnapshot,
};

fn make_batch(n: usize, t: f64) -> DetectionBatch {
    let detections = (0..n)
        .map(|i| {
            let angle = i as f64 * std::f64::consts::TAU / n as f64;
            let r = 1000.0 + t;
            Detection {
                detection_id: DetectionId(i as u64),
                source_node_id: NodeId(0),
                position: [r * angle.cos(), r * angle.sin()],
                signal_quality: 10.0 + (i % 7) as f64,
                observed_at: t,
            }
        })
        .collect();
    DetectionBatch::new(NodeId(0), t, detections)
}

fn make_snapshots(nodes: u32, per_node: usize) -> Vec<TrackSnapshot> {
    (0..nodes)
        .map(|node| TrackSnapshot {
            node_id: NodeId(node),
            timestamp: 0.0,
            tracks: (0..per_node)
                .map(|i| TrackReport {
                    track_id: TrackId(i as u64),
                    status: TrackStatus::Confirmed,
                    position: [i as f64 * 10.0 + node as f64 * 0.1, 0.0],
                    velocity: Some([1.0, 0.0]),
                    signal_quality: 5.0 + node as f64,
                })
                .collect(),
        })
        .collect()
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");

    for n in [10, 100, 500] {
        group.bench_function(format!("{n}_targets"), |b| {
            b.iter(|| {
                let mut pipeline = Pipeline::new(NodeId(0), PipelineConfig::default());
                // Warm up with one batch to create tracks
                let _ = pipeline.tick(&make_batch(n, 0.0));
                // Measure a full tick against established tracks
                let batch = make_batch(n, 1.0);
                black_box(pipeline.tick(&batch).ok());
            });
        });
    }

    group.finish();
}

fn bench_fusion(c: &mut Criterion) {
    let mut group = c.benchmark_group("fusion");

    for nodes in [2, 8] {
        let snapshots = make_snapshots(nodes, 100);
        group.bench_function(format!("{nodes}_nodes_x100"), |b| {
            let mut agg = FusionAggregator::new(FusionConfig::default());
            b.iter(|| black_box(agg.fuse(&snapshots, 0.0)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pipeline, bench_fusion);
criterion_main!(benches);
