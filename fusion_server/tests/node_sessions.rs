use fusion_server::{
    protocol::{decode_line, encode_line},
    FusionServer, NodeEntry, NodeMessage, Publisher, ServerConfig, ServerMessage, ShutdownHandle,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    time::timeout,
};
use tracker_core::{
    Detection, DetectionBatch, DetectionId, FusedTrackSnapshot, NodeId, TrackId, TrackReport,
    TrackSnapshot, TrackStatus,
};

struct TestServer {
    node_addr: SocketAddr,
    http_addr: SocketAddr,
    publisher: Arc<Publisher>,
    table: Arc<fusion_server::SnapshotTable>,
    shutdown: ShutdownHandle,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        node_listen: "127.0.0.1:0".parse().unwrap(),
        http_listen: "127.0.0.1:0".parse().unwrap(),
        tick_ms: 20,
        silence_timeout_ms: 400,
        subscriber_queue: 1024,
        ..Default::default()
    }
}

async fn start(config: ServerConfig) -> TestServer {
    let server = FusionServer::bind(config).await.unwrap();
    let handle = TestServer {
        node_addr: server.node_addr().unwrap(),
        http_addr: server.http_addr().unwrap(),
        publisher: server.publisher(),
        table: server.table(),
        shutdown: server.shutdown_handle(),
    };
    tokio::spawn(server.run());
    handle
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, writer) = stream.into_split();
        Self {
            lines: BufReader::new(r).lines(),
            writer,
        }
    }

    async fn send(&mut self, msg: &NodeMessage) {
        self.send_raw(&encode_line(msg).unwrap()).await;
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> ServerMessage {
        let line = timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("server reply timed out")
            .unwrap()
            .expect("server closed the connection");
        decode_line(&line).unwrap()
    }

    async fn hello(addr: SocketAddr, node: u32) -> Self {
        let mut client = Self::connect(addr).await;
        client
            .send(&NodeMessage::Hello {
                node_id: NodeId(node),
            })
            .await;
        match client.recv().await {
            ServerMessage::Welcome { node_id, .. } => assert_eq!(node_id, NodeId(node)),
            other => panic!("expected welcome, got {other:?}"),
        }
        client
    }
}

fn tracks(node: u32, ts: f64, x: f64, quality: f64) -> NodeMessage {
    NodeMessage::Tracks(TrackSnapshot {
        node_id: NodeId(node),
        timestamp: ts,
        tracks: vec![TrackReport {
            track_id: TrackId(1),
            status: TrackStatus::Confirmed,
            position: [x, 0.0],
            velocity: Some([1.0, 0.0]),
            signal_quality: quality,
        }],
    })
}

/// Minimal HTTP/1.1 GET returning the JSON body.
async fn http_get_json(addr: SocketAddr, path: &str) -> serde_json::Value {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = String::new();
    timeout(Duration::from_secs(2), stream.read_to_string(&mut raw))
        .await
        .expect("http response timed out")
        .unwrap();
    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    serde_json::from_str(body).unwrap()
}

/// Drain published snapshots until one satisfies `pred`.
async fn wait_for_fused(
    publisher: &Publisher,
    pred: impl Fn(&FusedTrackSnapshot) -> bool,
) -> FusedTrackSnapshot {
    let mut sub = publisher.subscribe();
    timeout(Duration::from_secs(3), async {
        loop {
            let json = sub.rx.recv().await.expect("publisher dropped subscriber");
            let snap: FusedTrackSnapshot = serde_json::from_str(&json).unwrap();
            if pred(&snap) {
                return snap;
            }
        }
    })
    .await
    .expect("no matching fused snapshot")
}

#[tokio::test]
async fn two_nodes_fuse_into_one_track() {
    let server = start(test_config()).await;
    let mut a = Client::hello(server.node_addr, 1).await;
    let mut b = Client::hello(server.node_addr, 2).await;

    a.send(&tracks(1, 0.0, 0.0, 10.0)).await;
    b.send(&tracks(2, 0.0, 0.4, 30.0)).await;
    assert!(matches!(a.recv().await, ServerMessage::Accepted { tracks: 1, .. }));
    assert!(matches!(b.recv().await, ServerMessage::Accepted { tracks: 1, .. }));

    let snap = wait_for_fused(&server.publisher, |s| {
        s.tracks.len() == 1 && s.tracks[0].contributing.len() == 2
    })
    .await;
    assert!((snap.tracks[0].position[0] - 0.3).abs() < 1e-9);
}

#[tokio::test]
async fn detections_are_tracked_server_side() {
    let mut config = test_config();
    config.pipeline.track_manager.confirm_hits = 1;
    let server = start(config).await;
    let mut node = Client::hello(server.node_addr, 3).await;

    let batch = DetectionBatch::new(
        NodeId(3),
        0.0,
        vec![Detection {
            detection_id: DetectionId(0),
            source_node_id: NodeId(3),
            position: [10.0, 20.0],
            signal_quality: 20.0,
            observed_at: 0.0,
        }],
    );
    node.send(&NodeMessage::Detections(batch)).await;
    match node.recv().await {
        ServerMessage::Accepted { tracks, .. } => assert_eq!(tracks, 1),
        other => panic!("expected accepted, got {other:?}"),
    }

    let snap = wait_for_fused(&server.publisher, |s| s.tracks.len() == 1).await;
    assert_eq!(snap.tracks[0].position, [10.0, 20.0]);
    let stats = server.table.get(NodeId(3)).unwrap().stats.unwrap();
    assert_eq!(stats.births, 1);
}

#[tokio::test]
async fn repeated_malformed_batches_close_the_session() {
    let mut config = test_config();
    config.max_consecutive_malformed = 2;
    let server = start(config).await;
    let mut node = Client::hello(server.node_addr, 4).await;

    node.send_raw("{not json\n").await;
    assert!(matches!(
        node.recv().await,
        ServerMessage::Rejected {
            consecutive_failures: 1,
            ..
        }
    ));

    // A good batch resets the counter.
    node.send(&tracks(4, 0.0, 0.0, 1.0)).await;
    assert!(matches!(node.recv().await, ServerMessage::Accepted { .. }));

    node.send(&tracks(4, f64::NAN, 0.0, 1.0)).await;
    node.send(&tracks(5, 1.0, 0.0, 1.0)).await;
    assert!(matches!(node.recv().await, ServerMessage::Rejected { .. }));
    assert!(matches!(
        node.recv().await,
        ServerMessage::Rejected {
            consecutive_failures: 2,
            ..
        }
    ));
    assert!(matches!(node.recv().await, ServerMessage::Closing { .. }));

    timeout(Duration::from_secs(2), async {
        while !server.table.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("slot not removed after teardown");
}

#[tokio::test]
async fn unknown_and_duplicate_nodes_are_refused() {
    let mut config = test_config();
    config.nodes = vec![NodeEntry {
        id: NodeId(1),
        name: Some("mast".into()),
    }];
    let server = start(config).await;

    let mut stranger = Client::connect(server.node_addr).await;
    stranger
        .send(&NodeMessage::Hello {
            node_id: NodeId(9),
        })
        .await;
    assert!(matches!(stranger.recv().await, ServerMessage::Closing { .. }));

    let _first = Client::hello(server.node_addr, 1).await;
    let mut second = Client::connect(server.node_addr).await;
    second
        .send(&NodeMessage::Hello {
            node_id: NodeId(1),
        })
        .await;
    assert!(matches!(second.recv().await, ServerMessage::Closing { .. }));
}

#[tokio::test]
async fn silent_node_drops_out_and_returns() {
    let server = start(test_config()).await;
    let mut node = Client::hello(server.node_addr, 6).await;
    node.send(&tracks(6, 0.0, 5.0, 1.0)).await;
    node.recv().await;
    wait_for_fused(&server.publisher, |s| s.tracks.len() == 1).await;

    // No traffic for longer than the silence timeout.
    let snap = wait_for_fused(&server.publisher, |s| s.tracks.is_empty()).await;
    assert!(snap.tracks.is_empty());
    timeout(Duration::from_secs(2), async {
        while server.table.get(NodeId(6)).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("silent session not torn down");
    assert!(matches!(node.lines.next_line().await, Ok(None) | Err(_)));

    let mut again = Client::hello(server.node_addr, 6).await;
    again.send(&tracks(6, 1.0, 5.0, 1.0)).await;
    again.recv().await;
    wait_for_fused(&server.publisher, |s| s.tracks.len() == 1).await;
}

#[tokio::test]
async fn oversized_lines_count_as_malformed() {
    let mut config = test_config();
    config.max_line_bytes = 256;
    config.max_consecutive_malformed = 2;
    let server = start(config).await;
    let mut node = Client::hello(server.node_addr, 7).await;

    node.send_raw(&format!("{}\n", "x".repeat(1000))).await;
    assert!(matches!(
        node.recv().await,
        ServerMessage::Rejected {
            consecutive_failures: 1,
            ..
        }
    ));

    // The session keeps reading after the discarded line.
    node.send(&tracks(7, 0.0, 0.0, 1.0)).await;
    assert!(matches!(node.recv().await, ServerMessage::Accepted { .. }));

    // No newline at all: rejected as soon as the buffer passes the limit.
    node.send_raw(&"y".repeat(300)).await;
    assert!(matches!(
        node.recv().await,
        ServerMessage::Rejected {
            consecutive_failures: 1,
            ..
        }
    ));
    node.send_raw("yyyy\n").await;
    node.send_raw(&format!("{}\n", "z".repeat(1000))).await;
    assert!(matches!(
        node.recv().await,
        ServerMessage::Rejected {
            consecutive_failures: 2,
            ..
        }
    ));
    assert!(matches!(node.recv().await, ServerMessage::Closing { .. }));
}

#[tokio::test]
async fn dropped_detections_are_reported_per_node() {
    let mut config = test_config();
    config.pipeline.max_detections_per_tick = Some(2);
    let server = start(config).await;
    let mut node = Client::hello(server.node_addr, 8).await;

    let detections = (0..5u64)
        .map(|i| Detection {
            detection_id: DetectionId(i),
            source_node_id: NodeId(8),
            position: [i as f64 * 50.0, 0.0],
            signal_quality: 10.0 + i as f64,
            observed_at: 0.0,
        })
        .collect();
    node.send(&NodeMessage::Detections(DetectionBatch::new(NodeId(8), 0.0, detections)))
        .await;
    assert!(matches!(node.recv().await, ServerMessage::Accepted { tracks: 2, .. }));

    let nodes = http_get_json(server.http_addr, "/api/v1/nodes").await;
    assert_eq!(nodes[0]["node_id"], 8);
    assert_eq!(nodes[0]["tracks"], 2);
    assert_eq!(nodes[0]["stats"]["dropped_detections"], 3);

    let health = http_get_json(server.http_addr, "/health").await;
    assert_eq!(health["dropped_detections"], 3);
}
