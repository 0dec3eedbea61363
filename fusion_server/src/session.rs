//! One task per connected sensor node.
//!
//! # Session lifecycle
//! 1. Handshake: the first line must be `hello`; the node id is checked
//!    against the registry and against already-active sessions
//! 2. Reader loop: lines are decoded and queued on a bounded channel,
//!    with `silence_timeout` as the read deadline. Lines longer than
//!    `max_line_bytes` are discarded and count as malformed
//! 3. Worker: drains the queue in order, runs the node's tracker for raw
//!    detections, stores snapshots and answers the node
//! 4. Teardown: always removes the node's slot from the snapshot table

use crate::{
    config::ServerConfig,
    error::{Result, ServerError},
    protocol::{decode_line, encode_line, NodeMessage, ServerMessage},
    snapshot_table::SnapshotTable,
};
use futures_util::StreamExt;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, watch},
    time::timeout,
};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};
use tracker_core::{
    DetectionBatch, NodeId, Pipeline, TrackSnapshot, TrackerError, ValidationError,
};

type NodeLines = FramedRead<OwnedReadHalf, LinesCodec>;

/// Shared handles every session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<ServerConfig>,
    pub table: Arc<SnapshotTable>,
    pub shutdown: watch::Receiver<bool>,
}

/// What the reader hands the worker.
enum Inbound {
    Message(NodeMessage),
    Malformed(String),
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Teardown {
    Bye,
    Eof,
    SilenceTimeout,
    TooManyMalformed,
    Shutdown,
    Io(String),
}

impl std::fmt::Display for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Teardown::Bye => write!(f, "node said bye"),
            Teardown::Eof => write!(f, "connection closed"),
            Teardown::SilenceTimeout => write!(f, "silence timeout"),
            Teardown::TooManyMalformed => write!(f, "too many malformed batches"),
            Teardown::Shutdown => write!(f, "server shutting down"),
            Teardown::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

/// Drive one node connection to completion.
pub async fn run_session(stream: TcpStream, peer: SocketAddr, mut ctx: SessionContext) {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(ctx.config.line_limit()),
    );

    let node = match handshake(&mut lines, &mut writer, &ctx).await {
        Ok(node) => node,
        Err(e) => {
            info!(%peer, error = %e, "session refused");
            return;
        }
    };
    info!(%peer, node = %node, name = ctx.config.node_name(node).unwrap_or("-"), "node connected");

    let (tx, rx) = mpsc::channel(ctx.config.session_queue.max(1));
    let worker = tokio::spawn(process_inbound(node, rx, writer, ctx.clone()));

    let reader_reason = read_loop(&mut lines, &tx, &mut ctx).await;
    drop(tx);

    let reason = match worker.await {
        Ok(Some(worker_reason)) => worker_reason,
        Ok(None) => reader_reason,
        Err(e) => Teardown::Io(e.to_string()),
    };

    ctx.table.remove(node);
    info!(%peer, node = %node, reason = %reason, "node disconnected");
}

async fn handshake(
    lines: &mut NodeLines,
    writer: &mut OwnedWriteHalf,
    ctx: &SessionContext,
) -> Result<NodeId> {
    let first = match timeout(ctx.config.silence_timeout(), lines.next()).await {
        Err(_) => return Err(ServerError::Protocol("no hello before timeout".into())),
        Ok(None) => return Err(ServerError::Protocol("closed before hello".into())),
        Ok(Some(line)) => line?,
    };

    let refuse = |reason: String| ServerMessage::Closing { reason };
    let node = match decode_line::<NodeMessage>(&first) {
        Ok(NodeMessage::Hello { node_id }) => node_id,
        Ok(_) => {
            send(writer, &refuse("expected hello".into())).await?;
            return Err(ServerError::Protocol("first message was not hello".into()));
        }
        Err(e) => {
            send(writer, &refuse(format!("malformed hello: {e}"))).await?;
            return Err(e);
        }
    };

    if !ctx.config.is_registered(node) {
        send(writer, &refuse(format!("unknown node {node}"))).await?;
        return Err(ServerError::Protocol(format!("unregistered node {node}")));
    }
    if !ctx.table.register(node) {
        send(writer, &refuse(format!("{node} already has an active session"))).await?;
        return Err(ServerError::Protocol(format!("duplicate session for {node}")));
    }

    let welcome = ServerMessage::Welcome {
        node_id: node,
        tick_ms: ctx.config.tick_ms,
    };
    if let Err(e) = send(writer, &welcome).await {
        ctx.table.remove(node);
        return Err(e);
    }
    Ok(node)
}

async fn read_loop(
    lines: &mut NodeLines,
    tx: &mpsc::Sender<Inbound>,
    ctx: &mut SessionContext,
) -> Teardown {
    let silence = ctx.config.silence_timeout();
    let limit = ctx.config.line_limit();
    // After a decode error the framed reader yields one `None` before it
    // resumes; that one is not end of stream.
    let mut after_overflow = false;
    loop {
        let next = tokio::select! {
            next = timeout(silence, lines.next()) => next,
            _ = tx.closed() => return Teardown::Eof,
            _ = ctx.shutdown.changed() => return Teardown::Shutdown,
        };
        let inbound = match next {
            Err(_) => return Teardown::SilenceTimeout,
            Ok(None) if after_overflow => {
                after_overflow = false;
                continue;
            }
            Ok(None) => return Teardown::Eof,
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                after_overflow = true;
                Inbound::Malformed(format!("line longer than {limit} bytes"))
            }
            Ok(Some(Err(e))) => return Teardown::Io(e.to_string()),
            Ok(Some(Ok(line))) => {
                after_overflow = false;
                if line.trim().is_empty() {
                    continue;
                }
                match decode_line::<NodeMessage>(&line) {
                    Ok(msg) => Inbound::Message(msg),
                    Err(e) => Inbound::Malformed(e.to_string()),
                }
            }
        };
        if tx.send(inbound).await.is_err() {
            return Teardown::Eof;
        }
    }
}

/// Per-session state owned by the worker.
struct NodeWorker {
    node: NodeId,
    pipeline: Option<Pipeline>,
    last_timestamp: Option<f64>,
    consecutive_malformed: u32,
}

enum Outcome {
    Stored { timestamp: f64, tracks: usize },
    Invalid(String),
    /// Tick aborted and rolled back; not the node's fault.
    Aborted(String),
}

/// Worker loop. Returns `Some(reason)` when the worker ended the session.
async fn process_inbound(
    node: NodeId,
    mut rx: mpsc::Receiver<Inbound>,
    mut writer: OwnedWriteHalf,
    ctx: SessionContext,
) -> Option<Teardown> {
    let mut worker = NodeWorker {
        node,
        pipeline: None,
        last_timestamp: None,
        consecutive_malformed: 0,
    };
    let limit = ctx.config.max_consecutive_malformed.max(1);

    while let Some(inbound) = rx.recv().await {
        let outcome = match inbound {
            Inbound::Malformed(reason) => Outcome::Invalid(reason),
            Inbound::Message(NodeMessage::Bye) => {
                let _ = send(&mut writer, &ServerMessage::Closing { reason: "bye".into() }).await;
                return Some(Teardown::Bye);
            }
            Inbound::Message(NodeMessage::Hello { .. }) => {
                Outcome::Invalid("duplicate hello".into())
            }
            Inbound::Message(NodeMessage::Tracks(snapshot)) => worker.store_tracks(snapshot, &ctx),
            Inbound::Message(NodeMessage::Detections(batch)) => {
                match worker.track_detections(batch, &ctx).await {
                    Ok(outcome) => outcome,
                    Err(e) => return Some(Teardown::Io(e.to_string())),
                }
            }
        };

        let reply = match outcome {
            Outcome::Stored { timestamp, tracks } => {
                worker.consecutive_malformed = 0;
                ServerMessage::Accepted { timestamp, tracks }
            }
            Outcome::Invalid(reason) => {
                worker.consecutive_malformed += 1;
                warn!(
                    node = %node,
                    reason = %reason,
                    consecutive = worker.consecutive_malformed,
                    "rejected batch"
                );
                ServerMessage::Rejected {
                    reason,
                    consecutive_failures: worker.consecutive_malformed,
                }
            }
            Outcome::Aborted(reason) => ServerMessage::Rejected {
                reason,
                consecutive_failures: worker.consecutive_malformed,
            },
        };
        if let Err(e) = send(&mut writer, &reply).await {
            return Some(Teardown::Io(e.to_string()));
        }

        if worker.consecutive_malformed >= limit {
            let closing = ServerMessage::Closing {
                reason: Teardown::TooManyMalformed.to_string(),
            };
            let _ = send(&mut writer, &closing).await;
            return Some(Teardown::TooManyMalformed);
        }
    }
    None
}

impl NodeWorker {
    fn check_order(&self, timestamp: f64) -> std::result::Result<(), ValidationError> {
        match self.last_timestamp {
            Some(last) if timestamp < last => Err(ValidationError::OutOfOrder {
                last,
                got: timestamp,
            }),
            _ => Ok(()),
        }
    }

    fn store_tracks(&mut self, snapshot: TrackSnapshot, ctx: &SessionContext) -> Outcome {
        if snapshot.node_id != self.node {
            return Outcome::Invalid(
                ValidationError::NodeMismatch {
                    expected: self.node,
                    found: snapshot.node_id,
                }
                .to_string(),
            );
        }
        if let Err(e) = snapshot
            .validate(&ctx.config.pipeline.limits)
            .and_then(|_| self.check_order(snapshot.timestamp))
        {
            return Outcome::Invalid(e.to_string());
        }

        self.last_timestamp = Some(snapshot.timestamp);
        let timestamp = snapshot.timestamp;
        let tracks = snapshot.tracks.len();
        ctx.table.publish(self.node, snapshot);
        Outcome::Stored { timestamp, tracks }
    }

    /// Runs the node's tracker on the blocking pool so a large tick never
    /// stalls other sessions or the fusion tick.
    async fn track_detections(
        &mut self,
        batch: DetectionBatch,
        ctx: &SessionContext,
    ) -> Result<Outcome> {
        let mut pipeline = match self.pipeline.take() {
            Some(p) => p,
            None => Pipeline::new(self.node, ctx.config.pipeline.clone()),
        };

        let (pipeline, result) = tokio::task::spawn_blocking(move || {
            let result = pipeline.tick(&batch);
            (pipeline, result)
        })
        .await?;

        let outcome = match result {
            Ok(out) => {
                let snapshot = pipeline.snapshot();
                let timestamp = snapshot.timestamp;
                self.last_timestamp = Some(timestamp);
                ctx.table
                    .publish_with_stats(self.node, snapshot, Some(pipeline.stats().clone()));
                if out.dropped_detections > 0 {
                    warn!(
                        node = %self.node,
                        dropped = out.dropped_detections,
                        total = pipeline.stats().dropped_detections,
                        "detection cap exceeded"
                    );
                }
                debug!(node = %self.node, tracks = out.tracks.len(), us = out.total_time_us, "tick");
                Outcome::Stored {
                    timestamp,
                    tracks: out.tracks.len(),
                }
            }
            Err(TrackerError::Validation(e)) => {
                ctx.table.set_stats(self.node, pipeline.stats().clone());
                Outcome::Invalid(e.to_string())
            }
            Err(e) => {
                ctx.table.set_stats(self.node, pipeline.stats().clone());
                ctx.table.touch(self.node);
                Outcome::Aborted(e.to_string())
            }
        };
        self.pipeline = Some(pipeline);
        Ok(outcome)
    }
}

async fn send(writer: &mut OwnedWriteHalf, msg: &ServerMessage) -> Result<()> {
    writer.write_all(encode_line(msg)?.as_bytes()).await?;
    Ok(())
}
