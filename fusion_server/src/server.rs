//! Fusion server: node listener, fusion tick and subscriber endpoints.

use crate::{
    config::ServerConfig,
    error::Result,
    publisher::Publisher,
    session::{run_session, SessionContext},
    snapshot_table::{NodeStatus, SnapshotTable},
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::TcpListener,
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use tracker_core::{FusedTrackSnapshot, FusionAggregator};

/// Stops a running server. Cheap to clone.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

#[derive(Clone)]
struct AppState {
    table: Arc<SnapshotTable>,
    publisher: Arc<Publisher>,
}

pub struct FusionServer {
    config: Arc<ServerConfig>,
    node_listener: TcpListener,
    http_listener: TcpListener,
    table: Arc<SnapshotTable>,
    publisher: Arc<Publisher>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl FusionServer {
    /// Bind both listeners. Port 0 in the config picks a free port.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let node_listener = TcpListener::bind(config.node_listen).await?;
        let http_listener = TcpListener::bind(config.http_listen).await?;
        let publisher = Arc::new(Publisher::new(config.subscriber_queue));
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            node_listener,
            http_listener,
            table: Arc::new(SnapshotTable::new()),
            publisher,
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    pub fn node_addr(&self) -> Result<SocketAddr> {
        Ok(self.node_listener.local_addr()?)
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        Ok(self.http_listener.local_addr()?)
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        Arc::clone(&self.publisher)
    }

    pub fn table(&self) -> Arc<SnapshotTable> {
        Arc::clone(&self.table)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown_tx))
    }

    /// Run until shut down.
    pub async fn run(self) -> Result<()> {
        let node_addr = self.node_addr()?;
        let http_addr = self.http_addr()?;
        info!(%node_addr, %http_addr, tick_ms = self.config.tick_ms, "fusion server running");

        let ctx = SessionContext {
            config: Arc::clone(&self.config),
            table: Arc::clone(&self.table),
            shutdown: self.shutdown_tx.subscribe(),
        };
        let accept = tokio::spawn(accept_loop(self.node_listener, ctx));
        let tick = tokio::spawn(fusion_tick_task(
            Arc::clone(&self.config),
            Arc::clone(&self.table),
            Arc::clone(&self.publisher),
            self.shutdown_tx.subscribe(),
        ));

        let app = router(AppState {
            table: Arc::clone(&self.table),
            publisher: Arc::clone(&self.publisher),
        });
        let mut http_shutdown = self.shutdown_tx.subscribe();
        let serve = axum::serve(self.http_listener, app).with_graceful_shutdown(async move {
            let _ = http_shutdown.wait_for(|stop| *stop).await;
        });
        if let Err(e) = serve.await {
            error!(error = %e, "http server failed");
            self.shutdown_tx.send_replace(true);
        }

        join_quietly("accept loop", accept).await;
        join_quietly("fusion tick", tick).await;
        info!("fusion server stopped");
        Ok(())
    }
}

async fn join_quietly(name: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        warn!(task = name, error = %e, "task ended abnormally");
    }
}

async fn accept_loop(listener: TcpListener, ctx: SessionContext) {
    let mut shutdown = ctx.shutdown.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "node connection");
                    tokio::spawn(run_session(stream, peer, ctx.clone()));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }
}

/// Fixed-period fusion tick: live snapshots → fuse → publish.
async fn fusion_tick_task(
    config: Arc<ServerConfig>,
    table: Arc<SnapshotTable>,
    publisher: Arc<Publisher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut aggregator = FusionAggregator::new(config.fusion.clone());
    let mut ticker = interval(config.tick_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
        let live = table.collect_live(config.silence_timeout());
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let snapshot = aggregator.snapshot(&live, now);
        match publisher.publish(&snapshot) {
            Ok(delivered) => debug!(
                seq = snapshot.seq,
                nodes = live.len(),
                fused = snapshot.tracks.len(),
                delivered,
                "published"
            ),
            Err(e) => error!(error = %e, "failed to publish fused snapshot"),
        }
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/fused", get(ws_fused_handler))
        .route("/api/v1/fused", get(latest_fused))
        .route("/api/v1/nodes", get(node_status))
        .route("/health", get(health))
        .with_state(state)
}

// ── WebSocket handler ────────────────────────────────────────────────────────

async fn ws_fused_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_subscriber(socket, state))
}

async fn handle_subscriber(socket: WebSocket, state: AppState) {
    let mut sub = state.publisher.subscribe();
    let (mut sender, mut receiver) = socket.split();
    info!(subscriber = sub.id, "subscriber connected");

    loop {
        tokio::select! {
            msg = sub.rx.recv() => match msg {
                Some(json) => {
                    if sender.send(Message::Text(json.to_string())).await.is_err() {
                        break;
                    }
                }
                // Dropped by the publisher (queue overflow).
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                _ => {}
            },
        }
    }

    state.publisher.unsubscribe(sub.id);
    info!(subscriber = sub.id, "subscriber disconnected");
}

// ── REST endpoints ───────────────────────────────────────────────────────────

async fn latest_fused(State(state): State<AppState>) -> impl IntoResponse {
    let body = match state.publisher.latest() {
        Some(json) => json.to_string(),
        None => serde_json::to_string(&FusedTrackSnapshot::default()).unwrap_or_default(),
    };
    ([(header::CONTENT_TYPE, "application/json")], body)
}

async fn node_status(State(state): State<AppState>) -> Json<Vec<NodeStatus>> {
    Json(state.table.status())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "nodes": state.table.nodes(),
        "dropped_detections": state.table.dropped_detections(),
        "subscribers": state.publisher.subscriber_count(),
        "seq": state.publisher.latest_seq(),
    }))
}
