//! Duplex client connections: one read loop and one write loop per socket,
//! bridged through the connection pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::AppState;
use crate::chat::{ChatRequest, Delta, JobSink};
use crate::notify::{JobReport, NotifyDispatcher, NotifyTarget, out_of_credit};
use crate::pool::{BroadcastHandler, Connection, ConnectionPool, PoolObserver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsCommand {
    /// Echo `data` back to the group as `test-back`.
    Test,
    /// Start a chat job.
    Create,
    /// Cancel the connection's jobs.
    Stop,
}

#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub gid: String,
    pub cmd: WsCommand,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl InboundMessage {
    /// Frames are trimmed and have newlines flattened before decoding.
    pub fn decode(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(&raw.trim().replace('\n', " "))
    }
}

#[derive(Serialize)]
struct OutboundMessage<'a, T: Serialize> {
    cmd: &'a str,
    data: T,
}

fn encode<T: Serialize>(cmd: &str, data: T) -> Option<String> {
    match serde_json::to_string(&OutboundMessage { cmd, data }) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::error!(cmd, error = %e, "failed to encode outbound message");
            None
        }
    }
}

/// Body of `/ws/push`, routed by [`GroupRouter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    pub gid: String,
    pub cmd: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Delivers pushed messages to the group they name.
pub struct GroupRouter;

#[async_trait]
impl BroadcastHandler for GroupRouter {
    async fn dispatch(&self, pool: &ConnectionPool, payload: &[u8]) {
        let message: PushMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable push");
                return;
            }
        };
        let Some(text) = encode(&message.cmd, &message.data) else {
            return;
        };
        let delivered = pool.send_to(&message.gid, text).await;
        tracing::debug!(gid = %message.gid, cmd = %message.cmd, delivered, "push routed");
    }
}

pub struct ConnectionLogger;

#[async_trait]
impl PoolObserver for ConnectionLogger {
    async fn on_attach(&self, group_id: &str, connection_id: &str) {
        tracing::info!(group_id, connection_id, "connection attached");
    }

    async fn on_detach(&self, group_id: &str, connection_id: &str) {
        tracing::info!(group_id, connection_id, "connection detached");
    }
}

/// Routes one job's output to its connection's group and its webhooks.
pub struct ConnectionSink {
    pool: Arc<ConnectionPool>,
    notifier: Arc<NotifyDispatcher>,
    group_id: String,
    cancel: CancellationToken,
    target: NotifyTarget,
}

impl ConnectionSink {
    pub fn new(
        pool: Arc<ConnectionPool>,
        notifier: Arc<NotifyDispatcher>,
        connection: &Connection,
        request: &ChatRequest,
    ) -> Self {
        Self {
            pool,
            notifier,
            group_id: connection.group_id.clone(),
            cancel: connection.cancel_token().clone(),
            target: NotifyTarget {
                callback_url: request.notify_url.clone(),
                web_hook: (request.is3rd && !request.web_hook.is_empty())
                    .then(|| request.web_hook.clone()),
            },
        }
    }

    async fn send<T: Serialize>(&self, cmd: &str, data: T) {
        if let Some(text) = encode(cmd, data) {
            self.pool.send_to(&self.group_id, text).await;
        }
    }
}

#[async_trait]
impl JobSink for ConnectionSink {
    async fn on_delta(&self, delta: Delta) {
        self.send("create", &delta).await;
    }

    async fn on_error(&self, message: String) {
        self.send("error", &message).await;
    }

    /// Reports go out in order: the callback is awaited before the job moves
    /// on, so an out-of-credit answer cancels it before the next variant.
    async fn on_complete(&self, report: JobReport) {
        if let Some(hook) = self.target.web_hook.clone() {
            let notifier = self.notifier.clone();
            let report = report.clone();
            tokio::spawn(async move { notifier.notify_third_party(&hook, &report).await });
        }

        let Some(response) = self.notifier.notify(&self.target.callback_url, &report).await else {
            return;
        };
        if out_of_credit(&response) && !self.cancel.is_cancelled() {
            tracing::info!(group_id = %self.group_id, "user has no credit left, canceling");
            self.cancel.cancel();
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    gid: Option<String>,
}

/// GET /ws?gid=...: joins `gid`, or a fresh group when absent.
pub async fn upgrade(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let stats = state.pool.stats().await;
    if stats.connection_count >= state.config.ws.max_connections {
        tracing::warn!(connections = stats.connection_count, "connection limit reached");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error", "error": "too many connections" })),
        )
            .into_response();
    }

    let group_id = query
        .gid
        .filter(|g| !g.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, group_id))
}

#[tracing::instrument(skip_all, fields(group_id = %group_id))]
async fn handle_socket(socket: WebSocket, state: AppState, group_id: String) {
    let (conn, outbound) = Connection::new(group_id, state.config.ws.outbound_capacity);
    state.pool.attach(conn.clone()).await;

    let (ws_sink, ws_stream) = socket.split();
    let writer = tokio::spawn(write_loop(
        ws_sink,
        outbound,
        conn.clone(),
        state.config.ws.ping_period,
        state.config.ws.write_wait,
    ));

    read_loop(ws_stream, &state, &conn).await;

    conn.close();
    if let Err(e) = writer.await {
        tracing::warn!(error = %e, "ws writer task failed");
    }
    state.pool.detach(&conn.group_id, &conn.connection_id).await;
    tracing::info!(
        connection_id = %conn.connection_id,
        connected_secs = (chrono::Utc::now() - conn.attached_at).num_seconds(),
        "ws disconnected"
    );
}

async fn read_loop(mut ws_stream: SplitStream<WebSocket>, state: &AppState, conn: &Arc<Connection>) {
    loop {
        let msg = tokio::select! {
            _ = conn.closed().cancelled() => break,
            msg = ws_stream.next() => msg,
        };
        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "ws read failed");
                break;
            }
        };

        match InboundMessage::decode(text.as_str()) {
            Ok(inbound) => dispatch(state, conn, inbound).await,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable ws message");
                if let Some(reply) = encode("error", format!("invalid message: {e}")) {
                    state.pool.send_to(&conn.group_id, reply).await;
                }
            }
        }
    }
}

async fn dispatch(state: &AppState, conn: &Arc<Connection>, inbound: InboundMessage) {
    match inbound.cmd {
        WsCommand::Test => {
            if let Some(reply) = encode("test-back", &inbound.data) {
                state.pool.send_to(&conn.group_id, reply).await;
            }
        }
        WsCommand::Create => {
            let request = ChatRequest::from_data(&inbound.data);
            let sink = Arc::new(ConnectionSink::new(
                state.pool.clone(),
                state.notifier.clone(),
                conn,
                &request,
            ));
            let orchestrator = state.orchestrator.clone();
            let cancel = conn.cancel_token().clone();
            tokio::spawn(async move {
                orchestrator.run(request, cancel, sink).await;
            });
        }
        WsCommand::Stop => {
            tracing::info!(gid = %inbound.gid, "stop requested");
            conn.cancel_token().cancel();
        }
    }
}

/// Drains the outbound queue and keeps the socket alive with pings. Exits,
/// closing the connection, on cancellation, close or a failed write.
async fn write_loop(
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    conn: Arc<Connection>,
    ping_period: Duration,
    write_wait: Duration,
) {
    let mut ticker = tokio::time::interval(ping_period);
    ticker.tick().await;

    loop {
        let message = tokio::select! {
            _ = conn.closed().cancelled() => break,
            _ = conn.cancel_token().cancelled() => break,
            _ = ticker.tick() => Message::Ping(Bytes::new()),
            next = outbound.recv() => match next {
                Some(text) => Message::Text(text.into()),
                None => break,
            },
        };

        match tokio::time::timeout(write_wait, ws_sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "ws write failed");
                break;
            }
            Err(_) => {
                tracing::warn!("ws write timed out");
                break;
            }
        }
    }

    let _ = tokio::time::timeout(write_wait, ws_sink.close()).await;
    conn.close();
}
