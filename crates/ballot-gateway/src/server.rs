//! Gateway WebSocket server: Axum-based HTTP + WS server

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use ballot_core::{AnswerPipeline, AnswerRequest, PipelineError};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::events::{EventBus, forward_health};
use crate::protocol::{
    self, AskParams, CancelParams, ERR_INTERNAL, ERR_INVALID_METHOD, ERR_INVALID_PARAMS,
    GatewayRequest, GatewayResponse,
};

/// Outbound messages buffered per client before answers start waiting
const OUTBOUND_CAPACITY: usize = 256;

/// Shared state for all WebSocket connections
#[derive(Clone)]
pub struct GatewayState {
    pub pipeline: Arc<AnswerPipeline>,
    pub events: EventBus,
    pub start_time: std::time::Instant,
}

/// The gateway server
pub struct GatewayServer {
    state: GatewayState,
    bind: SocketAddr,
}

impl GatewayServer {
    pub fn new(bind: SocketAddr, pipeline: Arc<AnswerPipeline>) -> Self {
        let state = GatewayState {
            pipeline,
            events: EventBus::new(256),
            start_time: std::time::Instant::now(),
        };
        Self { state, bind }
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/api/status", get(status_handler))
            .route("/api/providers", get(providers_handler))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Start the server (blocks until shutdown)
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind)
            .await
            .with_context(|| format!("Failed to bind gateway to {}", self.bind))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let forwarder = forward_health(
            self.state.pipeline.router().health(),
            self.state.events.clone(),
        );
        info!("Gateway listening on {}", listener.local_addr()?);

        let result = axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await;
        forwarder.abort();
        result?;
        Ok(())
    }
}

// ── HTTP Handlers ──

fn status_json(state: &GatewayState) -> serde_json::Value {
    let health = state.pipeline.router().health().snapshot();
    let available = health
        .iter()
        .filter(|h| h.status == ballot_core::HealthStatus::Available)
        .count();
    serde_json::json!({
        "status": "ok",
        "connected_clients": state.events.subscriber_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "providers": health.len(),
        "providers_available": available,
    })
}

fn providers_json(state: &GatewayState) -> serde_json::Value {
    let router = state.pipeline.router();
    serde_json::json!({
        "providers": router.health().snapshot(),
        "models": router.registry().models(),
    })
}

async fn status_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    axum::Json(status_json(&state))
}

async fn providers_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    axum::Json(providers_json(&state))
}

// ── WebSocket Handler ──

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    info!("WebSocket connection from {}", addr);
    ws.on_upgrade(move |socket| handle_ws(socket, state, addr))
}

async fn handle_ws(socket: WebSocket, state: GatewayState, addr: SocketAddr) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
    let connection = Arc::new(Connection::new(outbound_tx));
    let mut event_rx = state.events.subscribe();

    // Single writer: responses and answer events for this client, plus broadcasts
    let send_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                message = outbound_rx.recv() => match message {
                    Some(text) => text,
                    None => break,
                },
                event = event_rx.recv() => match event {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(j) => j,
                        Err(e) => {
                            error!("Failed to serialize event: {}", e);
                            continue;
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} lagged by {} events", addr, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Process incoming messages from this client
    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                debug!("Client {} sent close", addr);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("WebSocket error from {}: {}", addr, e);
                break;
            }
        };

        let (response, answer) = handle_request(&state, &connection, msg.as_str()).await;
        let cancel = match &answer {
            Some(request) => Some(connection.begin_answer(&request.id).await),
            None => None,
        };
        if connection.send(&response).await.is_err() {
            break;
        }
        if let (Some(request), Some(cancel)) = (answer, cancel) {
            spawn_answer(state.pipeline.clone(), connection.clone(), request, cancel);
        }
    }

    connection.close();
    send_task.abort();
    info!("Client {} disconnected", addr);
}

/// Run one answer in the background, streaming into the connection
fn spawn_answer(
    pipeline: Arc<AnswerPipeline>,
    connection: Arc<Connection>,
    request: AnswerRequest,
    cancel: tokio_util::sync::CancellationToken,
) {
    tokio::spawn(async move {
        match pipeline.answer(&request, connection.as_ref(), cancel).await {
            Ok(summary) => debug!(
                "Answer {} done: {} chunks from {}",
                summary.request_id, summary.chunks, summary.model
            ),
            Err(PipelineError::Cancelled) => debug!("Answer {} cancelled", request.id),
            Err(e) => warn!("Answer {} failed: {}", request.id, e),
        }
        connection.finish_answer(&request.id).await;
    });
}

/// Handle one client message. `question.ask` hands back the request to run
/// once its acknowledgement has been queued.
async fn handle_request(
    state: &GatewayState,
    connection: &Connection,
    raw: &str,
) -> (GatewayResponse, Option<AnswerRequest>) {
    let req: GatewayRequest = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => {
            return (
                GatewayResponse::err(None, ERR_INVALID_PARAMS, format!("Invalid JSON: {}", e)),
                None,
            );
        }
    };

    let id = req.id.clone();

    let response = match req.method.as_str() {
        protocol::methods::QUESTION_ASK => {
            let params: AskParams = match serde_json::from_value(req.params) {
                Ok(p) => p,
                Err(e) => {
                    return (
                        GatewayResponse::err(id, ERR_INVALID_PARAMS, format!("Invalid params: {}", e)),
                        None,
                    );
                }
            };
            match params.into_request() {
                Ok(request) => {
                    let response = GatewayResponse::ok(
                        id,
                        serde_json::json!({ "request_id": request.id }),
                    );
                    return (response, Some(request));
                }
                Err(message) => GatewayResponse::err(id, ERR_INVALID_PARAMS, message),
            }
        }

        protocol::methods::ANSWER_CANCEL => {
            match serde_json::from_value::<CancelParams>(req.params) {
                Ok(params) => {
                    let cancelled = connection.cancel_answer(&params.request_id).await;
                    GatewayResponse::ok(id, serde_json::json!({ "cancelled": cancelled }))
                }
                Err(e) => GatewayResponse::err(id, ERR_INVALID_PARAMS, format!("Invalid params: {}", e)),
            }
        }

        protocol::methods::STATUS_GET => {
            let mut status = status_json(state);
            status["in_flight"] = connection.in_flight().await.into();
            GatewayResponse::ok(id, status)
        }

        protocol::methods::PROVIDERS_HEALTH => {
            match serde_json::to_value(state.pipeline.router().health().snapshot()) {
                Ok(value) => GatewayResponse::ok(id, value),
                Err(e) => GatewayResponse::err(id, ERR_INTERNAL, e.to_string()),
            }
        }

        _ => GatewayResponse::err(
            id,
            ERR_INVALID_METHOD,
            format!("Unknown method: {}", req.method),
        ),
    };
    (response, None)
}
