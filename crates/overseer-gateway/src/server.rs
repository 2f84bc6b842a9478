use crate::api;
use crate::router::MessageRouter;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use overseer_orchestrator::{Engine, WorkerDirective};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Shared application state.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub router: Arc<MessageRouter>,
}

/// The main gateway server.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the full HTTP surface around `engine`.
    pub fn build(engine: Arc<Engine>) -> Router {
        let router = Arc::new(MessageRouter::new(Arc::clone(&engine)));
        let state = Arc::new(AppState { engine, router });

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/ws/agent/{agent_id}", get(worker_ws_handler))
            .route("/health", get(health_handler))
            .merge(api::routes())
            .with_state(state)
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.engine.snapshot();
    Json(serde_json::json!({
        "status": "ok",
        "service": "overseer",
        "mode": snapshot.mode,
        "agents": snapshot.agents.len(),
        "tasks": snapshot.tasks.len(),
        "observers": state.engine.observer_count(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_observer_socket(socket, state))
}

async fn handle_observer_socket(socket: WebSocket, state: Arc<AppState>) {
    let (session_id, mut rx) = state.engine.connect_observer();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    info!(session_id = %session_id, "Observer connected");

    // Ends when the engine drops the session, which closes the socket.
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Failed to encode server event");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let router = Arc::clone(&state.router);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => router.handle_observer_message(session_id, text.as_str()),
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.engine.disconnect_observer(session_id);
    info!(session_id = %session_id, "Observer disconnected");
}

async fn worker_ws_handler(
    ws: WebSocketUpgrade,
    Path(agent_id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Err(e) = state.engine.agent(agent_id) {
        warn!(agent_id = %agent_id, error = %e, "Refusing worker link");
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response();
    }
    ws.on_upgrade(move |socket| handle_worker_socket(socket, agent_id, state))
}

async fn handle_worker_socket(socket: WebSocket, agent_id: Uuid, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerDirective>();

    let link_id = match state.engine.attach_worker(agent_id, tx) {
        Ok(link_id) => link_id,
        Err(e) => {
            warn!(agent_id = %agent_id, error = %e, "Worker link rejected");
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };
    info!(agent_id = %agent_id, link_id = %link_id, "Worker linked");

    // Ends when the engine drops the link, e.g. once the agent is stopped.
    let mut send_task = tokio::spawn(async move {
        while let Some(directive) = rx.recv().await {
            let json = match serde_json::to_string(&directive) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Failed to encode worker directive");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let router = Arc::clone(&state.router);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => router.handle_worker_message(agent_id, text.as_str()),
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.engine.detach_worker(agent_id, link_id);
    info!(agent_id = %agent_id, link_id = %link_id, "Worker link closed");
}
