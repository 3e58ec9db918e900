use crate::descriptor::{is_cluster_worker, ProcessDescriptor};
use crate::engine::Engine;
use crate::error::Error;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

/// HTTP surface of the supervisor. Routing is thin; every handler delegates
/// to the engine and maps its error kinds onto status codes.
pub fn router(engine: Arc<Engine>) -> Router {
    let state = AppState { engine };
    Router::new()
        .route("/processes", get(list_processes).post(create_process))
        .route("/processes/:name", get(get_process).delete(delete_process))
        .route("/processes/:name/restart", post(restart_process))
        .route("/processes/:name/logs/:stream", get(get_logs))
        .route("/processes/:name/shell", get(shell_ws))
        .route("/clusters", get(list_clusters))
        .route("/clusters/:name", get(get_cluster))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind and serve until SIGTERM/SIGINT.
pub async fn serve(engine: Arc<Engine>, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;
    info!("api listening on {addr}");
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("api server: {e}"))
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("SIGINT handler");
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
    info!("shutdown signal received");
}

// ---------------- error mapping ----------------

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::PreconditionFailed(_) => StatusCode::CONFLICT,
            // Name collisions deliberately surface as 500 with the message.
            Error::AlreadyExists(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Os { .. } | Error::Hook { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ---------------- handlers ----------------

async fn list_processes(State(st): State<AppState>) -> impl IntoResponse {
    let mut out = vec![];
    for record in st.engine.list().await {
        if is_cluster_worker(&record.desc.name) {
            continue;
        }
        out.push(record.snapshot());
    }
    Json(out)
}

async fn create_process(
    State(st): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    // Schema mismatches must answer 400, not axum's 422.
    let desc: ProcessDescriptor = serde_json::from_value(body)
        .map_err(|e| Error::InvalidArgument(format!("invalid process body: {e}")))?;
    let snapshot = st.engine.start(desc).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn get_process(
    State(st): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = st.engine.get(&name).await?;
    Ok(Json(record.snapshot()))
}

async fn delete_process(
    State(st): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let force = params.get("force").map(|v| v == "true" || v == "1").unwrap_or(false);
    st.engine.stop(&name, force).await?;
    Ok(Json(json!({ "status": "stopped" })))
}

async fn restart_process(
    State(st): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    // Existence check up front; the stop/delay/start sequence runs in the
    // background so the handler answers promptly.
    st.engine.get(&name).await?;
    let engine = Arc::clone(&st.engine);
    tokio::spawn(async move {
        if let Err(e) = engine.restart(&name).await {
            warn!("restart {name}: {e}");
        }
    });
    Ok(Json(json!({ "status": "restarting" })))
}

async fn get_logs(
    State(st): State<AppState>,
    Path((name, stream)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let lines = params
        .get("lines")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(100);
    let lines = st.engine.logs(&name, &stream, lines).await?;
    Ok(Json(json!({ "logs": lines })))
}

async fn list_clusters(State(st): State<AppState>) -> impl IntoResponse {
    let mut out = vec![];
    for record in st.engine.list().await {
        if record.is_cluster_master() {
            out.push(record.snapshot());
        }
    }
    Json(out)
}

async fn get_cluster(
    State(st): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = st.engine.get(&name).await?;
    if !record.is_cluster_master() {
        return Err(ApiError(Error::InvalidArgument(format!(
            "{name} is not a cluster"
        ))));
    }
    Ok(Json(record.snapshot()))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ---------------- shell websocket ----------------

#[derive(Debug, Deserialize)]
struct ResizeFrame {
    resize: ResizeHint,
}

#[derive(Debug, Deserialize)]
struct ResizeHint {
    rows: u16,
    cols: u16,
}

async fn shell_ws(
    State(st): State<AppState>,
    Path(name): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_shell(socket, st, name))
}

/// Binary frames ferry PTY bytes in both directions; a text frame carrying
/// `{"resize":{"rows":R,"cols":C}}` adjusts the window out of band.
async fn handle_shell(mut socket: WebSocket, st: AppState, name: String) {
    let session = match st.engine.attach_shell(&name).await {
        Ok(s) => s,
        Err(e) => {
            let _ = socket.send(Message::Text(format!("error: {e}"))).await;
            return;
        }
    };

    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            read = session.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if socket.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if session.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(frame) = serde_json::from_str::<ResizeFrame>(&text) {
                            let _ = session.resize(frame.resize.rows, frame.resize.cols);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
    let _ = st.engine.detach_shell(&name).await;
}
