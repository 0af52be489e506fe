//! HTTP and websocket surface
//!
//! Routes are split into a public group (login only) and a private group
//! gated on [`require_session`], which also transparently rotates a
//! near-expiry session token. The private group covers workspace
//! management, process lifecycle, and the two websocket upgrades: live
//! process updates and interactive terminal attach.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::AuthStore;
use crate::error::{AppError, AppResult};
use crate::live::LiveViewMultiplexer;
use crate::pty::TerminalSession;
use crate::security::{self, ConnectionTracker};
use crate::supervisor::Supervisor;
use crate::workspace::{Workspace, WorkspaceRegistry, WorkspaceUpdate};

#[derive(Clone)]
pub struct AppState {
    pub auth: AuthStore,
    pub workspaces: WorkspaceRegistry,
    pub supervisor: Supervisor,
    pub live: LiveViewMultiplexer,
    pub mobileshell_binary: PathBuf,
    pub terminals: Arc<dashmap::DashMap<String, TerminalSession>>,
    pub connections: ConnectionTracker,
}

impl axum::extract::FromRef<AppState> for AuthStore {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/login", post(login))
        .route("/api/logout", post(logout));

    let private = Router::new()
        .route("/api/workspaces", get(list_workspaces).post(create_workspace))
        .route("/api/workspaces/:workspace_id", get(get_workspace).patch(update_workspace))
        .route(
            "/api/workspaces/:workspace_id/processes",
            get(list_processes).post(launch_process),
        )
        .route("/api/workspaces/:workspace_id/processes/:process_id", get(get_process))
        .route(
            "/api/workspaces/:workspace_id/processes/:process_id/output",
            get(get_process_output),
        )
        .route(
            "/api/workspaces/:workspace_id/processes/:process_id/raw",
            get(get_process_raw),
        )
        .route(
            "/api/workspaces/:workspace_id/processes/:process_id/stdin",
            post(send_stdin),
        )
        .route(
            "/api/workspaces/:workspace_id/processes/:process_id/signal",
            post(send_signal),
        )
        .route(
            "/api/workspaces/:workspace_id/processes/:process_id/terminal",
            get(attach_terminal),
        )
        .route("/ws/process-updates/:workspace_id", get(ws_process_updates))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), require_session));

    public
        .merge(private)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Validates the session cookie on every private route and, when the
/// token is nearing expiry, mints a replacement and rewrites the outgoing
/// `Set-Cookie` so an actively-used session never has to re-authenticate.
/// The old token is left registered and independently valid until its own
/// expiry — see [`AuthStore::extend_session`].
async fn require_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let Some(token) = extract_cookie(&headers) else {
        return (StatusCode::UNAUTHORIZED, "missing session cookie").into_response();
    };
    if !state.auth.session_is_valid(&token) {
        return (StatusCode::UNAUTHORIZED, "invalid or expired session").into_response();
    }

    let mut response = next.run(request).await;

    if state.auth.session_needs_extension(&token) {
        if let Ok(Some(new_token)) = state.auth.extend_session(&token) {
            let cookie = format!(
                "{}={}; HttpOnly; SameSite=Strict; Path=/",
                crate::auth::session_cookie_name(),
                new_token
            );
            if let Ok(value) = cookie.parse() {
                response.headers_mut().insert(axum::http::header::SET_COOKIE, value);
            }
        }
    }

    response
}

#[derive(Deserialize)]
struct LoginRequest {
    password: String,
}

async fn login(State(state): State<AppState>, Json(body): Json<LoginRequest>) -> AppResult<impl IntoResponse> {
    if !state.auth.password_is_valid(&body.password) {
        return Err(AppError::Authentication);
    }
    let token = state.auth.create_session().map_err(AppError::Internal)?;
    let cookie = format!(
        "{}={}; HttpOnly; SameSite=Strict; Path=/",
        crate::auth::session_cookie_name(),
        token
    );
    let mut headers = HeaderMap::new();
    headers.insert(axum::http::header::SET_COOKIE, cookie.parse().unwrap());
    Ok((headers, Json(serde_json::json!({ "ok": true }))))
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> AppResult<impl IntoResponse> {
    if let Some(token) = extract_cookie(&headers) {
        state.auth.revoke_session(&token).map_err(AppError::Internal)?;
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}

fn extract_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let pair = pair.trim();
        let (name, value) = pair.split_once('=')?;
        if name == crate::auth::session_cookie_name() {
            Some(value.to_string())
        } else {
            None
        }
    })
}

#[derive(Deserialize)]
struct CreateWorkspaceRequest {
    name: String,
    directory: PathBuf,
    pre_command: Option<String>,
    default_terminal_command: Option<String>,
}

async fn list_workspaces(State(state): State<AppState>) -> AppResult<Json<Vec<Workspace>>> {
    Ok(Json(state.workspaces.list().map_err(AppError::Internal)?))
}

async fn create_workspace(
    State(state): State<AppState>,
    Json(body): Json<CreateWorkspaceRequest>,
) -> AppResult<Json<Workspace>> {
    let workspace = state
        .workspaces
        .create(&body.name, body.directory, body.pre_command, body.default_terminal_command)
        .map_err(AppError::Internal)?;
    Ok(Json(workspace))
}

async fn get_workspace(
    State(state): State<AppState>,
    AxumPath(workspace_id): AxumPath<String>,
) -> AppResult<Json<Workspace>> {
    state
        .workspaces
        .get(&workspace_id)
        .map(Json)
        .map_err(|_| AppError::NotFound(format!("workspace {workspace_id} not found")))
}

#[derive(Deserialize, Default)]
struct UpdateWorkspaceRequest {
    name: Option<String>,
    directory: Option<PathBuf>,
    pre_command: Option<Option<String>>,
    default_terminal_command: Option<Option<String>>,
}

async fn update_workspace(
    State(state): State<AppState>,
    AxumPath(workspace_id): AxumPath<String>,
    Json(body): Json<UpdateWorkspaceRequest>,
) -> AppResult<Json<Workspace>> {
    let update = WorkspaceUpdate {
        name: body.name,
        directory: body.directory,
        pre_command: body.pre_command,
        default_terminal_command: body.default_terminal_command,
    };
    state
        .workspaces
        .update(&workspace_id, update)
        .map(Json)
        .map_err(|_| AppError::NotFound(format!("workspace {workspace_id} not found")))
}

#[derive(Deserialize)]
struct LaunchRequest {
    command: String,
    /// Optional content-type hint (e.g. `markdown`) for commands whose
    /// output shouldn't be sniffed by the launcher.
    content_type_hint: Option<String>,
}

async fn launch_process(
    State(state): State<AppState>,
    AxumPath(workspace_id): AxumPath<String>,
    Json(body): Json<LaunchRequest>,
) -> AppResult<impl IntoResponse> {
    if body.command.trim().is_empty() {
        return Err(AppError::Validation("command must not be empty".to_string()));
    }

    let info = state
        .supervisor
        .execute_with_hint(
            &workspace_id,
            &body.command,
            body.content_type_hint.as_deref(),
            &state.mobileshell_binary,
        )
        .await
        .map_err(AppError::Internal)?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn list_processes(
    State(state): State<AppState>,
    AxumPath(workspace_id): AxumPath<String>,
) -> AppResult<impl IntoResponse> {
    let processes = state.supervisor.list_processes(&workspace_id).map_err(AppError::Internal)?;
    Ok(Json(processes))
}

async fn get_process(
    State(state): State<AppState>,
    AxumPath((workspace_id, process_id)): AxumPath<(String, String)>,
) -> AppResult<impl IntoResponse> {
    state
        .supervisor
        .get_process(&workspace_id, &process_id)
        .map(Json)
        .map_err(|_| AppError::NotFound(format!("process {process_id} not found")))
}

async fn get_process_output(
    State(state): State<AppState>,
    AxumPath((workspace_id, process_id)): AxumPath<(String, String)>,
) -> AppResult<impl IntoResponse> {
    let dir = state.workspaces.workspace_dir(&workspace_id);
    let pd = crate::process::dir::ProcessDir::new(dir, &workspace_id, &process_id);
    if !pd.exists() {
        return Err(AppError::NotFound(format!("process {process_id} not found")));
    }
    let streams = pd.read_all().map_err(AppError::Internal)?;
    Ok(Json(serde_json::json!({
        "stdout": String::from_utf8_lossy(&streams.stdout),
        "stderr": String::from_utf8_lossy(&streams.stderr),
        "stdin": String::from_utf8_lossy(&streams.stdin),
    })))
}

async fn get_process_raw(
    State(state): State<AppState>,
    AxumPath((workspace_id, process_id)): AxumPath<(String, String)>,
) -> AppResult<impl IntoResponse> {
    let dir = state.workspaces.workspace_dir(&workspace_id);
    let pd = crate::process::dir::ProcessDir::new(dir, &workspace_id, &process_id);
    if !pd.exists() {
        return Err(AppError::NotFound(format!("process {process_id} not found")));
    }
    let raw = pd.read_raw_stdout().map_err(AppError::Internal)?;
    let content_type = pd
        .read_output_type()
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let mut headers = HeaderMap::new();
    headers.insert(axum::http::header::CONTENT_TYPE, content_type.parse().unwrap());
    Ok((headers, raw))
}

#[derive(Deserialize)]
struct StdinRequest {
    data: String,
}

async fn send_stdin(
    State(state): State<AppState>,
    AxumPath((workspace_id, process_id)): AxumPath<(String, String)>,
    Json(body): Json<StdinRequest>,
) -> AppResult<impl IntoResponse> {
    state
        .supervisor
        .send_stdin(&workspace_id, &process_id, body.data.as_bytes())
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Deserialize)]
struct SignalRequest {
    signum: i32,
}

async fn send_signal(
    State(state): State<AppState>,
    AxumPath((workspace_id, process_id)): AxumPath<(String, String)>,
    Json(body): Json<SignalRequest>,
) -> AppResult<impl IntoResponse> {
    state
        .supervisor
        .send_signal(&workspace_id, &process_id, body.signum)
        .await
        .map_err(|e| AppError::Validation(e.to_string()))?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn ws_process_updates(
    State(state): State<AppState>,
    AxumPath(workspace_id): AxumPath<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    security::check_same_origin(&headers).map_err(AppError::Validation)?;
    if !state.connections.try_acquire(addr.ip()).await {
        return Err(AppError::Validation("too many open connections from this address".to_string()));
    }
    Ok(ws.on_upgrade(move |socket| handle_process_updates_socket(socket, state, workspace_id, addr)))
}

async fn handle_process_updates_socket(mut socket: WebSocket, state: AppState, workspace_id: String, addr: SocketAddr) {
    let (client_id, mut rx) = state.live.subscribe(&workspace_id);
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
    state.live.unsubscribe(client_id);
    state.connections.release(addr.ip()).await;
}

async fn attach_terminal(
    State(state): State<AppState>,
    AxumPath((workspace_id, process_id)): AxumPath<(String, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    security::check_same_origin(&headers).map_err(AppError::Validation)?;
    if !state.connections.try_acquire(addr.ip()).await {
        return Err(AppError::Validation("too many open connections from this address".to_string()));
    }
    let workspace = state
        .workspaces
        .get(&workspace_id)
        .map_err(|_| AppError::NotFound(format!("workspace {workspace_id} not found")))?;

    Ok(ws.on_upgrade(move |socket| handle_terminal_socket(socket, state, workspace, process_id, addr)))
}

async fn handle_terminal_socket(
    mut socket: WebSocket,
    state: AppState,
    workspace: Workspace,
    process_id: String,
    addr: SocketAddr,
) {
    let existing = state.terminals.get(&process_id).map(|entry| entry.value().clone());
    let session = match existing {
        Some(session) => session,
        None => {
            let command = workspace
                .default_terminal_command
                .clone()
                .unwrap_or_else(|| "/bin/sh".to_string());
            match TerminalSession::spawn(process_id.clone(), &command, &workspace.directory) {
                Ok(session) => {
                    state.terminals.insert(process_id.clone(), session.clone());
                    session
                }
                Err(_) => {
                    state.connections.release(addr.ip()).await;
                    return;
                }
            }
        }
    };

    let generation = session.attach();
    let mut output_rx = session.output_channel(generation);

    loop {
        tokio::select! {
            chunk = output_rx.recv() => {
                let Some(chunk) = chunk else {
                    let _ = socket.send(Message::Text("[Process exited]".to_string())).await;
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    // Only the generation that actually saw the exit retires the
                    // session; a superseded reader hitting EOF on its dup'd fd
                    // must not evict the session a newer viewer is still using.
                    if session.current_generation() == generation {
                        state.terminals.remove(&process_id);
                    }
                    break;
                };
                if socket.send(Message::Binary(chunk)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        if security::validate_message_size(&data, MAX_TERMINAL_MESSAGE_BYTES).is_err() {
                            continue;
                        }
                        let _ = session.write_input(&data).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if security::validate_message_size(text.as_bytes(), MAX_TERMINAL_MESSAGE_BYTES).is_err() {
                            continue;
                        }
                        if let Ok(resize) = serde_json::from_str::<ResizeMessage>(&text) {
                            if security::validate_terminal_dimensions(resize.cols, resize.rows).is_ok() {
                                let _ = session.resize(resize.cols, resize.rows).await;
                            }
                        } else {
                            let _ = session.write_input(text.as_bytes()).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }

        if session.current_generation() != generation {
            break;
        }
    }

    state.connections.release(addr.ip()).await;
}

#[derive(Deserialize)]
struct ResizeMessage {
    cols: u16,
    rows: u16,
}

const MAX_TERMINAL_MESSAGE_BYTES: usize = 1024 * 1024;

pub async fn run_server(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "mobileshell listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl_c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining in-flight requests");
}
