use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use docsession_core::{
    BytesDocument, BytesEngine, DocumentEngine, EnvIdentityProvider, IdentityProvider,
    RecoverableFileInfo, RecoveryStore, SessionError, SessionRegistry, SessionStatus,
};
use docsession_types::{AccessMode, SessionId};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::identity::RequestIdentity;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<DaemonConfig>,
    pub registry: Arc<SessionRegistry>,
    pub recovery: Arc<RecoveryStore>,
    /// Identity used when a request carries no identity headers.
    pub default_identity: Arc<dyn IdentityProvider>,
}

impl AppState {
    pub fn new(
        config: DaemonConfig,
        engine: Arc<dyn DocumentEngine>,
        default_identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.session.clone(), engine));
        let recovery = Arc::new(RecoveryStore::new(&config.session));
        Self {
            config: Arc::new(config),
            registry,
            recovery,
            default_identity,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = usize::try_from(state.config.session.max_file_size_bytes()).unwrap_or(usize::MAX);

    Router::new()
        .route("/healthz", get(healthz))
        // Sessions
        .route("/api/sessions", get(list_sessions).post(open_session))
        .route("/api/sessions/{id}", get(session_status).delete(close_session))
        .route("/api/sessions/{id}/content", get(read_content).put(write_content))
        .route("/api/sessions/{id}/save", post(save_session))
        .route("/api/clients/{client_id}/disconnect", post(disconnect_client))
        // Recovery
        .route("/api/recovery", get(list_recoverable))
        .route("/api/recovery/stats", get(recovery_stats))
        .route("/api/recovery/cleanup", post(cleanup_recovery))
        .route("/api/recovery/{id}", delete(delete_recoverable))
        .route("/api/recovery/{id}/recover", post(recover))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(config: DaemonConfig) -> Result<()> {
    let session = &config.session;
    if session.enabled && session.disconnect_behavior.writes_snapshot() {
        tokio::fs::create_dir_all(&session.temp_dir)
            .await
            .with_context(|| format!("creating temp dir {}", session.temp_dir.display()))?;
    }

    let state = AppState::new(
        config,
        Arc::new(BytesEngine),
        Arc::new(EnvIdentityProvider::default()),
    );

    let background = CancellationToken::new();
    state.registry.spawn_idle_reaper(background.child_token());
    let cleanup = state
        .recovery
        .clone()
        .spawn_cleanup(state.config.session.cleanup_interval, background.child_token());

    let app = router(state.clone());

    info!(addr = %state.config.listen_addr, "docsession-server listening");
    let listener = tokio::net::TcpListener::bind(&state.config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    background.cancel();
    let drained = state.registry.on_server_shutdown().await;
    if let Err(err) = cleanup.await {
        warn!(%err, "recovery cleanup task failed");
    }
    info!(drained, "docsession-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}

// =============================================================================
// Errors
// =============================================================================

/// Session errors rendered as JSON with a matching status code.
#[derive(Debug)]
pub struct ApiError(SessionError);

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        ApiError(err)
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError(SessionError::Task(err))
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            SessionError::SessionNotFound(_) | SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::SnapshotMissing(_) => StatusCode::NOT_FOUND,
            SessionError::Disposed(_) => StatusCode::GONE,
            SessionError::CapacityExceeded { .. } | SessionError::Disabled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SessionError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            SessionError::UnsupportedDocumentType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            SessionError::ReadonlySessionWriteAttempt(_) => StatusCode::CONFLICT,
            SessionError::InvalidOperation(_) => StatusCode::BAD_REQUEST,
            SessionError::Cancelled(_) => StatusCode::REQUEST_TIMEOUT,
            SessionError::MetadataCorrupt { .. }
            | SessionError::Engine(_)
            | SessionError::Task(_)
            | SessionError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

// =============================================================================
// Session handlers
// =============================================================================

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Deserialize)]
struct OpenRequest {
    path: PathBuf,
    #[serde(default)]
    mode: AccessMode,
    client_id: Option<String>,
}

async fn open_session(
    State(state): State<AppState>,
    RequestIdentity(me): RequestIdentity,
    Json(req): Json<OpenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = match req.client_id {
        Some(client) => {
            state
                .registry
                .open_for_client(&req.path, req.mode, &me, client)
                .await?
        }
        None => state.registry.open(&req.path, req.mode, &me).await?,
    };
    let status = state.registry.status(&id, &me)?;
    Ok((StatusCode::CREATED, Json(status)))
}

async fn list_sessions(
    State(state): State<AppState>,
    RequestIdentity(me): RequestIdentity,
) -> Json<Vec<SessionStatus>> {
    Json(state.registry.list_sessions(&me))
}

async fn session_status(
    State(state): State<AppState>,
    RequestIdentity(me): RequestIdentity,
    Path(id): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    Ok(Json(state.registry.status(&SessionId::from(id), &me)?))
}

#[derive(Deserialize)]
struct CloseQuery {
    #[serde(default)]
    discard: bool,
}

async fn close_session(
    State(state): State<AppState>,
    RequestIdentity(me): RequestIdentity,
    Path(id): Path<String>,
    Query(query): Query<CloseQuery>,
) -> Result<StatusCode, ApiError> {
    state
        .registry
        .close(&SessionId::from(id), &me, query.discard)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn read_content(
    State(state): State<AppState>,
    RequestIdentity(me): RequestIdentity,
    Path(id): Path<String>,
) -> Result<Vec<u8>, ApiError> {
    let bytes = state
        .registry
        .get_document::<BytesDocument, _>(&SessionId::from(id), &me, |doc| doc.bytes().to_vec())
        .await?;
    Ok(bytes)
}

async fn write_content(
    State(state): State<AppState>,
    RequestIdentity(me): RequestIdentity,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    state
        .registry
        .get_document_mut::<BytesDocument, _>(&SessionId::from(id), &me, |doc| {
            doc.set_bytes(body.to_vec())
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct SaveRequest {
    output_path: Option<PathBuf>,
}

#[derive(Serialize)]
struct SaveResponse {
    session_id: SessionId,
    path: PathBuf,
}

async fn save_session(
    State(state): State<AppState>,
    RequestIdentity(me): RequestIdentity,
    Path(id): Path<String>,
    Json(req): Json<SaveRequest>,
) -> Result<Json<SaveResponse>, ApiError> {
    let session_id = SessionId::from(id);
    let path = state
        .registry
        .save(&session_id, &me, req.output_path.as_deref())
        .await?;
    Ok(Json(SaveResponse { session_id, path }))
}

#[derive(Serialize)]
struct DisconnectResponse {
    client_id: String,
    relinquished: usize,
}

async fn disconnect_client(
    State(state): State<AppState>,
    RequestIdentity(me): RequestIdentity,
    Path(client_id): Path<String>,
) -> Json<DisconnectResponse> {
    let relinquished = state
        .registry
        .on_client_disconnect_for(&client_id, &me)
        .await;
    Json(DisconnectResponse {
        client_id,
        relinquished,
    })
}

// =============================================================================
// Recovery handlers
// =============================================================================

async fn list_recoverable(
    State(state): State<AppState>,
    RequestIdentity(me): RequestIdentity,
) -> Result<Json<Vec<RecoverableFileInfo>>, ApiError> {
    let store = state.recovery.clone();
    let files = tokio::task::spawn_blocking(move || store.list_recoverable_files(&me)).await?;
    Ok(Json(files))
}

async fn recovery_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let store = state.recovery.clone();
    let stats = tokio::task::spawn_blocking(move || store.stats()).await?;
    Ok(Json(stats))
}

async fn cleanup_recovery(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let store = state.recovery.clone();
    let report = tokio::task::spawn_blocking(move || store.cleanup_expired_files()).await?;
    info!(?report, "manual recovery cleanup");
    Ok(Json(report))
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct RecoverRequest {
    target_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    delete_after_recover: bool,
}

async fn recover(
    State(state): State<AppState>,
    RequestIdentity(me): RequestIdentity,
    Path(id): Path<String>,
    Json(req): Json<RecoverRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.recovery.clone();
    let session_id = SessionId::from(id);
    let result = tokio::task::spawn_blocking(move || {
        store.recover_session(
            &session_id,
            &me,
            req.target_path.as_deref(),
            req.delete_after_recover,
        )
    })
    .await?;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    Ok((status, Json(result)))
}

async fn delete_recoverable(
    State(state): State<AppState>,
    RequestIdentity(me): RequestIdentity,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.recovery.clone();
    let session_id = SessionId::from(id);
    let result =
        tokio::task::spawn_blocking(move || store.delete_temp_session(&session_id, &me)).await?;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    Ok((status, Json(result)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{GROUP_HEADER, USER_HEADER};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use docsession_core::{SessionConfig, StaticIdentityProvider};
    use docsession_types::{DisconnectBehavior, IsolationMode};
    use serde_json::{json, Value};
    use std::fs;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(dir: &TempDir, tweak: impl FnOnce(&mut SessionConfig)) -> Router {
        let mut session = SessionConfig {
            temp_dir: dir.path().join("temp"),
            ..SessionConfig::default()
        };
        tweak(&mut session);
        let config = DaemonConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            session,
        };
        router(AppState::new(
            config,
            Arc::new(BytesEngine),
            Arc::new(StaticIdentityProvider::default()),
        ))
    }

    fn request(method: Method, uri: &str, body: Option<Value>, group: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(group) = group {
            builder = builder
                .header(GROUP_HEADER, group)
                .header(USER_HEADER, format!("{group}-user"));
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let (status, body) = send(app, req).await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_healthz() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, |_| {});
        let (status, body) = send(&app, request(Method::GET, "/healthz", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn test_edit_disconnect_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, |_| {});
        let path = dir.path().join("plan.docx");
        fs::write(&path, b"v1").unwrap();

        let (status, opened) = send_json(
            &app,
            request(
                Method::POST,
                "/api/sessions",
                Some(json!({ "path": path, "client_id": "conn-7" })),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = opened["session_id"].as_str().unwrap().to_string();
        assert_eq!(opened["mode"], "readwrite");

        let put = Request::builder()
            .method(Method::PUT)
            .uri(format!("/api/sessions/{id}/content"))
            .body(Body::from("v2"))
            .unwrap();
        let (status, _) = send(&app, put).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, status_body) =
            send_json(&app, request(Method::GET, &format!("/api/sessions/{id}"), None, None)).await;
        assert_eq!(status_body["dirty"], true);

        let (status, body) = send_json(
            &app,
            request(Method::POST, "/api/clients/conn-7/disconnect", None, None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["relinquished"], 1);
        assert_eq!(fs::read(&path).unwrap(), b"v1");

        let (_, files) = send_json(&app, request(Method::GET, "/api/recovery", None, None)).await;
        assert_eq!(files.as_array().unwrap().len(), 1);
        assert_eq!(files[0]["session_id"], id.as_str());

        let (status, result) = send_json(
            &app,
            request(Method::POST, &format!("/api/recovery/{id}/recover"), Some(json!({})), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["success"], true);
        assert_eq!(fs::read(&path).unwrap(), b"v2");

        let (status, _) = send_json(
            &app,
            request(Method::DELETE, &format!("/api/recovery/{id}"), None, None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, stats) = send_json(&app, request(Method::GET, "/api/recovery/stats", None, None)).await;
        assert_eq!(stats["total_count"], 0);
    }

    #[tokio::test]
    async fn test_group_headers_isolate_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, |cfg| cfg.isolation_mode = IsolationMode::Group);
        let path = dir.path().join("ledger.xlsx");
        fs::write(&path, b"1,2").unwrap();

        let (status, opened) = send_json(
            &app,
            request(Method::POST, "/api/sessions", Some(json!({ "path": path })), Some("finance")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(opened["owner_group_id"], "finance");
        let id = opened["session_id"].as_str().unwrap().to_string();

        let uri = format!("/api/sessions/{id}");
        let (status, _) = send(&app, request(Method::GET, &uri, None, Some("legal"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, request(Method::GET, &uri, None, Some("finance"))).await;
        assert_eq!(status, StatusCode::OK);

        let (_, listed) = send_json(&app, request(Method::GET, "/api/sessions", None, Some("legal"))).await;
        assert!(listed.as_array().unwrap().is_empty());

        let (status, _) = send(&app, request(Method::DELETE, &uri, None, Some("legal"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(
            &app,
            request(Method::DELETE, &format!("{uri}?discard=true"), None, Some("finance")),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_foreign_group_cannot_disconnect_client() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, |cfg| {
            cfg.isolation_mode = IsolationMode::Group;
            cfg.disconnect_behavior = DisconnectBehavior::Discard;
        });
        let path = dir.path().join("ledger.xlsx");
        fs::write(&path, b"1,2").unwrap();

        let (_, opened) = send_json(
            &app,
            request(
                Method::POST,
                "/api/sessions",
                Some(json!({ "path": path, "client_id": "conn-1" })),
                Some("finance"),
            ),
        )
        .await;
        let uri = format!("/api/sessions/{}", opened["session_id"].as_str().unwrap());

        let (status, body) = send_json(
            &app,
            request(Method::POST, "/api/clients/conn-1/disconnect", None, Some("legal")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["relinquished"], 0);
        let (status, _) = send(&app, request(Method::GET, &uri, None, Some("finance"))).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send_json(
            &app,
            request(Method::POST, "/api/clients/conn-1/disconnect", None, Some("finance")),
        )
        .await;
        assert_eq!(body["relinquished"], 1);
        let (status, _) = send(&app, request(Method::GET, &uri, None, Some("finance"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_error_status_codes() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, |_| {});
        let doc = dir.path().join("a.pdf");
        fs::write(&doc, b"%PDF").unwrap();
        let txt = dir.path().join("a.txt");
        fs::write(&txt, b"x").unwrap();

        let open = |body: Value| request(Method::POST, "/api/sessions", Some(body), None);

        let (status, _) = send(&app, open(json!({ "path": dir.path().join("missing.pdf") }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send_json(&app, open(json!({ "path": txt }))).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(body["error"].as_str().unwrap().contains("unsupported"));

        let (status, opened) = send_json(&app, open(json!({ "path": doc, "mode": "readonly" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = opened["session_id"].as_str().unwrap().to_string();
        let (status, _) = send(
            &app,
            request(Method::POST, &format!("/api/sessions/{id}/save"), Some(json!({})), None),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(&app, request(Method::GET, "/api/sessions/nope", None, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_disabled_sessions_are_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, |cfg| cfg.enabled = false);
        let doc = dir.path().join("a.docx");
        fs::write(&doc, b"x").unwrap();

        let (status, _) = send(
            &app,
            request(Method::POST, "/api/sessions", Some(json!({ "path": doc })), None),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
