//! HTTP 命令面 + WebSocket 事件推送
//!
//! 路由：
//! - `POST /api/sessions` 创建会话
//! - `POST /api/sessions/:id/upload` 上传背景文档（resume）与联系人列表（connections）
//! - `POST /api/sessions/:id/{start,pause,resume,stop}`
//! - `PATCH /api/sessions/:id`、`GET /api/sessions/:id`、`GET /api/sessions/:id/logs`
//! - `GET /ws?sessionId=` 事件流：先回放已存日志，再转发实时事件

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::core::{EngineError, Orchestrator};
use crate::ingest::UploadedFile;
use crate::store::{
    LogEntry, Session, SessionConfig, SessionPatch, SessionSnapshot, StoreError, UploadSummary,
};

use super::event::SessionEvent;

/// axum 共享状态
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// 构建路由
pub fn build_router(orchestrator: Arc<Orchestrator>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/health", get(|| async { "OK" }))
        .route("/api/sessions", post(create_session))
        .route(
            "/api/sessions/:id",
            get(get_session).patch(patch_session),
        )
        .route("/api/sessions/:id/logs", get(get_logs))
        .route("/api/sessions/:id/upload", post(upload))
        .route("/api/sessions/:id/start", post(start))
        .route("/api/sessions/:id/pause", post(pause))
        .route("/api/sessions/:id/resume", post(resume))
        .route("/api/sessions/:id/stop", post(stop))
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(AppState { orchestrator })
}

/// 命令面错误 → HTTP 状态码 + `{"message"}`
#[derive(Debug)]
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::Transition(_) => StatusCode::CONFLICT,
            EngineError::SessionNotFound(_)
            | EngineError::Store(StoreError::SessionNotFound(_))
            | EngineError::Store(StoreError::ItemNotFound(_)) => StatusCode::NOT_FOUND,
            EngineError::LoopFatal(_) | EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "message": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn accepted() -> Json<serde_json::Value> {
    Json(json!({ "success": true }))
}

async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<SessionConfig>>,
) -> ApiResult<Session> {
    let config = body.map(|Json(c)| c).unwrap_or_default();
    Ok(Json(state.orchestrator.create_session(config).await?))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionSnapshot> {
    Ok(Json(state.orchestrator.snapshot(&id).await?))
}

async fn patch_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<SessionPatch>,
) -> ApiResult<Session> {
    Ok(Json(state.orchestrator.patch(&id, patch).await?))
}

async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<LogEntry>> {
    Ok(Json(state.orchestrator.logs(&id).await?))
}

/// multipart 字段：`resume`（背景文档）、`connections`（联系人 CSV）
async fn upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<UploadSummary> {
    let mut resume = None;
    let mut connections = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| EngineError::Validation(format!("Invalid upload: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().unwrap_or(name.as_str()).to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| EngineError::Validation(format!("Invalid upload: {}", e)))?;
        match name.as_str() {
            "resume" => resume = Some(UploadedFile::new(file_name, bytes.to_vec())),
            "connections" => connections = Some(UploadedFile::new(file_name, bytes.to_vec())),
            other => tracing::debug!(field = other, "Ignoring unknown upload field"),
        }
    }

    Ok(Json(state.orchestrator.upload(&id, resume, connections).await?))
}

async fn start(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<serde_json::Value> {
    state.orchestrator.start(&id).await?;
    Ok(accepted())
}

async fn pause(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<serde_json::Value> {
    state.orchestrator.pause(&id).await?;
    Ok(accepted())
}

async fn resume(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<serde_json::Value> {
    state.orchestrator.resume(&id).await?;
    Ok(accepted())
}

async fn stop(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<serde_json::Value> {
    state.orchestrator.stop(&id).await?;
    Ok(accepted())
}

#[derive(Debug, Deserialize)]
struct WsParams {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
) -> Result<Response, ApiError> {
    // 先挂载再回放，回放期间产生的事件留在队列里
    let events = state.orchestrator.observe(&params.session_id).await?;
    let history = state.orchestrator.logs(&params.session_id).await?;
    Ok(ws.on_upgrade(move |socket| {
        forward_events(socket, state.orchestrator, params.session_id, history, events)
    }))
}

async fn forward_events(
    socket: WebSocket,
    orchestrator: Arc<Orchestrator>,
    session_id: String,
    history: Vec<LogEntry>,
    mut events: mpsc::Receiver<SessionEvent>,
) {
    tracing::info!(session_id = %session_id, "Observer connected");
    let (mut sink, mut incoming) = socket.split();

    let mut replayed: Vec<SessionEvent> = history.iter().map(SessionEvent::from).collect();
    for event in &replayed {
        if send_event(&mut sink, event).await.is_err() {
            drop(events);
            orchestrator.release_observer(&session_id).await;
            return;
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    // 挂载与读取历史之间写入的日志会同时出现在两边
                    if let Some(i) = replayed.iter().position(|e| *e == event) {
                        replayed.swap_remove(i);
                        continue;
                    }
                    if send_event(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
                // 被新的观察者替换
                None => break,
            },
            msg = incoming.next() => match msg {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    drop(events);
    orchestrator.release_observer(&session_id).await;
    tracing::info!(session_id = %session_id, "Observer disconnected");
}

async fn send_event<S>(sink: &mut S, event: &SessionEvent) -> Result<(), ()>
where
    S: SinkExt<WsMessage> + Unpin,
{
    let text = match event.to_json() {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(kind = event.kind(), "Failed to encode event: {}", e);
            return Ok(());
        }
    };
    sink.send(WsMessage::Text(text)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use tower::ServiceExt;

    use crate::actuation::DryRunActuatorFactory;
    use crate::config::SessionSection;
    use crate::gateway::EventBus;
    use crate::llm::DraftingService;
    use crate::store::{MemoryRecordStore, RecordStore};

    fn app() -> (Router, Arc<Orchestrator>) {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let orchestrator = Arc::new(Orchestrator::new(
            store,
            EventBus::new(16),
            Arc::new(DryRunActuatorFactory::new(0)),
            DraftingService::template_only(),
            SessionSection::default(),
        ));
        (build_router(Arc::clone(&orchestrator), 1024 * 1024), orchestrator)
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::post(uri).body(Body::empty()).unwrap()
    }

    fn multipart_upload(uri: &str, parts: &[(&str, &str, &str)]) -> Request<Body> {
        let boundary = "reach-test-boundary";
        let mut body = String::new();
        for (field, file_name, content) in parts {
            body.push_str(&format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n{content}\r\n"
            ));
        }
        body.push_str(&format!("--{boundary}--\r\n"));
        Request::post(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _) = app();
        let resp = router
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_and_fetch_session() {
        let (router, _) = app();
        let (status, body) = send(
            &router,
            post_json("/api/sessions", json!({ "countdown_secs": 3, "api_key": "sk-test" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "idle");
        assert_eq!(body["countdown_secs"], 3);
        assert!(body.get("api_key").is_none());

        let id = body["id"].as_str().unwrap().to_string();
        let (status, snapshot) = send(
            &router,
            Request::get(format!("/api/sessions/{}", id)).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["session"]["id"], id.as_str());
        assert_eq!(snapshot["is_active"], false);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let (router, _) = app();

        let (status, body) = send(&router, post_empty("/api/sessions/session_missing/start")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["message"].as_str().unwrap().contains("session_missing"));

        let (status, _) = send(&router, post_json("/api/sessions", json!({ "countdown_secs": 0 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, created) = send(&router, post_json("/api/sessions", json!({}))).await;
        let id = created["id"].as_str().unwrap();
        let (status, body) = send(&router, post_empty(&format!("/api/sessions/{}/start", id))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["message"], "No connections uploaded");
    }

    #[tokio::test]
    async fn test_upload_then_malformed_upload() {
        let (router, orchestrator) = app();
        let (_, created) = send(&router, post_json("/api/sessions", json!({}))).await;
        let id = created["id"].as_str().unwrap().to_string();
        let uri = format!("/api/sessions/{}/upload", id);

        let (status, summary) = send(
            &router,
            multipart_upload(
                &uri,
                &[
                    ("resume", "resume.txt", "Backend engineer"),
                    (
                        "connections",
                        "connections.csv",
                        "First Name,Last Name,URL\nAda,Lovelace,https://example.com/in/ada\n",
                    ),
                ],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["background_present"], true);
        assert_eq!(summary["contact_count"], 1);

        let (status, body) = send(
            &router,
            multipart_upload(
                &uri,
                &[("connections", "more.csv", "First Name,Last Name,URL\nAlan,Turing,\n")],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["message"],
            "Invalid data at row 1: Missing required fields (URL)"
        );
        assert_eq!(orchestrator.store().list_items(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_patch_and_logs() {
        let (router, _) = app();
        let (_, created) = send(&router, post_json("/api/sessions", json!({}))).await;
        let id = created["id"].as_str().unwrap();

        let req = Request::patch(format!("/api/sessions/{}", id))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "auto_send": false, "connection_delay": "1-3" }).to_string()))
            .unwrap();
        let (status, session) = send(&router, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(session["auto_send"], false);
        assert_eq!(session["connection_delay"], "1-3");

        let (status, logs) = send(
            &router,
            Request::get(format!("/api/sessions/{}/logs", id)).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(logs[0]["title"], "Session created");
    }
}
