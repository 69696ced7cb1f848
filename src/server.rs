//! HTTP 服务
//!
//! 路由：
//! - `POST /invocations`: 单条目批次交给处理器
//! - `GET /ping`: 模型加载完成后返回 200
//! - `GET /sessions`: 当前节点的已打开会话

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::sync::Mutex;
use tower_http::limit::RequestBodyLimitLayer;

use crate::config::HeaderNames;
use crate::handler::{with_registry, CustomHandler};
use crate::metrics::OpenSessionsReport;
use crate::models::{BatchItem, BatchResponse, RequestBody};
use crate::session::SessionRegistry;

/// 客户端请求新序列时使用的占位 session id
pub const NEW_SESSION: &str = "NEW_SESSION";

#[derive(Clone)]
pub struct AppState {
    /// 处理器不可重入，请求串行执行
    pub handler: Arc<Mutex<CustomHandler>>,
    pub registry: Arc<SessionRegistry>,
    pub headers: HeaderNames,
    /// 模型就绪标记，`/ping` 不等待处理器锁
    pub ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(handler: CustomHandler, headers: HeaderNames) -> Self {
        Self {
            registry: handler.registry().clone(),
            ready: handler.ready_flag(),
            handler: Arc::new(Mutex::new(handler)),
            headers,
        }
    }
}

pub fn create_router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/invocations", post(invocations))
        .route("/ping", get(ping))
        .route("/sessions", get(sessions))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

/// 启动服务，`shutdown` 完成后优雅退出
pub async fn run_server(
    host: &str,
    port: u16,
    body_limit: usize,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = create_router(state, body_limit);

    let addr: std::net::SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("[Server] 监听 {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("[Server] 已停止");
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// 解析 sequence id 头，返回 (sequence_id, 是否新序列)
///
/// 客户端可能原样回传带 `; Expires=` 的值，只取分号前的部分。
fn resolve_sequence(headers: &HeaderMap, names: &HeaderNames) -> (String, bool) {
    let id = header_str(headers, &names.sequence_id)
        .map(|v| v.split(';').next().unwrap_or(v).trim())
        .filter(|v| !v.is_empty());
    match id {
        None | Some(NEW_SESSION) => (uuid::Uuid::new_v4().to_string(), true),
        Some(id) => (id.to_string(), false),
    }
}

async fn invocations(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (sequence_id, sequence_start) = resolve_sequence(&headers, &state.headers);
    let request_id = header_str(&headers, &state.headers.request_id)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let item = BatchItem {
        sequence_id,
        sequence_start,
        request_id,
        body: RequestBody::Bytes(body),
    };

    let response = {
        let mut handler = state.handler.lock().await;
        handler.handle(vec![item]).await.pop()
    };

    match response {
        Some(response) => into_http_response(response),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "error": {"message": "handler returned no response", "type": "internal_error"}
            })),
        )
            .into_response(),
    }
}

fn into_http_response(response: BatchResponse) -> Response {
    let BatchResponse {
        headers,
        status,
        body,
    } = response;
    let mut http = (status, Json(body)).into_response();
    for (name, value) in headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                http.headers_mut().insert(name, value);
            }
            _ => tracing::warn!("[Server] 忽略非法响应头 {}: {}", name, value),
        }
    }
    http
}

async fn ping(State(state): State<AppState>) -> impl IntoResponse {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, Json(serde_json::json!({"status": "healthy"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "loading"})),
        )
    }
}

async fn sessions(State(state): State<AppState>) -> Response {
    match with_registry(state.registry.clone(), |registry| registry.snapshot()).await {
        Ok(sessions) => Json(OpenSessionsReport {
            count: sessions.len(),
            sessions,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}
