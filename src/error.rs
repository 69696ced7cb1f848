//! 错误类型
//!
//! 会话处理链路上的全部失败类型，以及到 HTTP 响应的映射。

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// 跨进程会话存储错误
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("会话存储文件不可访问: {0}")]
    Io(#[from] std::io::Error),

    #[error("会话存储文件已损坏: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("会话存储任务异常退出: {0}")]
    Task(String),
}

/// 处理器错误
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// 未开始的序列收到了续传请求，或者请求体与序列不匹配
    #[error("protocol violation for sequence {sequence_id}: {reason}")]
    ProtocolViolation { sequence_id: String, reason: String },

    #[error("unsupported request type: {0}")]
    UnsupportedType(String),

    #[error("failed to decode request: {0}")]
    Decode(String),

    #[error("failed to fetch resource {url}: {reason}")]
    ResourceFetch { url: String, reason: String },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("registry contention exhausted for session {session_id} after {attempts} attempts")]
    RegistryContention { session_id: String, attempts: u32 },

    #[error("session store error: {0}")]
    Store(#[from] StoreError),

    #[error("model is not loaded")]
    ModelNotLoaded,

    #[error("model loading failed: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

impl HandlerError {
    pub fn protocol(sequence_id: &str, reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            sequence_id: sequence_id.to_string(),
            reason: reason.into(),
        }
    }

    /// 错误类别，用于响应体的 `type` 字段
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProtocolViolation { .. } => "protocol_violation",
            Self::UnsupportedType(_) => "unsupported_type",
            Self::Decode(_) => "decode_error",
            Self::ResourceFetch { .. } => "resource_fetch_error",
            Self::SessionNotFound(_) => "session_not_found",
            Self::RegistryContention { .. } => "registry_contention",
            Self::Store(_) => "store_error",
            Self::ModelNotLoaded => "model_not_loaded",
            Self::ModelLoad(_) => "model_load_error",
            Self::Inference(_) => "inference_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ProtocolViolation { .. } | Self::UnsupportedType(_) | Self::Decode(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::ResourceFetch { .. } => StatusCode::BAD_GATEWAY,
            Self::RegistryContention { .. } | Self::ModelNotLoaded => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Store(_) | Self::ModelLoad(_) | Self::Inference(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// 错误响应体
    pub fn to_body(&self) -> serde_json::Value {
        json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
            }
        })
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_body())).into_response()
    }
}

pub type Result<T> = std::result::Result<T, HandlerError>;
