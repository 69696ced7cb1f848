//! 会话 API 数据模型
//!
//! 请求以带 `type` 判别字段的 JSON 信封传输：
//!
//! - `start_session`: `{"type": "start_session", "path": "...", "session_id": null}`
//! - `close_session`: `{"type": "close_session", "session_id": "..."}`
//! - `send_text_prompt`: `{"type": "send_text_prompt", "session_id": "...", "prompt_text": "..."}`
//!
//! 响应体不带判别字段，与请求一一对应。

use axum::http::StatusCode;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HandlerError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSessionRequest {
    /// 需要预加载的图片地址
    pub path: String,
    /// 由处理器填入（等于 sequence id），客户端传入的值会被覆盖
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPromptRequest {
    pub session_id: String,
    pub prompt_text: String,
}

/// 会话请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionRequest {
    StartSession(StartSessionRequest),
    CloseSession(CloseSessionRequest),
    SendTextPrompt(TextPromptRequest),
}

impl SessionRequest {
    pub const START_SESSION: &'static str = "start_session";
    pub const CLOSE_SESSION: &'static str = "close_session";
    pub const SEND_TEXT_PROMPT: &'static str = "send_text_prompt";

    /// 从 JSON 字符串解析
    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(HandlerError::Decode("request body is empty".to_string()));
        }
        let value: Value =
            serde_json::from_str(raw).map_err(|e| HandlerError::Decode(e.to_string()))?;
        Self::from_value(value)
    }

    /// 先读取 `type` 判别字段，再按具体类型解析其余字段
    pub fn from_value(value: Value) -> Result<Self> {
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| HandlerError::Decode("missing string field `type`".to_string()))?
            .to_string();

        let decode = |e: serde_json::Error| HandlerError::Decode(format!("{}: {}", kind, e));
        match kind.as_str() {
            Self::START_SESSION => Ok(Self::StartSession(
                serde_json::from_value(value).map_err(decode)?,
            )),
            Self::CLOSE_SESSION => Ok(Self::CloseSession(
                serde_json::from_value(value).map_err(decode)?,
            )),
            Self::SEND_TEXT_PROMPT => Ok(Self::SendTextPrompt(
                serde_json::from_value(value).map_err(decode)?,
            )),
            _ => Err(HandlerError::UnsupportedType(kind)),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::StartSession(_) => Self::START_SESSION,
            Self::CloseSession(_) => Self::CLOSE_SESSION,
            Self::SendTextPrompt(_) => Self::SEND_TEXT_PROMPT,
        }
    }

    /// 请求体中携带的会话 ID（开始会话请求在分类前可能为空）
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::StartSession(r) => r.session_id.as_deref(),
            Self::CloseSession(r) => Some(&r.session_id),
            Self::SendTextPrompt(r) => Some(&r.session_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseSessionResponse {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPromptResponse {
    pub response_text: String,
}

/// 重复投递请求的确认
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "continue")]
pub struct ContinueResponse {
    pub session_id: String,
}

// ============================================================================
// 批处理边界
// ============================================================================

/// 原始请求体：字节流或已解码的 JSON
#[derive(Debug, Clone)]
pub enum RequestBody {
    Bytes(Bytes),
    Json(Value),
}

impl RequestBody {
    pub fn decode(&self) -> Result<SessionRequest> {
        match self {
            Self::Bytes(bytes) => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| HandlerError::Decode(format!("body is not utf-8: {}", e)))?;
                SessionRequest::from_json(text)
            }
            Self::Json(Value::String(text)) => SessionRequest::from_json(text),
            Self::Json(Value::Null) => {
                Err(HandlerError::Decode("request body is empty".to_string()))
            }
            Self::Json(value) => SessionRequest::from_value(value.clone()),
        }
    }
}

impl From<Value> for RequestBody {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

/// 服务运行时交付的单个批处理条目
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub sequence_id: String,
    /// 是否为序列的第一个请求
    pub sequence_start: bool,
    pub request_id: String,
    pub body: RequestBody,
}

/// 分类后的请求
#[derive(Debug, Clone, PartialEq)]
pub enum RequestKind {
    /// 首次投递，需要执行
    Fresh(SessionRequest),
    /// 重复投递，只确认
    Continue { session_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedRequest {
    pub sequence_id: String,
    pub request_id: String,
    /// 该条目是否开启了序列
    pub sequence_start: bool,
    pub kind: RequestKind,
}

/// 单个条目的响应：粘性路由头 + 状态码 + JSON 响应体
#[derive(Debug, Clone)]
pub struct BatchResponse {
    pub headers: Vec<(String, String)>,
    pub status: StatusCode,
    pub body: Value,
}

impl BatchResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
