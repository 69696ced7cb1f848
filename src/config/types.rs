//! 配置类型定义

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::path_utils::expand_tilde;

/// 注册表中保存已打开会话的键
pub const OPEN_SESSIONS_KEY: &str = "open_sessions";

/// 会话过期时间上限（分钟，一年）
pub const MAX_SESSION_EXPIRY_MINUTES: i64 = 525_600;

/// 主配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub handler: HandlerSettings,
    pub store: StoreConfig,
    pub registry: RetrySettings,
    pub generation: GenerationConfig,
    pub timeouts: TimeoutConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// 当前节点的会话存储文件路径：`{store.dir}/{model.name}_store`
    pub fn store_path(&self) -> PathBuf {
        self.store.store_path(&self.model.name)
    }
}

/// 模型配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// 模型名称，同时决定会话存储文件名
    pub name: String,
    /// 外部模型服务地址
    pub backend_url: String,
    /// 访问令牌（为空时读取环境变量 HF_TOKEN / TS_HF_TOKEN）
    pub hf_token: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "llama-3.2-11b-vision".to_string(),
            backend_url: "http://127.0.0.1:8080".to_string(),
            hf_token: None,
        }
    }
}

impl ModelConfig {
    pub fn resolve_token(&self) -> Option<String> {
        self.hf_token
            .clone()
            .or_else(|| std::env::var("HF_TOKEN").ok())
            .or_else(|| std::env::var("TS_HF_TOKEN").ok())
            .filter(|t| !t.is_empty())
    }
}

/// 处理器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerSettings {
    /// 会话过期时间（分钟），写入 sequence id 响应头
    pub session_expiry_minutes: i64,
    /// 每个 worker 同时持有的会话数
    pub max_sessions_per_worker: usize,
    pub headers: HeaderNames,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            session_expiry_minutes: 20,
            max_sessions_per_worker: 1,
            headers: HeaderNames::default(),
        }
    }
}

/// 粘性路由相关的头名称
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderNames {
    pub sequence_id: String,
    pub sequence_end: String,
    pub request_id: String,
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self {
            sequence_id: "X-Amzn-SageMaker-Session-Id".to_string(),
            sequence_end: "X-Amzn-SageMaker-Closed-Session-Id".to_string(),
            request_id: "X-Amzn-RequestId".to_string(),
        }
    }
}

/// 会话存储配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// 存储目录，支持 `~`
    pub dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: "/tmp".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn store_path(&self, model_name: &str) -> PathBuf {
        expand_tilde(&self.dir).join(format!("{}_store", model_name))
    }
}

/// 注册表 CAS 重试配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// 最大尝试次数，0 表示不限
    pub max_attempts: u32,
    /// 基础退避时间（毫秒）
    pub base_backoff_ms: u64,
    /// 最大退避时间（毫秒）
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 1000,
            base_backoff_ms: 1,
            max_backoff_ms: 50,
        }
    }
}

/// 生成参数（固定，不允许请求覆盖）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub max_new_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            top_p: 1.0,
            max_new_tokens: 512,
        }
    }
}

/// 阻塞操作的超时配置，未设置表示无限等待
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub image_fetch_secs: Option<u64>,
    pub generation_secs: Option<u64>,
}

/// HTTP 服务配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 请求体大小上限（字节）
    pub body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            body_limit: 16 * 1024 * 1024,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// 输出 JSON 格式日志
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
