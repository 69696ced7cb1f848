//! 配置管理模块
//!
//! 提供 YAML 配置文件的读取、保存与默认值。

mod path_utils;
mod types;
mod yaml;

pub use path_utils::expand_tilde;
pub use types::{
    Config, GenerationConfig, HandlerSettings, HeaderNames, LoggingConfig, ModelConfig,
    RetrySettings, ServerConfig, StoreConfig, TimeoutConfig, MAX_SESSION_EXPIRY_MINUTES,
    OPEN_SESSIONS_KEY,
};
pub use yaml::{load_config, save_config, ConfigError};
