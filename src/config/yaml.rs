//! YAML 配置读写

use std::fs;
use std::path::Path;

use super::types::{Config, MAX_SESSION_EXPIRY_MINUTES};

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("读取配置文件失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("解析配置文件失败: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("配置无效: {0}")]
    Invalid(String),
}

/// 加载配置文件，文件不存在时返回默认配置
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        tracing::warn!("[Config] 配置文件不存在，使用默认配置: {:?}", path);
        return Ok(Config::default());
    }

    let content = fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&content)?;
    validate(&config)?;

    tracing::info!("[Config] 已加载配置: {:?}", path);
    Ok(config)
}

/// 保存配置到 YAML 文件
pub fn save_config(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let content = serde_yaml::to_string(config)?;
    fs::write(path, content)?;
    Ok(())
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.model.name.trim().is_empty() {
        return Err(ConfigError::Invalid("model.name 不能为空".to_string()));
    }
    if config.handler.max_sessions_per_worker == 0 {
        return Err(ConfigError::Invalid(
            "handler.max_sessions_per_worker 必须大于 0".to_string(),
        ));
    }
    let expiry = config.handler.session_expiry_minutes;
    if expiry <= 0 || expiry > MAX_SESSION_EXPIRY_MINUTES {
        return Err(ConfigError::Invalid(format!(
            "handler.session_expiry_minutes 必须在 1..={} 之间",
            MAX_SESSION_EXPIRY_MINUTES
        )));
    }
    Ok(())
}
