//! 节点级已打开会话注册表
//!
//! 所有会话 ID 以 `;` 连接后保存在存储的同一个键下，
//! 指标采集只需读取这一个键。增删都通过 CAS 重试循环完成：
//! 读取当前值、计算新值、CAS，失败后用返回的最新值重算。

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use super::file_store::{CasOutcome, CompareSetStore};
use crate::config::{RetrySettings, OPEN_SESSIONS_KEY};
use crate::error::{HandlerError, Result};

/// 会话 ID 分隔符
pub const SESSION_SEPARATOR: char = ';';

/// 解析注册表值，忽略空片段
pub fn parse_members(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or("")
        .split(SESSION_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// CAS 重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 最大尝试次数，0 表示不限
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_backoff: Duration::from_millis(settings.base_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// 不限次数、不退避
    pub fn unbounded() -> Self {
        Self {
            max_attempts: 0,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }

    /// 第 `attempt` 次失败后的退避: base * 2^(attempt-1)，不超过最大值
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10);
        let backoff = self.base_backoff.saturating_mul(1 << exponent);
        backoff.min(self.max_backoff)
    }

    fn wait(&self, attempt: u32) {
        let backoff = self.backoff(attempt);
        if backoff.is_zero() {
            return;
        }
        // 加一点抖动，避免多个进程同步重试
        let jitter_ms = self.base_backoff.as_millis() as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        std::thread::sleep(backoff + jitter);
    }
}

/// 已打开会话注册表
pub struct SessionRegistry {
    store: Arc<dyn CompareSetStore>,
    key: String,
    policy: RetryPolicy,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn CompareSetStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            key: OPEN_SESSIONS_KEY.to_string(),
            policy,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// 登记会话（幂等）
    pub fn open(&self, session_id: &str) -> Result<()> {
        let mut current = self.store.get(&self.key)?;
        let mut attempts = 0;

        loop {
            let mut members = parse_members(current.as_deref());
            if members.iter().any(|m| m == session_id) {
                return Ok(());
            }
            members.push(session_id.to_string());
            let desired = members.join(";");

            attempts += 1;
            match self
                .store
                .compare_set(&self.key, current.as_deref(), &desired)?
            {
                CasOutcome::Swapped => {
                    tracing::info!(
                        "[Registry] 打开会话 {} (当前已打开: {})",
                        session_id,
                        members.len()
                    );
                    return Ok(());
                }
                CasOutcome::Conflict { current: latest } => {
                    current = latest;
                    self.on_conflict(session_id, attempts)?;
                }
            }
        }
    }

    /// 注销会话（幂等，未登记时直接返回）
    pub fn close(&self, session_id: &str) -> Result<()> {
        let mut current = self.store.get(&self.key)?;
        let mut attempts = 0;

        loop {
            let members = parse_members(current.as_deref());
            if !members.iter().any(|m| m == session_id) {
                return Ok(());
            }
            let remaining: Vec<String> = members.into_iter().filter(|m| m != session_id).collect();
            let desired = remaining.join(";");

            attempts += 1;
            match self
                .store
                .compare_set(&self.key, current.as_deref(), &desired)?
            {
                CasOutcome::Swapped => {
                    tracing::info!(
                        "[Registry] 关闭会话 {} (剩余已打开: {})",
                        session_id,
                        remaining.len()
                    );
                    return Ok(());
                }
                CasOutcome::Conflict { current: latest } => {
                    current = latest;
                    self.on_conflict(session_id, attempts)?;
                }
            }
        }
    }

    /// 当前已打开的会话（排序去重）
    pub fn snapshot(&self) -> Result<Vec<String>> {
        let mut members = parse_members(self.store.get(&self.key)?.as_deref());
        members.sort();
        members.dedup();
        Ok(members)
    }

    fn on_conflict(&self, session_id: &str, attempts: u32) -> Result<()> {
        if self.policy.exhausted(attempts) {
            tracing::warn!(
                "[Registry] 会话 {} 的注册表更新在 {} 次尝试后仍然冲突",
                session_id,
                attempts
            );
            return Err(HandlerError::RegistryContention {
                session_id: session_id.to_string(),
                attempts,
            });
        }
        tracing::debug!(
            "[Registry] CAS 冲突，重试 (会话: {}, 第 {} 次)",
            session_id,
            attempts
        );
        self.policy.wait(attempts);
        Ok(())
    }
}
