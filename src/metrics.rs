//! 已打开会话统计
//!
//! 只读取注册表，不修改存储文件。

use std::path::Path;

use serde::Serialize;

use crate::config::OPEN_SESSIONS_KEY;
use crate::error::StoreError;
use crate::session::{parse_members, CompareSetStore, FileStore};

/// 节点上已打开的会话
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenSessionsReport {
    pub count: usize,
    pub sessions: Vec<String>,
}

impl OpenSessionsReport {
    pub fn from_value(value: Option<&str>) -> Self {
        let sessions = parse_members(value);
        Self {
            count: sessions.len(),
            sessions,
        }
    }
}

/// 读取存储文件中的已打开会话；文件尚未创建时返回 `None`
pub fn collect_open_sessions(
    store_path: &Path,
) -> Result<Option<OpenSessionsReport>, StoreError> {
    if !store_path.exists() {
        tracing::debug!("[Metrics] 存储文件不存在: {:?}", store_path);
        return Ok(None);
    }
    let store = FileStore::open(store_path)?;
    let value = store.get(OPEN_SESSIONS_KEY)?;
    let report = OpenSessionsReport::from_value(value.as_deref());
    tracing::info!("[Metrics] 已打开会话数: {}", report.count);
    Ok(Some(report))
}
