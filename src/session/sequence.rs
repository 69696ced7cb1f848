//! 请求分类记录
//!
//! 每个进行中的 sequence id 对应一条记录，跟踪序列是否刚开始、是否已结束，
//! 以及还有多少已接收但未处理完的请求。

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::error::{HandlerError, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceRecord {
    /// 当前请求是否为序列的第一个请求
    pub start: bool,
    pub cancel: bool,
    /// 已收到关闭会话请求
    pub end: bool,
    /// 已接收未处理完的请求数
    pub num_requests: u32,
    /// 已解析过的请求 ID
    request_ids: HashSet<String>,
    /// 最近一次收到该序列请求的时间
    pub last_seen: DateTime<Utc>,
}

impl SequenceRecord {
    fn started() -> Self {
        Self {
            start: true,
            last_seen: Utc::now(),
            ..Self::default()
        }
    }

    pub fn has_seen(&self, request_id: &str) -> bool {
        self.request_ids.contains(request_id)
    }
}

/// 分类记录表
#[derive(Debug, Default)]
pub struct SequenceTracker {
    records: HashMap<String, SequenceRecord>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 序列开始：新建记录，覆盖旧记录
    pub fn begin(&mut self, sequence_id: &str) {
        if self
            .records
            .insert(sequence_id.to_string(), SequenceRecord::started())
            .is_some()
        {
            tracing::debug!("[Sequence] 序列 {} 重新开始，旧记录已覆盖", sequence_id);
        }
    }

    /// 已建立序列的后续请求，序列不存在时返回协议错误
    pub fn resume(&mut self, sequence_id: &str) -> Result<()> {
        match self.records.get_mut(sequence_id) {
            Some(record) => {
                record.start = false;
                record.last_seen = Utc::now();
                Ok(())
            }
            None => Err(HandlerError::protocol(
                sequence_id,
                "continuation received before a sequence-start request",
            )),
        }
    }

    pub fn get(&self, sequence_id: &str) -> Option<&SequenceRecord> {
        self.records.get(sequence_id)
    }

    pub fn contains(&self, sequence_id: &str) -> bool {
        self.records.contains_key(sequence_id)
    }

    pub fn is_seen(&self, sequence_id: &str, request_id: &str) -> bool {
        self.records
            .get(sequence_id)
            .map(|r| r.has_seen(request_id))
            .unwrap_or(false)
    }

    /// 记录新请求并增加未完成计数
    pub fn register_request(&mut self, sequence_id: &str, request_id: &str) {
        if let Some(record) = self.records.get_mut(sequence_id) {
            if record.request_ids.insert(request_id.to_string()) {
                record.num_requests += 1;
            }
        }
    }

    pub fn mark_end(&mut self, sequence_id: &str) {
        if let Some(record) = self.records.get_mut(sequence_id) {
            record.end = true;
        }
    }

    /// 请求处理完成；已结束且没有未完成请求的序列被清除，返回是否清除
    pub fn complete_request(&mut self, sequence_id: &str) -> bool {
        let Some(record) = self.records.get_mut(sequence_id) else {
            return false;
        };
        record.num_requests = record.num_requests.saturating_sub(1);
        if record.end && record.num_requests == 0 {
            self.records.remove(sequence_id);
            tracing::debug!("[Sequence] 序列 {} 已结束，记录已清除", sequence_id);
            return true;
        }
        false
    }

    pub fn purge(&mut self, sequence_id: &str) -> bool {
        self.records.remove(sequence_id).is_some()
    }

    /// 清除 `cutoff` 之前就不再活动的记录，`keep` 返回 true 的序列保留
    pub fn prune_idle(&mut self, cutoff: DateTime<Utc>, keep: impl Fn(&str) -> bool) -> usize {
        let before = self.records.len();
        self.records
            .retain(|id, record| record.last_seen >= cutoff || keep(id));
        let pruned = before - self.records.len();
        if pruned > 0 {
            tracing::debug!("[Sequence] 清除 {} 条空闲记录", pruned);
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
