//! worker 内的会话槽位表
//!
//! 每个 worker 最多同时持有 `capacity` 个会话（默认 1 个，即单槽位）。
//! 槽位满时新会话会淘汰最久未使用的会话，状态迁移为：
//! 空 -> 活跃（打开），活跃 -> 空（关闭或被淘汰）。

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

/// 槽位信息
#[derive(Debug, Clone, PartialEq)]
pub struct SlotEntry {
    pub opened_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// 会话槽位表
#[derive(Debug)]
pub struct WorkerSessionTable {
    capacity: usize,
    /// 按打开顺序保存
    slots: IndexMap<String, SlotEntry>,
}

impl Default for WorkerSessionTable {
    fn default() -> Self {
        Self::new(1)
    }
}

impl WorkerSessionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: IndexMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.slots.contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<&SlotEntry> {
        self.slots.get(session_id)
    }

    /// 最近打开的会话
    pub fn active_session(&self) -> Option<&str> {
        self.slots.keys().last().map(String::as_str)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }

    /// 为 `session_id` 腾出位置时需要淘汰的会话（最久未使用）
    ///
    /// 已在表中的会话不需要淘汰任何会话。
    pub fn eviction_candidate(&self, session_id: &str) -> Option<String> {
        if self.contains(session_id) || self.slots.len() < self.capacity {
            return None;
        }
        self.slots
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(id, _)| id.clone())
    }

    /// 登记会话，已存在时只刷新使用时间
    pub fn insert(&mut self, session_id: &str) {
        let now = Utc::now();
        match self.slots.get_mut(session_id) {
            Some(entry) => entry.last_used = now,
            None => {
                self.slots.insert(
                    session_id.to_string(),
                    SlotEntry {
                        opened_at: now,
                        last_used: now,
                    },
                );
            }
        }
    }

    /// 刷新使用时间，会话不在表中时返回 false
    pub fn touch(&mut self, session_id: &str) -> bool {
        match self.slots.get_mut(session_id) {
            Some(entry) => {
                entry.last_used = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, session_id: &str) -> bool {
        self.slots.shift_remove(session_id).is_some()
    }
}
