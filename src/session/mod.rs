//! 会话管理模块
//!
//! 提供以下功能：
//! - 跨进程文件存储（CAS 原语）
//! - 节点级已打开会话注册表
//! - worker 内的会话槽位表（LRU 淘汰）
//! - 请求分类记录

mod file_store;
mod registry;
mod sequence;
mod state_table;

pub use file_store::{CasOutcome, CompareSetStore, FileStore};
pub use registry::{parse_members, RetryPolicy, SessionRegistry, SESSION_SEPARATOR};
pub use sequence::{SequenceRecord, SequenceTracker};
pub use state_table::{SlotEntry, WorkerSessionTable};
