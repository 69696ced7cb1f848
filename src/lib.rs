//! 有状态多模态推理会话处理器
//!
//! 每个 worker 持有会话图片，同一 sequence 的请求通过粘性路由回到同一 worker；
//! 节点上所有 worker 通过一个文件存储共享已打开会话列表。

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod models;
pub mod server;
pub mod session;

pub use error::{HandlerError, Result, StoreError};
pub use handler::CustomHandler;
