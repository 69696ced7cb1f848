//! 请求分发处理器
//!
//! 服务运行时每次交付一批请求，处理器依次执行：
//! - `preprocess`: 回写 sequence id 响应头，维护分类记录，解析请求体
//! - `inference`: 按批次顺序把请求交给槽位表与推理引擎
//! - `postprocess`: 生成每个条目的响应
//!
//! 每个条目独立成功或失败，一个条目出错不会影响同批次的其它条目。
//! session id 与 sequence id 是同一个值。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::config::{HandlerSettings, MAX_SESSION_EXPIRY_MINUTES};
use crate::engine::InferenceApi;
use crate::error::{HandlerError, Result, StoreError};
use crate::models::{
    BatchItem, BatchResponse, ClassifiedRequest, ContinueResponse, OpenSessionResponse,
    RequestKind, SessionRequest, StartSessionRequest,
};
use crate::session::{SequenceTracker, SessionRegistry, WorkerSessionTable};

/// 过期时间格式
const EXPIRY_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// 预处理结果：响应头 + 分类后的请求
#[derive(Debug)]
pub struct Prepared {
    pub headers: Vec<(String, String)>,
    pub request: Result<ClassifiedRequest>,
}

/// 推理结果：响应头 + 响应体
#[derive(Debug)]
pub struct Inferred {
    pub headers: Vec<(String, String)>,
    pub result: Result<Value>,
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        Some(entry) => entry.1 = value,
        None => headers.push((name.to_string(), value)),
    }
}

/// 注册表操作会持有文件锁并在冲突时休眠，放到阻塞线程池执行
pub(crate) async fn with_registry<T, F>(registry: Arc<SessionRegistry>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&SessionRegistry) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || op(&registry))
        .await
        .map_err(|e| HandlerError::Store(StoreError::Task(e.to_string())))?
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| HandlerError::Inference(e.to_string()))
}

/// 会话处理器
pub struct CustomHandler {
    settings: HandlerSettings,
    engine: InferenceApi,
    registry: Arc<SessionRegistry>,
    slots: WorkerSessionTable,
    sequences: SequenceTracker,
    /// 模型加载完成后置位，健康检查不经过处理器锁直接读取
    ready: Arc<AtomicBool>,
}

impl CustomHandler {
    pub fn new(
        mut settings: HandlerSettings,
        engine: InferenceApi,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        settings.session_expiry_minutes = settings
            .session_expiry_minutes
            .clamp(1, MAX_SESSION_EXPIRY_MINUTES);
        let slots = WorkerSessionTable::new(settings.max_sessions_per_worker);
        Self {
            settings,
            engine,
            registry,
            slots,
            sequences: SequenceTracker::new(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 加载模型，完成前不应接收流量
    pub async fn initialize(&mut self) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        self.engine.load_model().await?;
        self.ready.store(true, Ordering::SeqCst);
        tracing::info!(
            "[Handler] 初始化完成 (每个 worker 最多 {} 个会话)",
            self.slots.capacity()
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// 与处理器共享的就绪标记
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &InferenceApi {
        &self.engine
    }

    pub fn sequences(&self) -> &SequenceTracker {
        &self.sequences
    }

    /// 最近打开的会话
    pub fn active_session(&self) -> Option<&str> {
        self.slots.active_session()
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.slots.session_ids()
    }

    /// 处理一批请求
    pub async fn handle(&mut self, batch: Vec<BatchItem>) -> Vec<BatchResponse> {
        let prepared = self.preprocess(&batch);
        let inferred = self.inference(prepared).await;
        self.postprocess(inferred)
    }

    // ========================================================================
    // 预处理
    // ========================================================================

    pub fn preprocess(&mut self, batch: &[BatchItem]) -> Vec<Prepared> {
        self.prune_idle_sequences();
        batch
            .iter()
            .map(|item| {
                let mut headers = Vec::new();
                let request = self.classify(item, &mut headers);
                if let Err(e) = &request {
                    tracing::warn!(
                        "[Handler] 请求分类失败 sequence_id={} request_id={}: {}",
                        item.sequence_id,
                        item.request_id,
                        e
                    );
                    // 开启序列的请求失败时不留下记录
                    if item.sequence_start {
                        self.sequences.purge(&item.sequence_id);
                    }
                }
                Prepared { headers, request }
            })
            .collect()
    }

    /// 清除超过会话过期时间且会话已不在本 worker 的记录
    fn prune_idle_sequences(&mut self) {
        let cutoff =
            Utc::now() - chrono::Duration::minutes(self.settings.session_expiry_minutes);
        let slots = &self.slots;
        self.sequences
            .prune_idle(cutoff, |sequence_id| slots.contains(sequence_id));
    }

    fn classify(
        &mut self,
        item: &BatchItem,
        headers: &mut Vec<(String, String)>,
    ) -> Result<ClassifiedRequest> {
        let sequence_id = item.sequence_id.as_str();
        let header_names = &self.settings.headers;

        // 粘性路由依赖响应头中的 sequence id，无论成功与否都要回写
        set_header(headers, &header_names.sequence_id, sequence_id.to_string());

        if item.sequence_start {
            self.sequences.begin(sequence_id);
        } else {
            self.sequences.resume(sequence_id)?;
        }

        if self.sequences.is_seen(sequence_id, &item.request_id) {
            tracing::info!(
                "[Handler] 收到重复投递 sequence_id={} request_id={}",
                sequence_id,
                item.request_id
            );
            return Ok(ClassifiedRequest {
                sequence_id: sequence_id.to_string(),
                request_id: item.request_id.clone(),
                sequence_start: item.sequence_start,
                kind: RequestKind::Continue {
                    session_id: sequence_id.to_string(),
                },
            });
        }

        tracing::info!(
            "[Handler] 收到新请求 sequence_id={} request_id={}",
            sequence_id,
            item.request_id
        );
        let request = match item.body.decode()? {
            SessionRequest::StartSession(start) => {
                let expiry = Utc::now()
                    + chrono::Duration::minutes(self.settings.session_expiry_minutes);
                set_header(
                    headers,
                    &header_names.sequence_id,
                    format!("{}; Expires={}", sequence_id, expiry.format(EXPIRY_FORMAT)),
                );
                SessionRequest::StartSession(StartSessionRequest {
                    session_id: Some(sequence_id.to_string()),
                    ..start
                })
            }
            SessionRequest::CloseSession(close) => {
                Self::ensure_same_session(sequence_id, &close.session_id)?;
                self.sequences.mark_end(sequence_id);
                set_header(headers, &header_names.sequence_end, sequence_id.to_string());
                SessionRequest::CloseSession(close)
            }
            SessionRequest::SendTextPrompt(prompt) => {
                Self::ensure_same_session(sequence_id, &prompt.session_id)?;
                SessionRequest::SendTextPrompt(prompt)
            }
        };
        self.sequences
            .register_request(sequence_id, &item.request_id);

        Ok(ClassifiedRequest {
            sequence_id: sequence_id.to_string(),
            request_id: item.request_id.clone(),
            sequence_start: item.sequence_start,
            kind: RequestKind::Fresh(request),
        })
    }

    fn ensure_same_session(sequence_id: &str, session_id: &str) -> Result<()> {
        if sequence_id != session_id {
            return Err(HandlerError::protocol(
                sequence_id,
                format!("request targets session {}", session_id),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // 推理
    // ========================================================================

    pub async fn inference(&mut self, batch: Vec<Prepared>) -> Vec<Inferred> {
        let mut results = Vec::with_capacity(batch.len());
        for Prepared { headers, request } in batch {
            let result = match request {
                Ok(classified) => self.run(classified).await,
                Err(e) => Err(e),
            };
            results.push(Inferred { headers, result });
        }
        results
    }

    async fn run(&mut self, classified: ClassifiedRequest) -> Result<Value> {
        let ClassifiedRequest {
            sequence_id,
            request_id,
            sequence_start,
            kind,
        } = classified;
        tracing::debug!(
            "[Handler] 处理 sequence_id={} request_id={}",
            sequence_id,
            request_id
        );

        let request = match kind {
            RequestKind::Continue { session_id } => {
                self.slots.touch(&session_id);
                return to_json(&ContinueResponse { session_id });
            }
            RequestKind::Fresh(request) => request,
        };

        let result = match request {
            SessionRequest::StartSession(start) => self.start(start).await,
            SessionRequest::CloseSession(close) => {
                match self.close_session(&close.session_id).await {
                    Ok(()) => to_json(&self.engine.close_session(&close)),
                    Err(e) => Err(e),
                }
            }
            SessionRequest::SendTextPrompt(prompt) => {
                self.slots.touch(&prompt.session_id);
                match self.engine.send_text_prompt(&prompt).await {
                    Ok(response) => to_json(&response),
                    Err(e) => Err(e),
                }
            }
        };

        self.sequences.complete_request(&sequence_id);
        if result.is_err() && sequence_start {
            self.sequences.purge(&sequence_id);
        }
        result
    }

    async fn start(&mut self, request: StartSessionRequest) -> Result<Value> {
        let session_id = match &request.session_id {
            Some(id) => id.clone(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        self.open_session(&session_id).await?;

        match self.engine.start_session(request).await {
            Ok(opened) => to_json(&OpenSessionResponse {
                session_id: opened.session_id,
            }),
            Err(e) => {
                // 图片获取失败时不保留会话，重新打开已有会话时旧图片也一并清除
                self.engine.clear_session_state(&session_id);
                if let Err(close_err) = self.close_session(&session_id).await {
                    tracing::error!(
                        "[Handler] 回滚会话 {} 失败: {}",
                        session_id,
                        close_err
                    );
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // 会话槽位
    // ========================================================================

    /// 打开会话；槽位已满时先淘汰最久未使用的会话
    ///
    /// 被淘汰会话的分类记录保留，后续请求得到 session not found。
    pub async fn open_session(&mut self, session_id: &str) -> Result<()> {
        while let Some(victim) = self.slots.eviction_candidate(session_id) {
            tracing::info!(
                "[Handler] 淘汰会话 {} 以打开会话 {}",
                victim,
                session_id
            );
            self.engine.clear_session_state(&victim);
            self.close_session(&victim).await?;
        }

        tracing::info!("[Handler] 打开会话 {}", session_id);
        let id = session_id.to_string();
        with_registry(self.registry.clone(), move |registry| registry.open(&id)).await?;
        self.slots.insert(session_id);
        Ok(())
    }

    /// 关闭会话：从注册表移除，并释放本 worker 的槽位
    pub async fn close_session(&mut self, session_id: &str) -> Result<()> {
        let id = session_id.to_string();
        with_registry(self.registry.clone(), move |registry| registry.close(&id)).await?;
        if self.slots.remove(session_id) {
            tracing::info!("[Handler] 会话 {} 已释放槽位", session_id);
        }
        Ok(())
    }

    // ========================================================================
    // 后处理
    // ========================================================================

    pub fn postprocess(&self, batch: Vec<Inferred>) -> Vec<BatchResponse> {
        batch
            .into_iter()
            .map(|Inferred { headers, result }| match result {
                Ok(body) => BatchResponse {
                    headers,
                    status: axum::http::StatusCode::OK,
                    body,
                },
                Err(e) => {
                    tracing::error!("[Handler] 请求失败 ({}): {}", e.kind(), e);
                    BatchResponse {
                        headers,
                        status: e.status_code(),
                        body: e.to_body(),
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests;
