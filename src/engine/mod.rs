//! 推理引擎
//!
//! 包装一个已加载的视觉语言模型，对外提供三种会话级操作：
//! 开始会话（预加载图片）、发送文本提示、关闭会话。
//! 引擎不可重入，同一进程内只能串行调用。

mod backend;
mod image_fetch;
mod timing;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use image::DynamicImage;

use crate::error::{HandlerError, Result};
use crate::models::{
    CloseSessionRequest, CloseSessionResponse, OpenSessionResponse, StartSessionRequest,
    TextPromptRequest, TextPromptResponse,
};

pub use backend::{
    render_llama_vision_prompt, ChatTurn, ContentItem, GenerationParams, HttpModelBackend,
    VisionLanguageModel, END_OF_TURN,
};
pub use image_fetch::{decode_image, HttpImageFetcher, ImageFetcher};
pub use timing::TimingGuard;

/// 会话状态：会话存活期间保存的图片
#[derive(Debug, Clone)]
pub struct SessionState {
    pub image: DynamicImage,
}

/// 推理会话
#[derive(Debug, Clone)]
pub struct InferenceSession {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub last_use_time: DateTime<Utc>,
    pub state: SessionState,
}

/// 推理 API
pub struct InferenceApi {
    model: Arc<dyn VisionLanguageModel>,
    fetcher: Arc<dyn ImageFetcher>,
    params: GenerationParams,
    fetch_timeout: Option<Duration>,
    generation_timeout: Option<Duration>,
    sessions: HashMap<String, InferenceSession>,
    loaded: bool,
}

impl InferenceApi {
    pub fn new(
        model: Arc<dyn VisionLanguageModel>,
        fetcher: Arc<dyn ImageFetcher>,
        params: GenerationParams,
    ) -> Self {
        Self {
            model,
            fetcher,
            params,
            fetch_timeout: None,
            generation_timeout: None,
            sessions: HashMap::new(),
            loaded: false,
        }
    }

    /// 设置图片下载与生成的超时，`None` 表示无限等待
    pub fn with_timeouts(
        mut self,
        fetch_timeout: Option<Duration>,
        generation_timeout: Option<Duration>,
    ) -> Self {
        self.fetch_timeout = fetch_timeout;
        self.generation_timeout = generation_timeout;
        self
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn session(&self, session_id: &str) -> Option<&InferenceSession> {
        self.sessions.get(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// 加载模型；失败时 worker 不应接收流量
    pub async fn load_model(&mut self) -> Result<()> {
        let _timing = TimingGuard::start("load_model");
        if self.loaded {
            tracing::warn!("[InferenceApi] 模型已加载，重新加载");
        }
        self.loaded = false;
        self.model.load().await?;
        self.loaded = true;
        tracing::info!("[InferenceApi] 模型加载完成");
        Ok(())
    }

    /// 下载图片并创建会话
    pub async fn start_session(
        &mut self,
        request: StartSessionRequest,
    ) -> Result<OpenSessionResponse> {
        let _timing = TimingGuard::start("start_session");
        let session_id = request
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let image = self.fetch_image(&request.path).await?;
        let now = Utc::now();
        let session = InferenceSession {
            session_id: session_id.clone(),
            start_time: now,
            last_use_time: now,
            state: SessionState { image },
        };
        self.sessions.insert(session_id.clone(), session);

        tracing::info!(
            "[InferenceApi] 会话 {} 已创建 (图片: {})",
            session_id,
            request.path
        );
        Ok(OpenSessionResponse { session_id })
    }

    /// 关闭会话，会话不存在也视为成功
    pub fn close_session(&mut self, request: &CloseSessionRequest) -> CloseSessionResponse {
        let _timing = TimingGuard::start("close_session");
        self.clear_session_state(&request.session_id);
        CloseSessionResponse { success: true }
    }

    /// 基于会话图片回答文本提示
    pub async fn send_text_prompt(
        &mut self,
        request: &TextPromptRequest,
    ) -> Result<TextPromptResponse> {
        let _timing = TimingGuard::start("send_text_prompt");
        if !self.loaded {
            return Err(HandlerError::ModelNotLoaded);
        }

        let session = self
            .sessions
            .get_mut(&request.session_id)
            .ok_or_else(|| HandlerError::SessionNotFound(request.session_id.clone()))?;
        session.last_use_time = Utc::now();

        let conversation = [ChatTurn::user_with_image(&request.prompt_text)];
        let prompt = self.model.apply_chat_template(&conversation);

        let generation = self
            .model
            .generate(&session.state.image, &prompt, &self.params);
        let decoded = match self.generation_timeout {
            Some(limit) => tokio::time::timeout(limit, generation)
                .await
                .map_err(|_| {
                    HandlerError::Inference(format!("generation timed out after {:?}", limit))
                })??,
            None => generation.await?,
        };

        Ok(TextPromptResponse {
            response_text: strip_prompt_echo(&decoded, &prompt),
        })
    }

    /// 清除会话状态，返回会话是否存在
    pub fn clear_session_state(&mut self, session_id: &str) -> bool {
        let _timing = TimingGuard::start("clear_session_state");
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            tracing::info!("[InferenceApi] 会话 {} 状态已清除", session_id);
        }
        removed
    }

    async fn fetch_image(&self, url: &str) -> Result<DynamicImage> {
        let _timing = TimingGuard::start("fetch_image");
        let fetch = self.fetcher.fetch(url);
        match self.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, fetch).await.map_err(|_| {
                HandlerError::ResourceFetch {
                    url: url.to_string(),
                    reason: format!("timed out after {:?}", limit),
                }
            })?,
            None => fetch.await,
        }
    }
}

/// 去掉解码结果中回显的提示文本和结束标记
pub fn strip_prompt_echo(decoded: &str, prompt: &str) -> String {
    let body = match decoded.strip_prefix(prompt) {
        Some(rest) => rest,
        None if prompt.len() >= decoded.len() => "",
        None => {
            // 解码文本与提示不完全一致时按长度截断
            let mut cut = prompt.len();
            while !decoded.is_char_boundary(cut) {
                cut += 1;
            }
            &decoded[cut..]
        }
    };
    body.trim_end()
        .trim_end_matches(END_OF_TURN)
        .trim()
        .to_string()
}
