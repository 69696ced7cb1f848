//! 视觉语言模型后端
//!
//! 推理引擎只依赖 [`VisionLanguageModel`] 这一层接口：加载模型、套用对话模板、
//! 以固定解码参数生成文本。张量计算由外部模型服务完成，[`HttpModelBackend`]
//! 通过 HTTP 调用它。

use std::io::Cursor;

use async_trait::async_trait;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::GenerationConfig;
use crate::error::{HandlerError, Result};

/// 生成结束标记
pub const END_OF_TURN: &str = "<|eot_id|>";

/// 对话内容片段
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    /// 图片占位，实际像素随请求单独传递
    Image,
    Text { text: String },
}

/// 一轮对话
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: Vec<ContentItem>,
}

impl ChatTurn {
    /// 单图单文本的用户轮次
    pub fn user_with_image(text: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: vec![
                ContentItem::Image,
                ContentItem::Text {
                    text: text.to_string(),
                },
            ],
        }
    }
}

/// 解码参数
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_new_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self::from(&GenerationConfig::default())
    }
}

impl From<&GenerationConfig> for GenerationParams {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            max_new_tokens: config.max_new_tokens,
        }
    }
}

/// Llama 3.2 Vision 对话模板
pub fn render_llama_vision_prompt(conversation: &[ChatTurn], add_generation_prompt: bool) -> String {
    let mut prompt = String::from("<|begin_of_text|>");
    for turn in conversation {
        prompt.push_str("<|start_header_id|>");
        prompt.push_str(&turn.role);
        prompt.push_str("<|end_header_id|>\n\n");
        for item in &turn.content {
            match item {
                ContentItem::Image => prompt.push_str("<|image|>"),
                ContentItem::Text { text } => prompt.push_str(text),
            }
        }
        prompt.push_str(END_OF_TURN);
    }
    if add_generation_prompt {
        prompt.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    }
    prompt
}

/// 视觉语言模型
#[async_trait]
pub trait VisionLanguageModel: Send + Sync {
    /// 加载模型权重与处理器
    async fn load(&self) -> Result<()>;

    /// 将对话渲染为模型输入文本（带生成提示）
    fn apply_chat_template(&self, conversation: &[ChatTurn]) -> String {
        render_llama_vision_prompt(conversation, true)
    }

    /// 生成并解码，返回值包含回显的提示文本
    async fn generate(
        &self,
        image: &DynamicImage,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    #[serde(default)]
    model_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    inputs: &'a str,
    /// base64 编码的 PNG
    image: String,
    parameters: GenerateParameters<'a>,
}

#[derive(Debug, Serialize)]
struct GenerateParameters<'a> {
    #[serde(flatten)]
    params: &'a GenerationParams,
    do_sample: bool,
    return_full_text: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    generated_text: String,
}

/// 通过 HTTP 调用外部模型服务
pub struct HttpModelBackend {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpModelBackend {
    pub fn new(client: Client, base_url: &str, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn encode_png(image: &DynamicImage) -> Result<String> {
        let mut buf = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| HandlerError::Inference(format!("图片编码失败: {}", e)))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(buf))
    }
}

#[async_trait]
impl VisionLanguageModel for HttpModelBackend {
    async fn load(&self) -> Result<()> {
        let url = format!("{}/info", self.base_url);
        tracing::info!("[ModelBackend] 检查模型服务: {}", url);

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| HandlerError::ModelLoad(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(HandlerError::ModelLoad(format!(
                "{} 返回 HTTP {}",
                url,
                response.status()
            )));
        }

        let info: ModelInfo = response
            .json()
            .await
            .map_err(|e| HandlerError::ModelLoad(format!("解析模型信息失败: {}", e)))?;
        tracing::info!(
            "[ModelBackend] 模型已就绪: {}",
            info.model_id.as_deref().unwrap_or("unknown")
        );
        Ok(())
    }

    async fn generate(
        &self,
        image: &DynamicImage,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String> {
        let body = GenerateRequest {
            inputs: prompt,
            image: Self::encode_png(image)?,
            parameters: GenerateParameters {
                params,
                do_sample: params.temperature > 0.0,
                return_full_text: true,
            },
        };

        let response = self
            .authorize(self.client.post(format!("{}/generate", self.base_url)))
            .json(&body)
            .send()
            .await
            .map_err(|e| HandlerError::Inference(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HandlerError::Inference(format!(
                "模型服务返回 HTTP {}: {}",
                status, text
            )));
        }

        let generated: GenerateResponse = response
            .json()
            .await
            .map_err(|e| HandlerError::Inference(format!("解析生成结果失败: {}", e)))?;
        Ok(generated.generated_text)
    }
}
