//! 测试用模型与图片源

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};

use super::backend::{GenerationParams, VisionLanguageModel, END_OF_TURN};
use super::image_fetch::ImageFetcher;
use crate::error::{HandlerError, Result};

/// 回显提示文本并追加固定回答，模拟真实模型的解码输出
pub struct MockVisionModel {
    reply: String,
    fail_load: bool,
    loads: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockVisionModel {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            fail_load: false,
            loads: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_load() -> Self {
        Self {
            fail_load: true,
            ..Self::new("")
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl VisionLanguageModel for MockVisionModel {
    async fn load(&self) -> Result<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_load {
            return Err(HandlerError::ModelLoad("weights unavailable".to_string()));
        }
        Ok(())
    }

    async fn generate(
        &self,
        _image: &DynamicImage,
        prompt: &str,
        _params: &GenerationParams,
    ) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(format!("{}{}{}", prompt, self.reply, END_OF_TURN))
    }
}

/// 返回固定的小图片；`MISSING_URL` 模拟下载失败
pub struct StaticImageFetcher;

impl StaticImageFetcher {
    pub const MISSING_URL: &'static str = "https://example/missing.jpg";
}

#[async_trait]
impl ImageFetcher for StaticImageFetcher {
    async fn fetch(&self, url: &str) -> Result<DynamicImage> {
        if url == Self::MISSING_URL {
            return Err(HandlerError::ResourceFetch {
                url: url.to_string(),
                reason: "HTTP 404 Not Found".to_string(),
            });
        }
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            2,
            2,
            Rgb([200, 120, 40]),
        )))
    }
}
