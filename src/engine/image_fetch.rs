//! 会话图片获取
//!
//! 下载图片并解码为 RGB8，会话存活期间一直保存在内存中。

use async_trait::async_trait;
use image::DynamicImage;
use reqwest::Client;

use crate::error::{HandlerError, Result};

/// 图片来源
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<DynamicImage>;
}

/// 将图片字节解码为 RGB8
pub fn decode_image(url: &str, bytes: &[u8]) -> Result<DynamicImage> {
    let image = image::load_from_memory(bytes).map_err(|e| HandlerError::ResourceFetch {
        url: url.to_string(),
        reason: format!("图片解码失败: {}", e),
    })?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

/// 通过 HTTP(S) 下载图片
pub struct HttpImageFetcher {
    client: Client,
}

impl Default for HttpImageFetcher {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

impl HttpImageFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<DynamicImage> {
        let fetch_error = |reason: String| HandlerError::ResourceFetch {
            url: url.to_string(),
            reason,
        };

        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(fetch_error("只支持 http/https 地址".to_string()));
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error(format!("HTTP {}", status)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        tracing::debug!("[ImageFetch] 下载完成 {} ({} bytes)", url, bytes.len());
        decode_image(url, &bytes)
    }
}
