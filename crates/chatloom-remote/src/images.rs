//! Moves generated images off temporary provider URLs and into the
//! backend's image store.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chatloom_core::{BoxError, ImagePipeline};
use chatloom_llm::ImageGenerationRequest;
use reqwest::multipart::{Form, Part};

use crate::types::UploadResponse;
use crate::{BackendState, HttpBackend};

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("No image data provided")]
    NoImageData,

    #[error("Failed to download image: {0}")]
    Download(String),

    #[error("invalid base64 image: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Failed to upload image: {0}")]
    Upload(String),
}

#[async_trait]
impl ImagePipeline for HttpBackend {
    async fn process(&self, request: &ImageGenerationRequest) -> Result<String, BoxError> {
        let bytes = self.state.image_bytes(request).await?;
        tracing::info!(
            model = %request.model,
            size_kb = bytes.len() / 1024,
            "uploading generated image"
        );
        let url = self.state.upload_image(bytes, request).await?;
        tracing::info!(url = %url, "image uploaded");
        Ok(url)
    }
}

impl BackendState {
    async fn image_bytes(&self, request: &ImageGenerationRequest) -> Result<Vec<u8>, ImageError> {
        if let Some(url) = request.url.as_deref().filter(|u| !u.is_empty()) {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| ImageError::Download(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(ImageError::Download(resp.status().to_string()));
            }
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| ImageError::Download(e.to_string()))?;
            return Ok(bytes.to_vec());
        }
        match request.base64.as_deref().filter(|b| !b.is_empty()) {
            Some(encoded) => Ok(STANDARD.decode(encoded.trim())?),
            None => Err(ImageError::NoImageData),
        }
    }

    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        request: &ImageGenerationRequest,
    ) -> Result<String, ImageError> {
        let original_size = bytes.len();
        let mime = sniff_mime(&bytes);
        let part = Part::bytes(bytes)
            .file_name(format!("image.{}", extension(mime)))
            .mime_str(mime)
            .map_err(|e| ImageError::Upload(e.to_string()))?;
        let form = Form::new()
            .part("image", part)
            .text("model", request.model.clone())
            .text("prompt", request.prompt.clone())
            .text("originalSize", original_size.to_string());

        let sent = self
            .authorize(self.client.post(self.url("/api/images/upload")))
            .multipart(form)
            .send()
            .await;
        self.observe(&sent);
        let resp = sent.map_err(|e| ImageError::Upload(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ImageError::Upload(resp.status().to_string()));
        }
        let uploaded: UploadResponse = resp
            .json()
            .await
            .map_err(|e| ImageError::Upload(e.to_string()))?;
        Ok(uploaded.url)
    }
}

fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

fn extension(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "bin",
    }
}
