use serde::{Deserialize, Serialize};

pub const MAX_IMAGES: u32 = 10;
pub const MAX_IMAGES_STREAM: u32 = 2;

#[derive(Debug, Clone, Deserialize)]
pub struct ImageGenerationRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

impl ImageGenerationRequest {
    /// Effective image count: requested `n` clamped to the per-mode cap.
    pub fn effective_n(&self) -> u32 {
        let cap = if self.stream {
            MAX_IMAGES_STREAM
        } else {
            MAX_IMAGES
        };
        self.n.unwrap_or(1).clamp(1, cap)
    }

    pub fn wants_url(&self) -> bool {
        self.response_format.as_deref() == Some("url")
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImageData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImagesResponse {
    pub created: i64,
    pub data: Vec<ImageData>,
}

// ---- Streaming events (`event: image_generation.*`) ----

pub const EVENT_PARTIAL: &str = "image_generation.partial_image";
pub const EVENT_COMPLETED: &str = "image_generation.completed";

#[derive(Debug, Clone, Serialize)]
pub struct PartialImageEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    pub index: u32,
    pub partial_image_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

impl PartialImageEvent {
    pub fn new(created_at: i64, index: u32, partial_image_index: u32) -> Self {
        Self {
            kind: EVENT_PARTIAL,
            b64_json: None,
            url: None,
            created_at,
            size: None,
            index,
            partial_image_index,
            progress: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedImageEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    pub index: u32,
    pub usage: ImageUsage,
}

impl CompletedImageEvent {
    pub fn new(created_at: i64, index: u32) -> Self {
        Self {
            kind: EVENT_COMPLETED,
            b64_json: None,
            url: None,
            created_at,
            size: None,
            index,
            usage: ImageUsage::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImageUsage {
    pub total_tokens: u32,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn n_is_capped_per_mode() {
        let mut request: ImageGenerationRequest =
            serde_json::from_str(r#"{"prompt": "a cat", "n": 50}"#).unwrap();
        assert_eq!(request.effective_n(), 10);
        request.stream = true;
        assert_eq!(request.effective_n(), 2);
    }

    #[test]
    fn default_n_is_one() {
        let request: ImageGenerationRequest =
            serde_json::from_str(r#"{"prompt": "a cat"}"#).unwrap();
        assert_eq!(request.effective_n(), 1);
    }
}
