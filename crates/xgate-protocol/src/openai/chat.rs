use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Inbound `/v1/chat/completions` body. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub video_config: Option<VideoRequestConfig>,
    #[serde(default)]
    pub image_config: Option<ImageRequestConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

/// `content` is either a bare string or a list of typed blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrlPart,
    },
    InputAudio {
        input_audio: InputAudioPart,
    },
    File {
        file: FilePart,
    },
    /// Unrecognized block types are carried but contribute nothing.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageUrlPart {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputAudioPart {
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilePart {
    pub file_data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoRequestConfig {
    #[serde(default)]
    pub resolution_name: Option<String>,
    #[serde(default)]
    pub video_length: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageRequestConfig {
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
}

// ---- Streaming output ----

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: i64,
    pub delta: ChunkDelta,
    pub logprobs: Option<JsonValue>,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl ChatCompletionChunk {
    fn base(id: &str, created: i64, model: &str, fingerprint: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            system_fingerprint: fingerprint.map(ToOwned::to_owned),
            choices: Vec::new(),
        }
    }

    pub fn role(id: &str, created: i64, model: &str, fingerprint: Option<&str>) -> Self {
        let mut chunk = Self::base(id, created, model, fingerprint);
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role: Some("assistant"),
                content: Some(String::new()),
                reasoning_content: None,
            },
            logprobs: None,
            finish_reason: None,
        });
        chunk
    }

    pub fn content(
        id: &str,
        created: i64,
        model: &str,
        fingerprint: Option<&str>,
        text: String,
    ) -> Self {
        let mut chunk = Self::base(id, created, model, fingerprint);
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role: None,
                content: Some(text),
                reasoning_content: None,
            },
            logprobs: None,
            finish_reason: None,
        });
        chunk
    }

    pub fn reasoning(
        id: &str,
        created: i64,
        model: &str,
        fingerprint: Option<&str>,
        text: String,
    ) -> Self {
        let mut chunk = Self::base(id, created, model, fingerprint);
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role: None,
                content: None,
                reasoning_content: Some(text),
            },
            logprobs: None,
            finish_reason: None,
        });
        chunk
    }

    pub fn finish(
        id: &str,
        created: i64,
        model: &str,
        fingerprint: Option<&str>,
        reason: &'static str,
    ) -> Self {
        let mut chunk = Self::base(id, created, model, fingerprint);
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta: ChunkDelta::default(),
            logprobs: None,
            finish_reason: Some(reason),
        });
        chunk
    }
}

// ---- Non-stream output ----

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
    pub choices: Vec<CompletionChoice>,
    pub usage: CompletionUsage,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionChoice {
    pub index: i64,
    pub message: AssistantMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
    pub refusal: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompletionUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl ChatCompletion {
    pub fn assistant(
        id: String,
        created: i64,
        model: &str,
        fingerprint: Option<String>,
        content: String,
        reasoning_content: Option<String>,
    ) -> Self {
        Self {
            id,
            object: "chat.completion",
            created,
            model: model.to_string(),
            system_fingerprint: fingerprint,
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant",
                    content,
                    refusal: None,
                    reasoning_content,
                },
                finish_reason: "stop",
            }],
            usage: CompletionUsage::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ignores_unknown_fields() {
        let raw = r#"{
            "model": "grok-4",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
            "temperature": 0.7,
            "tools": []
        }"#;
        let request: ChatCompletionRequest = serde_json::from_str(raw).unwrap();
        assert!(request.stream);
        assert_eq!(request.messages.len(), 1);
    }

    #[test]
    fn multimodal_parts_decode() {
        let raw = r#"{
            "model": "grok-4",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "describe"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AA=="}},
                {"type": "something_new", "payload": 1}
            ]}]
        }"#;
        let request: ChatCompletionRequest = serde_json::from_str(raw).unwrap();
        let MessageContent::Parts(parts) = &request.messages[0].content else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 3);
        assert!(matches!(parts[2], ContentPart::Unknown));
    }

    #[test]
    fn chunk_serializes_without_empty_fields() {
        let chunk = ChatCompletionChunk::content("chatcmpl-1", 0, "grok-4", None, "hi".into());
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(json.contains(r#""content":"hi""#));
        assert!(!json.contains("reasoning_content"));
        assert!(!json.contains("system_fingerprint"));
    }
}
