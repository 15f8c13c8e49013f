use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

/// Body for `POST /rest/app-chat/conversations/new`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayload {
    pub temporary: bool,
    pub model_name: String,
    pub message: String,
    pub file_attachments: Vec<String>,
    pub image_attachments: Vec<String>,
    pub disable_search: bool,
    pub enable_image_generation: bool,
    pub return_image_bytes: bool,
    pub enable_image_streaming: bool,
    pub image_generation_count: u32,
    pub force_concise: bool,
    pub tool_overrides: Map<String, JsonValue>,
    pub send_final_metadata: bool,
    pub is_reasoning: bool,
    pub webpage_urls: Vec<String>,
    pub disable_text_follow_ups: bool,
    pub response_metadata: JsonValue,
    pub disable_memory: bool,
    pub model_mode: String,
    pub is_async_chat: bool,
}

impl ConversationPayload {
    pub fn new(model_name: &str, model_mode: &str, message: String, temporary: bool) -> Self {
        Self {
            temporary,
            model_name: model_name.to_string(),
            message,
            file_attachments: Vec::new(),
            image_attachments: Vec::new(),
            disable_search: false,
            enable_image_generation: true,
            return_image_bytes: false,
            enable_image_streaming: true,
            image_generation_count: 2,
            force_concise: false,
            tool_overrides: Map::new(),
            send_final_metadata: true,
            is_reasoning: false,
            webpage_urls: Vec::new(),
            disable_text_follow_ups: true,
            response_metadata: json!({
                "requestModelDetails": {"modelId": model_name}
            }),
            disable_memory: false,
            model_mode: model_mode.to_string(),
            is_async_chat: false,
        }
    }
}

/// One parsed upstream stream event. A single NDJSON line can decode into
/// several of these (metadata plus a token, for example).
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Meta(StreamMeta),
    Delta { text: String },
    Reasoning { text: String },
    ImageProgress { index: u32, progress: u8 },
    VideoProgress(VideoProgress),
    Final(FinalResponse),
    Error(UpstreamErrorEvent),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamMeta {
    pub response_id: Option<String>,
    pub model_hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoProgress {
    pub progress: u8,
    pub video_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalResponse {
    pub message: String,
    pub image_urls: Vec<String>,
    pub model_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamErrorEvent {
    pub kind: String,
    pub message: String,
    pub http_status: Option<u16>,
}

/// Decode one upstream NDJSON line into events.
///
/// Returns `Err` only on malformed JSON; unknown-but-valid shapes decode to
/// an empty vec so new upstream fields never break a stream.
pub fn parse_event_line(line: &str) -> Result<Vec<UpstreamEvent>, serde_json::Error> {
    let value: JsonValue = serde_json::from_str(line)?;
    let mut events = Vec::new();

    if let Some(error) = value.get("error") {
        events.push(UpstreamEvent::Error(UpstreamErrorEvent {
            kind: error
                .get("code")
                .map(|code| code.to_string())
                .unwrap_or_else(|| "upstream_error".to_string()),
            message: error
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or("upstream error")
                .to_string(),
            http_status: None,
        }));
        return Ok(events);
    }

    let Some(response) = value.get("result").and_then(|r| r.get("response")) else {
        return Ok(events);
    };

    let mut meta = StreamMeta::default();
    if let Some(id) = response.get("responseId").and_then(JsonValue::as_str) {
        meta.response_id = Some(id.to_string());
    }
    if let Some(hash) = response
        .get("llmInfo")
        .and_then(|info| info.get("modelHash"))
        .and_then(JsonValue::as_str)
    {
        meta.model_hash = Some(hash.to_string());
    }
    if meta != StreamMeta::default() {
        events.push(UpstreamEvent::Meta(meta));
    }

    if let Some(image) = response.get("streamingImageGenerationResponse") {
        events.push(UpstreamEvent::ImageProgress {
            index: image
                .get("imageIndex")
                .and_then(JsonValue::as_u64)
                .unwrap_or(0) as u32,
            progress: image
                .get("progress")
                .and_then(JsonValue::as_u64)
                .unwrap_or(0)
                .min(100) as u8,
        });
    }

    if let Some(video) = response.get("streamingVideoGenerationResponse") {
        events.push(UpstreamEvent::VideoProgress(VideoProgress {
            progress: video
                .get("progress")
                .and_then(JsonValue::as_u64)
                .unwrap_or(0)
                .min(100) as u8,
            video_url: video
                .get("videoUrl")
                .and_then(JsonValue::as_str)
                .filter(|url| !url.is_empty())
                .map(ToOwned::to_owned),
            thumbnail_url: video
                .get("thumbnailImageUrl")
                .and_then(JsonValue::as_str)
                .filter(|url| !url.is_empty())
                .map(ToOwned::to_owned),
        }));
    }

    if let Some(model_response) = response.get("modelResponse") {
        events.push(UpstreamEvent::Final(FinalResponse {
            message: model_response
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
            image_urls: collect_image_urls(model_response),
            model_hash: model_response
                .get("metadata")
                .and_then(|meta| meta.get("llm_info"))
                .and_then(|info| info.get("modelHash"))
                .and_then(JsonValue::as_str)
                .map(ToOwned::to_owned),
        }));
    }

    if let Some(token) = response.get("token").and_then(JsonValue::as_str) {
        if !token.is_empty() {
            let thinking = response
                .get("isThinking")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false);
            events.push(if thinking {
                UpstreamEvent::Reasoning {
                    text: token.to_string(),
                }
            } else {
                UpstreamEvent::Delta {
                    text: token.to_string(),
                }
            });
        }
    }

    Ok(events)
}

const IMAGE_URL_KEYS: &[&str] = &["generatedImageUrls", "imageUrls", "imageURLs"];

/// Generated asset URLs appear under several historical key spellings and
/// at varying depths; walk the whole value and dedupe.
pub fn collect_image_urls(value: &JsonValue) -> Vec<String> {
    fn walk(value: &JsonValue, seen: &mut Vec<String>) {
        match value {
            JsonValue::Object(map) => {
                for (key, item) in map {
                    if IMAGE_URL_KEYS.contains(&key.as_str()) {
                        match item {
                            JsonValue::Array(urls) => {
                                for url in urls.iter().filter_map(JsonValue::as_str) {
                                    push_unique(seen, url);
                                }
                            }
                            JsonValue::String(url) => push_unique(seen, url),
                            _ => {}
                        }
                        continue;
                    }
                    walk(item, seen);
                }
            }
            JsonValue::Array(items) => {
                for item in items {
                    walk(item, seen);
                }
            }
            _ => {}
        }
    }

    fn push_unique(seen: &mut Vec<String>, url: &str) {
        if !url.is_empty() && !seen.iter().any(|existing| existing == url) {
            seen.push(url.to_string());
        }
    }

    let mut urls = Vec::new();
    walk(value, &mut urls);
    urls
}

/// `POST /rest/rate-limits` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSnapshot {
    #[serde(default)]
    pub remaining_queries: Option<i64>,
    #[serde(default)]
    pub remaining_tokens: Option<i64>,
    #[serde(default)]
    pub wait_time_seconds: Option<i64>,
}

// ---- Imagine WebSocket wire ----

/// Outbound request frame for the imagine listen socket.
pub fn imagine_request(
    request_id: &str,
    prompt: &str,
    aspect_ratio: &str,
    enable_nsfw: bool,
    timestamp_ms: i64,
) -> JsonValue {
    json!({
        "type": "conversation.item.create",
        "timestamp": timestamp_ms,
        "item": {
            "type": "message",
            "content": [{
                "requestId": request_id,
                "text": prompt,
                "type": "input_text",
                "properties": {
                    "section_count": 0,
                    "is_kids_mode": false,
                    "enable_nsfw": enable_nsfw,
                    "skip_upsampler": false,
                    "is_initial": false,
                    "aspect_ratio": aspect_ratio,
                },
            }],
        },
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum WsServerMessage {
    Image { url: String, blob: String },
    Error { code: String, message: String },
    Other,
}

impl WsServerMessage {
    pub fn parse(text: &str) -> Option<Self> {
        let value: JsonValue = serde_json::from_str(text).ok()?;
        match value.get("type").and_then(JsonValue::as_str) {
            Some("image") => Some(WsServerMessage::Image {
                url: value
                    .get("url")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
                blob: value
                    .get("blob")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            Some("error") => Some(WsServerMessage::Error {
                code: value
                    .get("err_code")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("upstream_error")
                    .to_string(),
                message: value
                    .get("err_msg")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            _ => Some(WsServerMessage::Other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_line_parses_to_delta() {
        let events =
            parse_event_line(r#"{"result":{"response":{"token":"hel","isThinking":false}}}"#)
                .unwrap();
        assert_eq!(
            events,
            vec![UpstreamEvent::Delta {
                text: "hel".to_string()
            }]
        );
    }

    #[test]
    fn thinking_token_routes_to_reasoning() {
        let events =
            parse_event_line(r#"{"result":{"response":{"token":"hmm","isThinking":true}}}"#)
                .unwrap();
        assert!(matches!(events[0], UpstreamEvent::Reasoning { .. }));
    }

    #[test]
    fn final_response_collects_nested_urls() {
        let line = r#"{"result":{"response":{"modelResponse":{
            "message": "done",
            "generatedImageUrls": ["/users/a/generated/1/image.jpg"],
            "inner": {"imageUrls": ["/users/a/generated/2/image.jpg"]}
        }}}}"#;
        let events = parse_event_line(line).unwrap();
        let UpstreamEvent::Final(final_response) = &events[0] else {
            panic!("expected final");
        };
        assert_eq!(final_response.image_urls.len(), 2);
    }

    #[test]
    fn malformed_line_is_an_error() {
        assert!(parse_event_line("{not json").is_err());
    }

    #[test]
    fn unknown_shape_decodes_to_nothing() {
        assert!(parse_event_line(r#"{"something": "else"}"#).unwrap().is_empty());
    }

    #[test]
    fn ws_error_frame_parses() {
        let message =
            WsServerMessage::parse(r#"{"type":"error","err_code":"blocked","err_msg":"nope"}"#)
                .unwrap();
        assert_eq!(
            message,
            WsServerMessage::Error {
                code: "blocked".to_string(),
                message: "nope".to_string()
            }
        );
    }
}
