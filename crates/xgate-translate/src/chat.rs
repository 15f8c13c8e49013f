use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use xgate_protocol::ndjson::LineDecoder;
use xgate_protocol::openai::chat::ChatCompletionChunk;
use xgate_protocol::upstream::{parse_event_line, UpstreamEvent};

use crate::tag_filter::TagFilter;
use crate::TranslateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

/// One translator output. `Chunk` is ready to serialize; the media
/// variants need the driver to resolve a gateway URL (a suspension point
/// the translator itself never takes).
#[derive(Debug)]
pub enum ChatOutput {
    Chunk(ChatCompletionChunk),
    /// A generated image referenced by upstream path.
    ImageReady { path: String },
    /// A finished video (progress reached 100).
    VideoReady {
        video_path: String,
        thumbnail_path: Option<String>,
    },
    /// Terminal marker; the driver emits the finish chunk and `[DONE]`.
    Done,
}

/// Chat/video NDJSON stream → OpenAI chunk sequence.
///
/// Also used for non-stream requests: the driver collects the emitted
/// content instead of forwarding it.
pub struct ChatTranslator {
    model: String,
    created: i64,
    response_id: String,
    fingerprint: Option<String>,
    show_reasoning: bool,
    role_sent: bool,
    saw_delta: bool,
    saw_terminal: bool,
    decoder: LineDecoder,
    filter: TagFilter,
    protocol_faults: u32,
}

impl ChatTranslator {
    pub fn new(model: &str, created: i64, show_reasoning: bool, filter_tags: &[String]) -> Self {
        Self {
            model: model.to_string(),
            created,
            response_id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            fingerprint: None,
            show_reasoning,
            role_sent: false,
            saw_delta: false,
            saw_terminal: false,
            decoder: LineDecoder::new(),
            filter: TagFilter::new(filter_tags),
            protocol_faults: 0,
        }
    }

    /// Structural validity: the pool only resets failure accounting when
    /// the stream produced at least one delta or reached its terminal
    /// marker.
    pub fn structurally_valid(&self) -> bool {
        self.saw_delta || self.saw_terminal
    }

    pub fn push_chunk(&mut self, chunk: &Bytes) -> Result<Vec<ChatOutput>, TranslateError> {
        let lines = self.decoder.push(chunk);
        let mut outputs = Vec::new();
        for line in lines {
            self.translate_line(&line, &mut outputs)?;
        }
        Ok(outputs)
    }

    /// Flush buffered state at end of stream.
    pub fn finish(&mut self) -> Result<Vec<ChatOutput>, TranslateError> {
        let mut outputs = Vec::new();
        if let Some(line) = self.decoder.finish() {
            self.translate_line(&line, &mut outputs)?;
        }
        let tail = self.filter.finish();
        if !tail.is_empty() {
            self.push_content(tail, &mut outputs);
        }
        outputs.push(ChatOutput::Done);
        Ok(outputs)
    }

    fn translate_line(
        &mut self,
        line: &str,
        outputs: &mut Vec<ChatOutput>,
    ) -> Result<(), TranslateError> {
        let events = match parse_event_line(line) {
            Ok(events) => events,
            Err(err) => {
                self.protocol_faults += 1;
                // One malformed line is tolerated; a second one means the
                // stream itself is broken.
                if self.protocol_faults >= 2 {
                    return Err(TranslateError::Protocol {
                        message: err.to_string(),
                    });
                }
                debug!(event = "stream_line_skipped", error = %err);
                return Ok(());
            }
        };

        for event in events {
            match event {
                UpstreamEvent::Meta(meta) => {
                    if let Some(id) = meta.response_id {
                        self.response_id = id;
                    }
                    if let Some(hash) = meta.model_hash {
                        self.fingerprint = Some(hash);
                    }
                }
                UpstreamEvent::Delta { text } => {
                    let filtered = self.filter.push(&text);
                    if !filtered.is_empty() {
                        self.push_content(filtered, outputs);
                    }
                    self.saw_delta = true;
                }
                UpstreamEvent::Reasoning { text } => {
                    if self.show_reasoning {
                        self.ensure_role(outputs);
                        outputs.push(ChatOutput::Chunk(ChatCompletionChunk::reasoning(
                            &self.response_id,
                            self.created,
                            &self.model,
                            self.fingerprint.as_deref(),
                            text,
                        )));
                    }
                }
                UpstreamEvent::ImageProgress { index, progress } => {
                    if self.show_reasoning {
                        self.ensure_role(outputs);
                        outputs.push(ChatOutput::Chunk(ChatCompletionChunk::reasoning(
                            &self.response_id,
                            self.created,
                            &self.model,
                            self.fingerprint.as_deref(),
                            format!("generating image {} ({progress}%)\n", index + 1),
                        )));
                    }
                }
                UpstreamEvent::VideoProgress(video) => {
                    if self.show_reasoning && video.progress < 100 {
                        self.ensure_role(outputs);
                        outputs.push(ChatOutput::Chunk(ChatCompletionChunk::reasoning(
                            &self.response_id,
                            self.created,
                            &self.model,
                            self.fingerprint.as_deref(),
                            format!("generating video ({}%)\n", video.progress),
                        )));
                    }
                    if video.progress >= 100 {
                        if let Some(video_path) = video.video_url {
                            self.ensure_role(outputs);
                            outputs.push(ChatOutput::VideoReady {
                                video_path,
                                thumbnail_path: video.thumbnail_url,
                            });
                            self.saw_terminal = true;
                        }
                    }
                }
                UpstreamEvent::Final(final_response) => {
                    if let Some(hash) = final_response.model_hash {
                        self.fingerprint = Some(hash);
                    }
                    for path in final_response.image_urls {
                        self.ensure_role(outputs);
                        outputs.push(ChatOutput::ImageReady { path });
                    }
                    self.saw_terminal = true;
                }
                UpstreamEvent::Error(error) => {
                    return Err(TranslateError::Upstream {
                        message: format!("{}: {}", error.kind, error.message),
                    });
                }
            }
        }
        Ok(())
    }

    fn push_content(&mut self, text: String, outputs: &mut Vec<ChatOutput>) {
        self.ensure_role(outputs);
        outputs.push(ChatOutput::Chunk(ChatCompletionChunk::content(
            &self.response_id,
            self.created,
            &self.model,
            self.fingerprint.as_deref(),
            text,
        )));
    }

    fn ensure_role(&mut self, outputs: &mut Vec<ChatOutput>) {
        if !self.role_sent {
            self.role_sent = true;
            outputs.push(ChatOutput::Chunk(ChatCompletionChunk::role(
                &self.response_id,
                self.created,
                &self.model,
                self.fingerprint.as_deref(),
            )));
        }
    }

    // Driver helpers: chunks stamped with this stream's identity.

    pub fn content_chunk(&self, text: String) -> ChatCompletionChunk {
        ChatCompletionChunk::content(
            &self.response_id,
            self.created,
            &self.model,
            self.fingerprint.as_deref(),
            text,
        )
    }

    pub fn finish_chunk(&self) -> ChatCompletionChunk {
        ChatCompletionChunk::finish(
            &self.response_id,
            self.created,
            &self.model,
            self.fingerprint.as_deref(),
            "stop",
        )
    }

    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> ChatTranslator {
        ChatTranslator::new("grok-4", 1_700_000_000, false, &[])
    }

    fn line(text: &str) -> Bytes {
        Bytes::from(format!("{text}\n"))
    }

    fn content_of(outputs: &[ChatOutput]) -> String {
        outputs
            .iter()
            .filter_map(|output| match output {
                ChatOutput::Chunk(chunk) => chunk
                    .choices
                    .first()
                    .and_then(|choice| choice.delta.content.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn role_chunk_precedes_first_delta() {
        let mut translator = translator();
        let outputs = translator
            .push_chunk(&line(r#"{"result":{"response":{"token":"hi"}}}"#))
            .unwrap();
        let ChatOutput::Chunk(first) = &outputs[0] else {
            panic!("expected chunk");
        };
        assert_eq!(first.choices[0].delta.role, Some("assistant"));
        assert_eq!(content_of(&outputs), "hi");
    }

    #[test]
    fn deltas_concatenate_byte_identical_without_tags() {
        let mut translator = translator();
        let mut collected = String::new();
        for token in ["Hel", "lo ", "<wor", "ld>", "!"] {
            let payload = serde_json::json!({
                "result": {"response": {"token": token}}
            });
            let outputs = translator.push_chunk(&line(&payload.to_string())).unwrap();
            collected.push_str(&content_of(&outputs));
        }
        let outputs = translator.finish().unwrap();
        collected.push_str(&content_of(&outputs));
        assert_eq!(collected, "Hello <world>!");
    }

    #[test]
    fn reasoning_dropped_when_thinking_disabled() {
        let mut translator = translator();
        let outputs = translator
            .push_chunk(&line(
                r#"{"result":{"response":{"token":"mm","isThinking":true}}}"#,
            ))
            .unwrap();
        assert!(outputs.is_empty());
    }

    #[test]
    fn reasoning_routed_when_thinking_enabled() {
        let mut translator = ChatTranslator::new("grok-4-thinking", 0, true, &[]);
        let outputs = translator
            .push_chunk(&line(
                r#"{"result":{"response":{"token":"mm","isThinking":true}}}"#,
            ))
            .unwrap();
        let reasoning: Vec<_> = outputs
            .iter()
            .filter_map(|output| match output {
                ChatOutput::Chunk(chunk) => chunk.choices[0].delta.reasoning_content.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(reasoning, vec!["mm".to_string()]);
    }

    #[test]
    fn second_malformed_line_is_fatal() {
        let mut translator = translator();
        assert!(translator.push_chunk(&line("{broken")).is_ok());
        let err = translator.push_chunk(&line("{also broken")).unwrap_err();
        assert!(matches!(err, TranslateError::Protocol { .. }));
    }

    #[test]
    fn empty_stream_is_not_structurally_valid() {
        let mut translator = translator();
        let outputs = translator.finish().unwrap();
        assert!(matches!(outputs.last(), Some(ChatOutput::Done)));
        assert!(!translator.structurally_valid());
    }

    #[test]
    fn final_response_marks_terminal() {
        let mut translator = translator();
        translator
            .push_chunk(&line(
                r#"{"result":{"response":{"modelResponse":{"message":"done"}}}}"#,
            ))
            .unwrap();
        assert!(translator.structurally_valid());
    }

    #[test]
    fn video_completion_surfaces_asset() {
        let mut translator = translator();
        let payload = serde_json::json!({
            "result": {"response": {"streamingVideoGenerationResponse": {
                "progress": 100,
                "videoUrl": "/users/u/generated/v/video.mp4",
                "thumbnailImageUrl": "/users/u/generated/v/thumb.jpg"
            }}}
        });
        let outputs = translator.push_chunk(&line(&payload.to_string())).unwrap();
        assert!(outputs.iter().any(|output| matches!(
            output,
            ChatOutput::VideoReady { video_path, .. } if video_path.ends_with("video.mp4")
        )));
    }
}
