use bytes::Bytes;
use tracing::debug;

use xgate_protocol::ndjson::LineDecoder;
use xgate_protocol::upstream::{parse_event_line, UpstreamEvent};

use crate::TranslateError;

/// Output of the HTTP image stream (image generation over the chat
/// endpoint). The driver turns progress into `partial_image` events and
/// resolves the final upstream paths into cached URLs or base64.
#[derive(Debug, PartialEq)]
pub enum ImageOutput {
    Progress { index: u32, progress: u8 },
    FinalPaths(Vec<String>),
}

pub struct ImageHttpTranslator {
    decoder: LineDecoder,
    protocol_faults: u32,
    final_paths: Vec<String>,
}

impl ImageHttpTranslator {
    pub fn new() -> Self {
        Self {
            decoder: LineDecoder::new(),
            protocol_faults: 0,
            final_paths: Vec::new(),
        }
    }

    pub fn push_chunk(&mut self, chunk: &Bytes) -> Result<Vec<ImageOutput>, TranslateError> {
        let lines = self.decoder.push(chunk);
        let mut outputs = Vec::new();
        for line in lines {
            self.translate_line(&line, &mut outputs)?;
        }
        Ok(outputs)
    }

    pub fn finish(&mut self) -> Result<Vec<ImageOutput>, TranslateError> {
        let mut outputs = Vec::new();
        if let Some(line) = self.decoder.finish() {
            self.translate_line(&line, &mut outputs)?;
        }
        if !self.final_paths.is_empty() {
            outputs.push(ImageOutput::FinalPaths(std::mem::take(&mut self.final_paths)));
        }
        Ok(outputs)
    }

    fn translate_line(
        &mut self,
        line: &str,
        outputs: &mut Vec<ImageOutput>,
    ) -> Result<(), TranslateError> {
        let events = match parse_event_line(line) {
            Ok(events) => events,
            Err(err) => {
                self.protocol_faults += 1;
                if self.protocol_faults >= 2 {
                    return Err(TranslateError::Protocol {
                        message: err.to_string(),
                    });
                }
                debug!(event = "image_line_skipped", error = %err);
                return Ok(());
            }
        };
        for event in events {
            match event {
                UpstreamEvent::ImageProgress { index, progress } => {
                    outputs.push(ImageOutput::Progress { index, progress });
                }
                UpstreamEvent::Final(final_response) => {
                    self.final_paths.extend(final_response.image_urls);
                }
                UpstreamEvent::Error(error) => {
                    return Err(TranslateError::Upstream {
                        message: format!("{}: {}", error.kind, error.message),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Default for ImageHttpTranslator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_then_finals() {
        let mut translator = ImageHttpTranslator::new();
        let chunk = Bytes::from(concat!(
            r#"{"result":{"response":{"streamingImageGenerationResponse":{"imageIndex":0,"progress":40}}}}"#,
            "\n",
            r#"{"result":{"response":{"modelResponse":{"message":"","generatedImageUrls":["/users/a/1/image.jpg","/users/a/2/image.jpg"]}}}}"#,
            "\n",
        ));
        let mut outputs = translator.push_chunk(&chunk).unwrap();
        outputs.extend(translator.finish().unwrap());
        assert_eq!(outputs[0], ImageOutput::Progress { index: 0, progress: 40 });
        assert_eq!(
            outputs[1],
            ImageOutput::FinalPaths(vec![
                "/users/a/1/image.jpg".to_string(),
                "/users/a/2/image.jpg".to_string(),
            ])
        );
    }
}
