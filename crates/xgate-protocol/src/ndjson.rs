use bytes::Bytes;

/// Incremental newline-delimited JSON decoder.
///
/// The upstream chat/video endpoints emit one JSON object per line over a
/// chunked body; chunk boundaries fall anywhere, so partial lines are
/// buffered until the terminating newline arrives.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: String,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &Bytes) -> Vec<String> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(normalized) = normalize_line(&line) {
                out.push(normalized.to_string());
            }
        }
        out
    }

    /// Flush whatever is buffered once the body ends without a newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        normalize_line(rest.trim_end_matches('\r')).map(ToOwned::to_owned)
    }
}

/// Strip optional SSE `data:` framing and skip blanks / terminators, so the
/// decoder tolerates both bare NDJSON and SSE-wrapped NDJSON bodies.
pub fn normalize_line(line: &str) -> Option<&str> {
    let mut text = line.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(rest) = text.strip_prefix("data:") {
        text = rest.trim_start();
    }
    if text.is_empty() || text == "[DONE]" {
        return None;
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_split_lines() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push_str("{\"a\":").is_empty());
        let lines = decoder.push_str("1}\n{\"b\":2}\n");
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn strips_sse_framing_and_done() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push_str("data: {\"a\":1}\r\n\r\ndata: [DONE]\n");
        assert_eq!(lines, vec!["{\"a\":1}"]);
    }

    #[test]
    fn finish_flushes_trailing_fragment() {
        let mut decoder = LineDecoder::new();
        decoder.push_str("{\"tail\":true}");
        assert_eq!(decoder.finish().as_deref(), Some("{\"tail\":true}"));
        assert_eq!(decoder.finish(), None);
    }
}
