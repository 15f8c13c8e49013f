use std::collections::VecDeque;

/// Streaming suppression of container tags (`<xaiartifact>…</xaiartifact>`
/// and friends) from assistant text.
///
/// Matching is case-insensitive and survives chunk boundaries: a tag split
/// across deltas is withheld until it can be classified. Nesting of the
/// same tag is tracked with a depth counter. If the stream ends inside an
/// unterminated tag, the withheld text is flushed back out verbatim.
#[derive(Debug)]
pub struct TagFilter {
    tags: Vec<String>,
    buffer: String,
    mode: Mode,
}

#[derive(Debug)]
enum Mode {
    Text,
    /// Saw `<`; `buffer` holds the raw candidate while we decide whether
    /// it opens a filtered tag.
    Candidate,
    /// Inside a filtered container; `buffer` holds everything suppressed
    /// so far in case we need to flush it at end of stream.
    Suppress { tag: String, depth: usize },
}

const BOUNDARY: &[char] = &[' ', '\t', '\n', '\r', '>', '/'];

impl TagFilter {
    pub fn new(tags: &[String]) -> Self {
        Self {
            tags: tags.iter().map(|tag| tag.to_lowercase()).collect(),
            buffer: String::new(),
            mode: Mode::Text,
        }
    }

    pub fn push(&mut self, chunk: &str) -> String {
        if self.tags.is_empty() {
            return chunk.to_string();
        }
        let mut out = String::new();
        let mut queue: VecDeque<char> = chunk.chars().collect();
        while let Some(c) = queue.pop_front() {
            match &mut self.mode {
                Mode::Text => {
                    if c == '<' {
                        self.buffer.push(c);
                        self.mode = Mode::Candidate;
                    } else {
                        out.push(c);
                    }
                }
                Mode::Candidate => {
                    self.buffer.push(c);
                    match self.classify_candidate() {
                        Candidate::Undecided => {}
                        Candidate::Opens(tag) => {
                            self.mode = Mode::Suppress { tag, depth: 0 };
                        }
                        Candidate::NotATag => {
                            // Emit the `<` and replay the rest through the
                            // filter; it may contain another candidate.
                            let rest: String = self.buffer.drain(..).skip(1).collect();
                            out.push('<');
                            for c in rest.chars().rev() {
                                queue.push_front(c);
                            }
                            self.mode = Mode::Text;
                        }
                    }
                }
                Mode::Suppress { .. } => {
                    self.buffer.push(c);
                    if c == '>' {
                        self.apply_markup();
                    }
                }
            }
        }
        out
    }

    /// End of stream: whatever is withheld goes out as plain text.
    pub fn finish(&mut self) -> String {
        self.mode = Mode::Text;
        std::mem::take(&mut self.buffer)
    }

    fn classify_candidate(&self) -> Candidate {
        let candidate = self.buffer[1..].to_lowercase();
        let mut undecided = false;
        let mut opens: Option<&str> = None;
        for tag in &self.tags {
            if candidate.len() <= tag.len() {
                if tag.starts_with(&candidate) {
                    undecided = true;
                }
                continue;
            }
            if candidate.starts_with(tag.as_str()) {
                let next = candidate[tag.len()..].chars().next();
                if next.is_some_and(|c| BOUNDARY.contains(&c)) {
                    // Longest configured tag wins (`grok:render` over a
                    // hypothetical `grok`).
                    if opens.is_none_or(|current| tag.len() > current.len()) {
                        opens = Some(tag);
                    }
                }
            }
        }
        if let Some(tag) = opens {
            return Candidate::Opens(tag.to_string());
        }
        if undecided {
            return Candidate::Undecided;
        }
        Candidate::NotATag
    }

    /// Called on every `>` while suppressing: classify the markup element
    /// that just closed and update the depth counter.
    fn apply_markup(&mut self) {
        let Mode::Suppress { tag, depth } = &mut self.mode else {
            return;
        };
        let Some(start) = self.buffer.rfind('<') else {
            return;
        };
        let element = self.buffer[start..].to_lowercase();
        let open_prefix = format!("<{tag}");
        let close_prefix = format!("</{tag}");

        if element.starts_with(&close_prefix) {
            *depth = depth.saturating_sub(1);
        } else if element.starts_with(&open_prefix)
            && element[open_prefix.len()..]
                .chars()
                .next()
                .is_some_and(|c| BOUNDARY.contains(&c))
        {
            if !element.ends_with("/>") {
                *depth += 1;
            }
        } else {
            return;
        }

        if *depth == 0 {
            self.buffer.clear();
            self.mode = Mode::Text;
        }
    }
}

enum Candidate {
    Undecided,
    Opens(String),
    NotATag,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> Vec<String> {
        vec![
            "xaiartifact".to_string(),
            "xai:tool_usage_card".to_string(),
            "grok:render".to_string(),
        ]
    }

    fn run(filter: &mut TagFilter, chunks: &[&str]) -> String {
        let mut out = String::new();
        for chunk in chunks {
            out.push_str(&filter.push(chunk));
        }
        out.push_str(&filter.finish());
        out
    }

    #[test]
    fn plain_text_is_byte_identical() {
        let text = "hello <b>world</b>, 2 < 3 && 4 > 1 <notatag>";
        let mut filter = TagFilter::new(&tags());
        assert_eq!(run(&mut filter, &[text]), text);
    }

    #[test]
    fn plain_text_survives_arbitrary_chunking() {
        let text = "a < b, <xsmall> tags, text with < angle <brackets>>";
        for split in 1..text.len() {
            let mut filter = TagFilter::new(&tags());
            let (head, tail) = text.split_at(split);
            assert_eq!(run(&mut filter, &[head, tail]), text, "split at {split}");
        }
    }

    #[test]
    fn container_content_is_suppressed() {
        let mut filter = TagFilter::new(&tags());
        let out = run(
            &mut filter,
            &["before <grok:render type=\"card\">hidden</grok:render> after"],
        );
        assert_eq!(out, "before  after");
    }

    #[test]
    fn suppression_spans_chunks() {
        let mut filter = TagFilter::new(&tags());
        let out = run(
            &mut filter,
            &["start <grok:re", "nder a=1>hid", "den</grok:", "render> end"],
        );
        assert_eq!(out, "start  end");
    }

    #[test]
    fn nested_same_tag_counts_depth() {
        let mut filter = TagFilter::new(&tags());
        let out = run(
            &mut filter,
            &["<xaiartifact id=1>outer<xaiartifact id=2>inner</xaiartifact>still</xaiartifact>ok"],
        );
        assert_eq!(out, "ok");
    }

    #[test]
    fn self_closing_tag_is_removed() {
        let mut filter = TagFilter::new(&tags());
        let out = run(&mut filter, &["a<grok:render src=\"x\"/>b"]);
        assert_eq!(out, "ab");
    }

    #[test]
    fn matching_is_case_insensitive() {
        let mut filter = TagFilter::new(&tags());
        let out = run(&mut filter, &["x<XaiArtifact T=1>gone</XAIARTIFACT>y"]);
        assert_eq!(out, "xy");
    }

    #[test]
    fn unterminated_tag_flushes_as_text() {
        let mut filter = TagFilter::new(&tags());
        let out = run(&mut filter, &["keep <xaiartifact id=3>tail without close"]);
        assert_eq!(out, "keep <xaiartifact id=3>tail without close");
    }

    #[test]
    fn unterminated_candidate_flushes_as_text() {
        let mut filter = TagFilter::new(&tags());
        let out = run(&mut filter, &["trailing <xaiarti"]);
        assert_eq!(out, "trailing <xaiarti");
    }
}
