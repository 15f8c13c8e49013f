use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use xgate_protocol::upstream::WsServerMessage;

use crate::TranslateError;

/// WebSocket image session phases. Frames are classified by decoded size:
/// previews below the medium threshold, a medium checkpoint, then the
/// final frame. A medium with no final inside the timeout means the
/// upstream quietly dropped the generation (content policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsPhase {
    Opening,
    AwaitingPreview,
    AwaitingMedium,
    AwaitingFinal,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Preview,
    Medium,
    Final,
}

#[derive(Debug, Clone)]
struct TrackedImage {
    b64: String,
    size: usize,
    is_final: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WsImageEvent {
    Partial {
        index: u32,
        partial_index: u32,
        b64: String,
    },
    /// All requested finals collected; the driver may close the socket.
    Completed,
}

#[derive(Debug, Clone)]
pub struct FinalImage {
    pub image_id: String,
    pub b64: String,
    pub is_final: bool,
}

pub struct WsImageMachine {
    n: u32,
    medium_min_bytes: usize,
    final_min_bytes: usize,
    phase: WsPhase,
    images: HashMap<String, TrackedImage>,
    index_map: HashMap<String, u32>,
    partial_counts: HashMap<String, u32>,
    arrival_order: Vec<String>,
    target_id: Option<String>,
    final_count: u32,
    medium_seen_at: Option<Instant>,
}

impl WsImageMachine {
    pub fn new(n: u32, medium_min_bytes: usize, final_min_bytes: usize) -> Self {
        Self {
            n: n.max(1),
            medium_min_bytes,
            final_min_bytes,
            phase: WsPhase::Opening,
            images: HashMap::new(),
            index_map: HashMap::new(),
            partial_counts: HashMap::new(),
            arrival_order: Vec::new(),
            target_id: None,
            final_count: 0,
            medium_seen_at: None,
        }
    }

    pub fn phase(&self) -> WsPhase {
        self.phase
    }

    pub fn is_complete(&self) -> bool {
        self.final_count >= self.n
    }

    /// Blocked detection: a medium arrived, no final followed within the
    /// timeout, and nothing was completed.
    pub fn check_blocked(&self, now: Instant, final_timeout: Duration) -> Result<(), TranslateError> {
        if self.final_count == 0 {
            if let Some(medium_at) = self.medium_seen_at {
                if now.duration_since(medium_at) > final_timeout {
                    return Err(TranslateError::Blocked);
                }
            }
        }
        Ok(())
    }

    pub fn on_message(
        &mut self,
        message: WsServerMessage,
        now: Instant,
    ) -> Result<Vec<WsImageEvent>, TranslateError> {
        match message {
            WsServerMessage::Error { code, message } => {
                if code == "blocked" {
                    return Err(TranslateError::Blocked);
                }
                Err(TranslateError::Upstream {
                    message: format!("{code}: {message}"),
                })
            }
            WsServerMessage::Image { url, blob } => Ok(self.on_image(&url, &blob, now)),
            WsServerMessage::Other => Ok(Vec::new()),
        }
    }

    fn on_image(&mut self, url: &str, blob: &str, now: Instant) -> Vec<WsImageEvent> {
        let b64 = strip_data_uri(blob);
        if b64.is_empty() || url.is_empty() {
            return Vec::new();
        }
        let size = b64.len();
        let (image_id, ext) = parse_image_url(url);
        let is_final = matches!(ext.as_deref(), Some("jpg") | Some("jpeg"))
            || size > self.final_min_bytes;
        let stage = if is_final {
            Stage::Final
        } else if size > self.medium_min_bytes {
            Stage::Medium
        } else {
            Stage::Preview
        };

        self.advance_phase(stage, now);

        if !self.images.contains_key(&image_id) {
            self.arrival_order.push(image_id.clone());
        }
        let was_final = self
            .images
            .get(&image_id)
            .map(|existing| existing.is_final)
            .unwrap_or(false);
        let keep_incoming = match self.images.get(&image_id) {
            None => true,
            Some(existing) => {
                (is_final && !existing.is_final)
                    || (is_final == existing.is_final && size > existing.size)
            }
        };
        if keep_incoming {
            self.images.insert(
                image_id.clone(),
                TrackedImage {
                    b64: b64.to_string(),
                    size,
                    is_final,
                },
            );
        }

        let index = self.assign_index(&image_id);
        let mut events = Vec::new();

        if is_final {
            if !was_final {
                self.final_count += 1;
                if self.is_complete() {
                    self.phase = WsPhase::Closed;
                    events.push(WsImageEvent::Completed);
                }
            }
            return events;
        }

        if let Some(index) = index {
            let partial_index = {
                let counter = self.partial_counts.entry(image_id.clone()).or_insert(0);
                let current = *counter;
                *counter += 1;
                match stage {
                    Stage::Medium => current.max(1),
                    _ => current,
                }
            };
            events.push(WsImageEvent::Partial {
                index,
                partial_index,
                b64: b64.to_string(),
            });
        }
        events
    }

    fn advance_phase(&mut self, stage: Stage, now: Instant) {
        match stage {
            Stage::Preview => {
                if matches!(self.phase, WsPhase::Opening | WsPhase::AwaitingPreview) {
                    self.phase = WsPhase::AwaitingMedium;
                }
            }
            Stage::Medium => {
                if self.medium_seen_at.is_none() {
                    self.medium_seen_at = Some(now);
                }
                if !matches!(self.phase, WsPhase::Closed) {
                    self.phase = WsPhase::AwaitingFinal;
                }
            }
            Stage::Final => {}
        }
    }

    fn assign_index(&mut self, image_id: &str) -> Option<u32> {
        if self.n == 1 {
            match &self.target_id {
                None => {
                    self.target_id = Some(image_id.to_string());
                    Some(0)
                }
                Some(target) if target == image_id => Some(0),
                Some(_) => None,
            }
        } else {
            if let Some(index) = self.index_map.get(image_id) {
                return Some(*index);
            }
            if self.index_map.len() as u32 >= self.n {
                return None;
            }
            let index = self.index_map.len() as u32;
            self.index_map.insert(image_id.to_string(), index);
            Some(index)
        }
    }

    /// Final selection once the socket closed (normally or early): the
    /// best frame per image, preferring finals, at most `n` results.
    pub fn take_results(&mut self) -> Vec<FinalImage> {
        let mut results: Vec<FinalImage> = Vec::new();
        if self.n == 1 {
            let chosen = self
                .target_id
                .as_ref()
                .and_then(|id| self.images.get(id).map(|image| (id.clone(), image.clone())))
                .or_else(|| {
                    self.arrival_order
                        .iter()
                        .filter_map(|id| self.images.get(id).map(|image| (id.clone(), image.clone())))
                        .max_by_key(|(_, image)| (image.is_final, image.size))
                });
            if let Some((id, image)) = chosen {
                results.push(FinalImage {
                    image_id: id,
                    b64: image.b64,
                    is_final: image.is_final,
                });
            }
            return results;
        }

        let mut ordered: Vec<(String, TrackedImage)> = self
            .arrival_order
            .iter()
            .filter_map(|id| self.images.get(id).map(|image| (id.clone(), image.clone())))
            .collect();
        ordered.sort_by_key(|(_, image)| std::cmp::Reverse((image.is_final, image.size)));
        for (id, image) in ordered.into_iter().take(self.n as usize) {
            results.push(FinalImage {
                image_id: id,
                b64: image.b64,
                is_final: image.is_final,
            });
        }
        results
    }
}

fn strip_data_uri(blob: &str) -> &str {
    match blob.split_once(',') {
        Some((head, tail)) if head.contains("base64") => tail,
        _ => blob,
    }
}

/// `/images/{uuid}.{ext}` → id + extension; anything else gets a synthetic id.
fn parse_image_url(url: &str) -> (String, Option<String>) {
    if let Some(pos) = url.find("/images/") {
        let name = &url[pos + "/images/".len()..];
        let name = name.split(['?', '#']).next().unwrap_or(name);
        if let Some((id, ext)) = name.rsplit_once('.') {
            if !id.is_empty() {
                return (id.to_string(), Some(ext.to_ascii_lowercase()));
            }
        }
    }
    (Uuid::new_v4().simple().to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(url: &str, size: usize) -> WsServerMessage {
        WsServerMessage::Image {
            url: url.to_string(),
            blob: "a".repeat(size),
        }
    }

    fn machine() -> WsImageMachine {
        // medium > 1000 bytes, final > 10_000 bytes
        WsImageMachine::new(1, 1000, 10_000)
    }

    #[test]
    fn preview_frames_are_not_final() {
        let mut machine = machine();
        let events = machine
            .on_message(image("/images/aaaa.png", 500), Instant::now())
            .unwrap();
        assert_eq!(machine.phase(), WsPhase::AwaitingMedium);
        assert!(matches!(events[0], WsImageEvent::Partial { partial_index: 0, .. }));
        assert!(!machine.is_complete());
    }

    #[test]
    fn size_threshold_promotes_to_final() {
        let mut machine = machine();
        let now = Instant::now();
        machine.on_message(image("/images/aaaa.png", 2000), now).unwrap();
        assert_eq!(machine.phase(), WsPhase::AwaitingFinal);
        let events = machine
            .on_message(image("/images/aaaa.png", 20_000), now)
            .unwrap();
        assert!(machine.is_complete());
        assert!(events.contains(&WsImageEvent::Completed));
        assert_eq!(machine.phase(), WsPhase::Closed);
    }

    #[test]
    fn jpg_extension_is_final_regardless_of_size() {
        let mut machine = machine();
        machine
            .on_message(image("/images/bbbb.jpg", 500), Instant::now())
            .unwrap();
        assert!(machine.is_complete());
    }

    #[test]
    fn medium_without_final_blocks_after_timeout() {
        let mut machine = machine();
        let start = Instant::now();
        machine.on_message(image("/images/cccc.png", 5000), start).unwrap();
        assert!(machine.check_blocked(start, Duration::from_secs(30)).is_ok());
        let err = machine
            .check_blocked(start + Duration::from_secs(31), Duration::from_secs(30))
            .unwrap_err();
        assert!(matches!(err, TranslateError::Blocked));
    }

    #[test]
    fn blocked_error_frame_maps_to_blocked() {
        let mut machine = machine();
        let err = machine
            .on_message(
                WsServerMessage::Error {
                    code: "blocked".to_string(),
                    message: "no final image".to_string(),
                },
                Instant::now(),
            )
            .unwrap_err();
        assert!(matches!(err, TranslateError::Blocked));
    }

    #[test]
    fn best_frame_wins_in_results() {
        let mut machine = machine();
        let now = Instant::now();
        machine.on_message(image("/images/dddd.png", 800), now).unwrap();
        machine.on_message(image("/images/dddd.png", 5000), now).unwrap();
        machine.on_message(image("/images/dddd.jpeg", 7000), now).unwrap();
        let results = machine.take_results();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_final);
        assert_eq!(results[0].b64.len(), 7000);
    }

    #[test]
    fn multi_image_indexes_are_stable() {
        let mut machine = WsImageMachine::new(2, 1000, 10_000);
        let now = Instant::now();
        let first = machine.on_message(image("/images/e1.png", 500), now).unwrap();
        let second = machine.on_message(image("/images/e2.png", 500), now).unwrap();
        let again = machine.on_message(image("/images/e1.png", 600), now).unwrap();
        let index_of = |events: &[WsImageEvent]| match events.first() {
            Some(WsImageEvent::Partial { index, .. }) => *index,
            _ => panic!("expected partial"),
        };
        assert_eq!(index_of(&first), 0);
        assert_eq!(index_of(&second), 1);
        assert_eq!(index_of(&again), 0);
    }
}
