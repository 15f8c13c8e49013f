use xgate_pool::ClassHint;
use xgate_protocol::openai::chat::VideoRequestConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Chat,
    Image,
    Video,
}

/// One served model: the public id clients send plus the upstream model
/// name and mode the payload builder uses.
#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub id: &'static str,
    pub upstream_model: &'static str,
    pub mode: &'static str,
    pub rate_limit_model: &'static str,
    pub kind: ModelKind,
}

pub const CATALOG: &[ModelSpec] = &[
    ModelSpec {
        id: "grok-4",
        upstream_model: "grok-4",
        mode: "MODEL_MODE_EXPERT",
        rate_limit_model: "grok-4",
        kind: ModelKind::Chat,
    },
    ModelSpec {
        id: "grok-4-fast",
        upstream_model: "grok-4-mini-thinking-tahoe",
        mode: "MODEL_MODE_GROK_4_MINI_THINKING",
        rate_limit_model: "grok-4-mini-thinking-tahoe",
        kind: ModelKind::Chat,
    },
    ModelSpec {
        id: "grok-4-thinking",
        upstream_model: "grok-4-1-thinking-1108b",
        mode: "MODEL_MODE_AUTO",
        rate_limit_model: "grok-4-1-thinking-1108b",
        kind: ModelKind::Chat,
    },
    ModelSpec {
        id: "grok-4-heavy",
        upstream_model: "grok-4-heavy",
        mode: "MODEL_MODE_HEAVY",
        rate_limit_model: "grok-4-heavy",
        kind: ModelKind::Chat,
    },
    ModelSpec {
        id: "grok-imagine",
        upstream_model: "grok-3",
        mode: "MODEL_MODE_FAST",
        rate_limit_model: "grok-3",
        kind: ModelKind::Image,
    },
    ModelSpec {
        id: "grok-video",
        upstream_model: "grok-3",
        mode: "MODEL_MODE_FAST",
        rate_limit_model: "grok-3",
        kind: ModelKind::Video,
    },
];

pub fn lookup(model_id: &str) -> Option<&'static ModelSpec> {
    CATALOG.iter().find(|spec| spec.id == model_id)
}

pub fn model_ids() -> impl Iterator<Item = String> {
    CATALOG.iter().map(|spec| spec.id.to_string())
}

/// Routing: which token class should serve this request.
///
/// Heavy models are Super-only; thinking models and demanding video
/// (720p or longer than six seconds) prefer Super but may fall back.
pub fn class_hint(model_id: &str, video: Option<&VideoRequestConfig>) -> ClassHint {
    if model_id.ends_with("-heavy") {
        return ClassHint::Super;
    }
    if model_id.ends_with("-thinking") {
        return ClassHint::SuperPreferred;
    }
    if let Some(video) = video {
        let high_res = video
            .resolution_name
            .as_deref()
            .is_some_and(|name| name.eq_ignore_ascii_case("720p"));
        let long = video.video_length.is_some_and(|secs| secs > 6);
        if high_res || long {
            return ClassHint::SuperPreferred;
        }
    }
    ClassHint::Basic
}

/// Whether the request enables the reasoning channel.
pub fn thinking_enabled(model_id: &str, reasoning_effort: Option<&str>, default: bool) -> bool {
    if matches!(reasoning_effort, Some("none")) {
        return false;
    }
    if reasoning_effort.is_some() {
        return true;
    }
    model_id.ends_with("-thinking") || default
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heavy_is_strict_super() {
        assert_eq!(class_hint("grok-4-heavy", None), ClassHint::Super);
    }

    #[test]
    fn thinking_prefers_super() {
        assert_eq!(class_hint("grok-4-thinking", None), ClassHint::SuperPreferred);
    }

    #[test]
    fn video_720p_or_long_prefers_super() {
        let video = VideoRequestConfig {
            resolution_name: Some("720p".to_string()),
            video_length: None,
        };
        assert_eq!(class_hint("grok-video", Some(&video)), ClassHint::SuperPreferred);

        let video = VideoRequestConfig {
            resolution_name: None,
            video_length: Some(10),
        };
        assert_eq!(class_hint("grok-video", Some(&video)), ClassHint::SuperPreferred);

        let video = VideoRequestConfig {
            resolution_name: Some("480p".to_string()),
            video_length: Some(6),
        };
        assert_eq!(class_hint("grok-video", Some(&video)), ClassHint::Basic);
    }

    #[test]
    fn everything_else_is_basic() {
        assert_eq!(class_hint("grok-4", None), ClassHint::Basic);
        assert_eq!(class_hint("grok-4-fast", None), ClassHint::Basic);
    }

    #[test]
    fn reasoning_effort_none_disables_thinking() {
        assert!(!thinking_enabled("grok-4-thinking", Some("none"), true));
        assert!(thinking_enabled("grok-4-thinking", None, false));
        assert!(thinking_enabled("grok-4", Some("high"), false));
        assert!(!thinking_enabled("grok-4", None, false));
    }
}
