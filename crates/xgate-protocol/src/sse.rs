use bytes::Bytes;
use serde::Serialize;

/// `data: <json>\n\n`
pub fn data_frame<T: Serialize>(value: &T) -> Option<Bytes> {
    let payload = serde_json::to_vec(value).ok()?;
    let mut data = Vec::with_capacity(payload.len() + 8);
    data.extend_from_slice(b"data: ");
    data.extend_from_slice(&payload);
    data.extend_from_slice(b"\n\n");
    Some(Bytes::from(data))
}

/// `event: <name>\ndata: <json>\n\n`
pub fn event_frame<T: Serialize>(event: &str, value: &T) -> Option<Bytes> {
    let payload = serde_json::to_vec(value).ok()?;
    let mut data = Vec::with_capacity(payload.len() + event.len() + 16);
    data.extend_from_slice(b"event: ");
    data.extend_from_slice(event.as_bytes());
    data.extend_from_slice(b"\ndata: ");
    data.extend_from_slice(&payload);
    data.extend_from_slice(b"\n\n");
    Some(Bytes::from(data))
}

/// Terminal marker every OpenAI-style stream ends with.
pub fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

pub fn keep_alive_frame() -> Bytes {
    Bytes::from_static(b": keep-alive\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn data_frame_shape() {
        let frame = data_frame(&json!({"a": 1})).unwrap();
        assert_eq!(&frame[..], b"data: {\"a\":1}\n\n");
    }

    #[test]
    fn event_frame_shape() {
        let frame = event_frame("progress", &json!({"n": 2})).unwrap();
        assert_eq!(&frame[..], b"event: progress\ndata: {\"n\":2}\n\n");
    }
}
