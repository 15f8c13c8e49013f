use std::time::Duration;

use tokio::sync::mpsc::Receiver;

use crate::TranslateError;

/// Receive the next stream item, failing if nothing arrives within the
/// idle window. `Ok(None)` is a normal end of stream.
pub async fn recv_with_idle<T>(
    rx: &mut Receiver<T>,
    idle: Duration,
) -> Result<Option<T>, TranslateError> {
    if idle.is_zero() {
        return Ok(rx.recv().await);
    }
    match tokio::time::timeout(idle, rx.recv()).await {
        Ok(item) => Ok(item),
        Err(_) => Err(TranslateError::IdleTimeout {
            idle_secs: idle.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_items_through() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        tx.send(7u32).await.unwrap();
        let item = recv_with_idle(&mut rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(item, Some(7));
    }

    #[tokio::test]
    async fn idle_stream_times_out() {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<u32>(4);
        let err = recv_with_idle(&mut rx, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, TranslateError::IdleTimeout { .. }));
        drop(tx);
    }

    #[tokio::test]
    async fn closed_channel_is_a_clean_end() {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<u32>(4);
        drop(tx);
        let item = recv_with_idle(&mut rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(item, None);
    }
}
