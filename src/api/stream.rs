use std::time::Duration;

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::api::errors::ApiError;

pub(crate) enum StreamItem {
    Frame(Value),
    Keepalive,
    Failed(ApiError),
}

/// A newline-delimited JSON stream. A reader task feeds decoded frames into
/// a channel; the consumer side enforces the idle watchdog. Empty lines are
/// keepalives: they produce no frame but feed the watchdog. The stream does
/// not reconnect by itself; the consumer owns that decision.
pub struct NdjsonStream {
    rx: mpsc::Receiver<StreamItem>,
    watchdog: Duration,
    reader: Option<JoinHandle<()>>,
}

impl NdjsonStream {
    pub(crate) fn from_response(response: reqwest::Response, watchdog: Duration) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let reader = tokio::spawn(read_lines(response, tx));
        NdjsonStream {
            rx,
            watchdog,
            reader: Some(reader),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_channel(rx: mpsc::Receiver<StreamItem>, watchdog: Duration) -> Self {
        NdjsonStream {
            rx,
            watchdog,
            reader: None,
        }
    }

    /// Next decoded frame. `Ok(None)` is a clean end of stream; `Stalled`
    /// means nothing at all arrived for a full watchdog interval.
    pub async fn next_frame(&mut self) -> Result<Option<Value>, ApiError> {
        loop {
            match tokio::time::timeout(self.watchdog, self.rx.recv()).await {
                Err(_) => {
                    self.close();
                    return Err(ApiError::Stalled);
                }
                Ok(None) => return Ok(None),
                Ok(Some(StreamItem::Keepalive)) => {
                    debug!("Stream keepalive");
                    continue;
                }
                Ok(Some(StreamItem::Frame(value))) => return Ok(Some(value)),
                Ok(Some(StreamItem::Failed(err))) => return Err(err),
            }
        }
    }

    /// Next frame decoded into a typed event.
    pub async fn next_event<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ApiError> {
        match self.next_frame().await? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| ApiError::Protocol(format!("unexpected frame shape: {}", e))),
        }
    }

    pub fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.rx.close();
    }
}

impl Drop for NdjsonStream {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_lines(response: reqwest::Response, tx: mpsc::Sender<StreamItem>) {
    let mut bytes = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx
                    .send(StreamItem::Failed(ApiError::Transport(e.to_string())))
                    .await;
                return;
            }
        };

        buffer.extend_from_slice(&chunk);
        while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();

            let item = if text.is_empty() {
                StreamItem::Keepalive
            } else {
                match serde_json::from_str(text) {
                    Ok(value) => StreamItem::Frame(value),
                    Err(e) => StreamItem::Failed(ApiError::Protocol(format!(
                        "undecodable frame: {}",
                        e
                    ))),
                }
            };

            let fatal = matches!(item, StreamItem::Failed(_));
            if tx.send(item).await.is_err() || fatal {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frames_are_delivered_in_order() {
        let (tx, rx) = mpsc::channel(8);
        let mut stream = NdjsonStream::from_channel(rx, Duration::from_secs(60));

        tx.send(StreamItem::Frame(json!({"type": "gameStart"})))
            .await
            .unwrap();
        tx.send(StreamItem::Frame(json!({"type": "gameFinish"})))
            .await
            .unwrap();
        drop(tx);

        let first = stream.next_frame().await.unwrap().unwrap();
        assert_eq!(first["type"], "gameStart");
        let second = stream.next_frame().await.unwrap().unwrap();
        assert_eq!(second["type"], "gameFinish");
        assert!(stream.next_frame().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalives_feed_the_watchdog() {
        let (tx, rx) = mpsc::channel(8);
        let mut stream = NdjsonStream::from_channel(rx, Duration::from_secs(60));

        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_secs(40)).await;
                if tx.send(StreamItem::Keepalive).await.is_err() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_secs(40)).await;
            let _ = tx.send(StreamItem::Frame(json!({"ok": true}))).await;
        });

        // 160 simulated seconds of keepalives, then a frame; the watchdog
        // never fires because something arrived inside every interval.
        let frame = stream.next_frame().await.unwrap().unwrap();
        assert_eq!(frame["ok"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_trips_the_watchdog() {
        let (tx, rx) = mpsc::channel::<StreamItem>(8);
        let mut stream = NdjsonStream::from_channel(rx, Duration::from_secs(60));

        // Keep the sender alive so the channel never closes; nothing is sent.
        let result = stream.next_frame().await;
        assert!(matches!(result, Err(ApiError::Stalled)));
        drop(tx);
    }

    #[tokio::test]
    async fn test_typed_decoding_flags_bad_shapes() {
        let (tx, rx) = mpsc::channel(8);
        let mut stream = NdjsonStream::from_channel(rx, Duration::from_secs(60));

        tx.send(StreamItem::Frame(json!({"type": "noSuchFrame"})))
            .await
            .unwrap();
        drop(tx);

        let result = stream
            .next_event::<crate::models::AccountEvent>()
            .await;
        assert!(matches!(result, Err(ApiError::Protocol(_))));
    }
}
