//! In-process endpoint that echoes every binary frame back.
//!
//! Answers the hello message with a `Welcome`, so a session behaves as it
//! would against a real server. `fail_first` makes the first connection
//! attempts fail, which drives the reconnect path.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use futures_util::{sink, stream};
use serde_json::json;
use tokio::sync::mpsc;

use super::{Connector, Link};
use crate::error::TransportError;
use crate::protocol::WireMessage;

const ECHO_DEPTH: usize = 64;

#[derive(Debug, Default)]
pub struct LoopbackConnector {
    fail_first: u32,
    attempts: AtomicU32,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the first `n` connection attempts.
    pub fn fail_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    /// Connection attempts so far, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

fn reply(msg: WireMessage) -> Option<WireMessage> {
    match msg {
        WireMessage::Binary(data) => Some(WireMessage::Binary(data)),
        WireMessage::Text(text) => {
            let is_hello = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v.get("session_id").and_then(|s| s.as_str()).map(String::from));
            is_hello.map(|id| {
                WireMessage::Text(json!({ "type": "Welcome", "session_id": id }).to_string())
            })
        }
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            return Err(TransportError::Connect(format!(
                "loopback refused attempt {}",
                attempt
            )));
        }

        let (tx, rx) = mpsc::channel::<WireMessage>(ECHO_DEPTH);
        let sink = sink::unfold(tx, |tx, msg: WireMessage| async move {
            if let Some(back) = reply(msg) {
                if tx.send(back).await.is_err() {
                    return Err(TransportError::Closed("loopback reader gone".to_string()));
                }
            }
            Ok(tx)
        });
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|msg| (Ok::<_, TransportError>(msg), rx))
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }

    fn endpoint(&self) -> String {
        "loopback".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};

    #[tokio::test]
    async fn echoes_binary_and_welcomes_hello() {
        let connector = LoopbackConnector::new();
        let mut link = connector.connect().await.unwrap();

        link.sink
            .send(WireMessage::Text(r#"{"type":"SettingsConfiguration","session_id":"s"}"#.into()))
            .await
            .unwrap();
        link.sink
            .send(WireMessage::Binary(Bytes::from_static(&[1, 2])))
            .await
            .unwrap();

        match link.stream.next().await {
            Some(Ok(WireMessage::Text(t))) => assert!(t.contains("Welcome")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            link.stream.next().await,
            Some(Ok(WireMessage::Binary(Bytes::from_static(&[1, 2]))))
        );
    }

    #[tokio::test]
    async fn refuses_first_attempts() {
        let connector = LoopbackConnector::new().fail_first(1);
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.attempts(), 2);
    }
}
