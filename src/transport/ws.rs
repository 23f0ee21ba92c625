use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, future};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use super::{Connector, Link};
use crate::error::TransportError;
use crate::protocol::WireMessage;

/// Websocket endpoint (`ws://` or `wss://`).
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
    token: Option<String>,
    auth_scheme: String,
}

impl WsConnector {
    pub fn new(url: &str, token: Option<String>, auth_scheme: &str) -> Result<Self, TransportError> {
        let url = Url::parse(url).map_err(|e| TransportError::Connect(format!("{}: {}", url, e)))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::Connect(format!(
                    "unsupported scheme `{}`",
                    other
                )));
            }
        }
        if url.host_str().is_none() {
            return Err(TransportError::Connect(format!("{} has no host", url)));
        }
        Ok(Self {
            url,
            token,
            auth_scheme: auth_scheme.to_string(),
        })
    }

    fn request(&self) -> Result<Request<()>, TransportError> {
        let host = match (self.url.host_str(), self.url.port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            (None, _) => return Err(TransportError::Connect("missing host".to_string())),
        };

        // 根据配置构建WebSocket请求
        let mut builder = Request::builder()
            .method("GET")
            .uri(self.url.as_str())
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key());
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("{} {}", self.auth_scheme, token));
        }
        builder
            .body(())
            .map_err(|e| TransportError::Connect(e.to_string()))
    }
}

fn to_message(msg: WireMessage) -> Message {
    match msg {
        WireMessage::Binary(data) => Message::Binary(data),
        WireMessage::Text(text) => Message::Text(text.into()),
    }
}

fn from_message(msg: Message) -> Option<Result<WireMessage, TransportError>> {
    match msg {
        Message::Binary(data) => Some(Ok(WireMessage::Binary(data))),
        Message::Text(text) => Some(Ok(WireMessage::Text(text.to_string()))),
        Message::Close(frame) => Some(Err(TransportError::Closed(format!(
            "server closed connection: {:?}",
            frame
        )))),
        // ping/pong are answered by tungstenite
        _ => None,
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        let request = self.request()?;
        log::info!("Connecting to {}...", self.url);
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (write, read) = ws_stream.split();
        let sink = write
            .sink_map_err(|e| TransportError::Closed(e.to_string()))
            .with(|msg: WireMessage| future::ready(Ok::<_, TransportError>(to_message(msg))));
        let stream = read.filter_map(|item| {
            future::ready(match item {
                Ok(msg) => from_message(msg),
                Err(e) => Some(Err(TransportError::Closed(e.to_string()))),
            })
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }

    fn endpoint(&self) -> String {
        self.url.to_string()
    }
}
