#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{sink, stream};
use tokio::sync::mpsc;

use voice_agent::config::{Framing, SessionConfig};
use voice_agent::device::sim::SimBackend;
use voice_agent::error::TransportError;
use voice_agent::protocol::{EncodedFrame, WireMessage};
use voice_agent::transport::loopback::LoopbackConnector;
use voice_agent::transport::{Connector, Link};
use voice_agent::{Session, SessionState};

/// 48 kHz mono, 20 ms frames, capacity 4, fast reconnects.
pub fn config() -> SessionConfig {
    let mut cfg = SessionConfig::default();
    cfg.buffer.capacity = 4;
    cfg.transport.reconnect_ceiling = 3;
    cfg.transport.backoff_initial = Duration::from_millis(2);
    cfg.transport.backoff_max = Duration::from_millis(10);
    cfg.transport.close_timeout = Duration::from_millis(200);
    cfg.drain_timeout = Duration::from_millis(500);
    cfg
}

pub fn session(backend: &SimBackend, connector: Arc<dyn Connector>) -> Session {
    Session::new(config(), Arc::new(backend.clone()), connector).unwrap()
}

pub fn loopback() -> Arc<dyn Connector> {
    Arc::new(LoopbackConnector::new())
}

/// Frame `i` of the test script: every sample equals `i * 100 + 1`.
pub fn scripted_frame(i: u64, samples: usize) -> Vec<i16> {
    vec![(i * 100 + 1) as i16; samples]
}

pub async fn wait_for_state(session: &Session, want: SessionState) {
    let mut rx = session.subscribe();
    tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", want))
        .unwrap();
}

/// Poll `cond` until it holds or three seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn echo_link<S, F>(state: S, reply: F) -> Link
where
    S: Send + 'static,
    F: FnMut(&mut S, WireMessage) -> Vec<WireMessage> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<WireMessage>(64);
    let sink = sink::unfold(
        (tx, state, reply),
        |(tx, mut state, mut reply), msg: WireMessage| async move {
            for back in reply(&mut state, msg) {
                if tx.send(back).await.is_err() {
                    return Err(TransportError::Closed("reader gone".to_string()));
                }
            }
            Ok((tx, state, reply))
        },
    );
    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|m| (Ok::<_, TransportError>(m), rx))
    });
    Link {
        sink: Box::pin(sink),
        stream: Box::pin(stream),
    }
}

/// Echoes binary frames with each adjacent pair swapped: 1, 0, 3, 2, ...
pub struct SwappingConnector;

#[async_trait]
impl Connector for SwappingConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        Ok(echo_link(None::<Bytes>, |held, msg| match msg {
            WireMessage::Binary(data) => match held.take() {
                None => {
                    *held = Some(data);
                    Vec::new()
                }
                Some(prev) => vec![WireMessage::Binary(data), WireMessage::Binary(prev)],
            },
            WireMessage::Text(_) => Vec::new(),
        }))
    }

    fn endpoint(&self) -> String {
        "swapping".to_string()
    }
}

/// Echoes binary frames, then asks the client to hang up after `after` of them.
pub struct ClosingConnector {
    pub after: usize,
}

#[async_trait]
impl Connector for ClosingConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        let after = self.after;
        Ok(echo_link(0usize, move |seen, msg| match msg {
            WireMessage::Binary(data) => {
                *seen += 1;
                let mut out = vec![WireMessage::Binary(data)];
                if *seen == after {
                    out.push(WireMessage::Text(r#"{"type":"CloseConnection"}"#.to_string()));
                }
                out
            }
            WireMessage::Text(_) => Vec::new(),
        }))
    }

    fn endpoint(&self) -> String {
        "closing".to_string()
    }
}

/// Little-endian linear16 bytes.
pub fn linear16(samples: &[i16]) -> Bytes {
    samples
        .iter()
        .flat_map(|s| s.to_le_bytes())
        .collect::<Vec<u8>>()
        .into()
}

/// One framed binary message of `samples`, stamped as frame `seq`.
pub fn framed(seq: u64, samples: &[i16]) -> WireMessage {
    WireMessage::Binary(EncodedFrame::new(seq, seq * 20_000, linear16(samples)).to_wire(Framing::Framed))
}

/// One headerless binary message.
pub fn raw(samples: &[i16]) -> WireMessage {
    WireMessage::Binary(linear16(samples))
}

/// Plays a fixed list of server messages, each after its delay, once the
/// client's hello arrives. Everything the client sends is ignored.
pub struct ScriptedConnector {
    pub script: Vec<(Duration, WireMessage)>,
}

impl ScriptedConnector {
    /// All messages at once.
    pub fn burst(messages: impl IntoIterator<Item = WireMessage>) -> Self {
        Self {
            script: messages.into_iter().map(|m| (Duration::ZERO, m)).collect(),
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        let (tx, rx) = mpsc::channel::<WireMessage>(64);
        let script = Some(self.script.clone());
        let sink = sink::unfold(
            (tx, script),
            |(tx, mut script), msg: WireMessage| async move {
                if matches!(msg, WireMessage::Text(_)) {
                    if let Some(steps) = script.take() {
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            for (delay, msg) in steps {
                                tokio::time::sleep(delay).await;
                                if tx.send(msg).await.is_err() {
                                    return;
                                }
                            }
                        });
                    }
                }
                Ok::<_, TransportError>((tx, script))
            },
        );
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|m| (Ok::<_, TransportError>(m), rx))
        });
        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }

    fn endpoint(&self) -> String {
        "scripted".to_string()
    }
}
