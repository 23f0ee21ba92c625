//! Transport adapter: carries encoded frames between the pipeline and the
//! processing endpoint.
//!
//! The adapter runs as a tokio task that owns the connection and its
//! reconnect loop. The pipeline thread talks to it through a
//! [`TransportHandle`], which never blocks on the send side.

pub mod loopback;
pub mod ws;

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};

use crate::config::{TransportConfig, WireConfig};
use crate::error::TransportError;
use crate::protocol::{ControlEvent, EncodedFrame, HelloMessage, WireMessage};
use crate::stats::SessionStats;

/// How often a stalled inbound frame retries a full queue.
const INBOUND_RETRY: Duration = Duration::from_millis(2);

pub type LinkSink = Pin<Box<dyn Sink<WireMessage, Error = TransportError> + Send>>;
pub type LinkStream = Pin<Box<dyn Stream<Item = Result<WireMessage, TransportError>> + Send>>;

/// An established connection, split into its two directions.
pub struct Link {
    pub sink: LinkSink,
    pub stream: LinkStream,
}

/// Opens links to the processing endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Link, TransportError>;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> String;
}

/// Notifications for the session supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected(TransportError),
    Control(ControlEvent),
    /// The reconnect ceiling was hit; the adapter has exited.
    Fatal(TransportError),
}

/// Result of [`TransportHandle::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Not connected: the frame was dropped.
    Dropped,
    /// Outbound queue full: the frame was dropped and the caller should back off.
    Full,
}

// ======================== Pipeline side ========================

pub struct TransportHandle {
    outbound: mpsc::Sender<EncodedFrame>,
    inbound: crossbeam_channel::Receiver<EncodedFrame>,
    connected: Arc<AtomicBool>,
    stats: Arc<SessionStats>,
}

impl TransportHandle {
    /// Fire-and-forget. Never blocks.
    pub fn send(&self, frame: EncodedFrame) -> SendOutcome {
        if !self.connected.load(Ordering::Acquire) {
            self.count_drop();
            return SendOutcome::Dropped;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => {
                self.stats.drop_run.store(0, Ordering::Relaxed);
                SessionStats::incr(&self.stats.frames_forwarded);
                SendOutcome::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.count_drop();
                SendOutcome::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.count_drop();
                SendOutcome::Dropped
            }
        }
    }

    fn count_drop(&self) {
        SessionStats::incr(&self.stats.transport_drops);
        SessionStats::incr(&self.stats.drop_run);
    }

    /// Wait up to `timeout` for the next frame from the endpoint.
    pub fn receive(&self, timeout: Duration) -> Result<EncodedFrame, TransportError> {
        match self.inbound.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(TransportError::Timeout),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(TransportError::Closed("adapter stopped".to_string()))
            }
        }
    }

    pub fn try_receive(&self) -> Option<EncodedFrame> {
        self.inbound.try_recv().ok()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Nothing from the endpoint is waiting for the pipeline.
    pub fn inbound_idle(&self) -> bool {
        self.inbound.is_empty()
    }

    /// Nothing is waiting to be written to the link.
    pub fn outbound_idle(&self) -> bool {
        self.outbound.capacity() == self.outbound.max_capacity()
    }
}

// ======================== Adapter task ========================

enum Exit {
    Shutdown,
    ServerClosed,
}

pub struct TransportAdapter {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    wire: WireConfig,
    session_id: String,
    outbound: mpsc::Receiver<EncodedFrame>,
    inbound: crossbeam_channel::Sender<EncodedFrame>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
    stats: Arc<SessionStats>,
}

/// Build an adapter and the handle the pipeline uses to reach it.
pub fn transport(
    connector: Arc<dyn Connector>,
    config: &TransportConfig,
    wire: &WireConfig,
    session_id: impl Into<String>,
    stats: Arc<SessionStats>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: watch::Receiver<bool>,
) -> (TransportAdapter, TransportHandle) {
    let (out_tx, out_rx) = mpsc::channel(config.queue_depth.max(1));
    let (in_tx, in_rx) = crossbeam_channel::bounded(config.queue_depth.max(1));
    let connected = Arc::new(AtomicBool::new(false));
    (
        TransportAdapter {
            connector,
            config: config.clone(),
            wire: wire.clone(),
            session_id: session_id.into(),
            outbound: out_rx,
            inbound: in_tx,
            events,
            shutdown,
            connected: connected.clone(),
            stats: stats.clone(),
        },
        TransportHandle {
            outbound: out_tx,
            inbound: in_rx,
            connected,
            stats,
        },
    )
}

impl TransportAdapter {
    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    // 连接失败或断开后指数退避重连，连续失败达到上限即放弃
    pub async fn run(mut self) {
        let mut delay = self.config.backoff_initial;
        let mut failures = 0u32;
        let mut attempted = false;

        while !self.shutting_down() {
            if attempted {
                SessionStats::incr(&self.stats.reconnects);
            }
            attempted = true;

            let connect = self.connector.connect();
            let result = tokio::select! {
                r = connect => r,
                _ = self.shutdown.changed() => break,
            };

            match result {
                Ok(link) => {
                    failures = 0;
                    delay = self.config.backoff_initial;
                    log::info!("Connected to {}", self.connector.endpoint());
                    self.discard_stale();
                    self.connected.store(true, Ordering::Release);
                    let _ = self.events.send(TransportEvent::Connected);

                    let served = self.serve(link).await;
                    self.connected.store(false, Ordering::Release);
                    match served {
                        Ok(Exit::Shutdown) => break,
                        Ok(Exit::ServerClosed) => {
                            log::info!("Server closed the session");
                            break;
                        }
                        Err(e) => {
                            log::warn!("Link lost: {}", e);
                            let _ = self.events.send(TransportEvent::Disconnected(e));
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    log::warn!(
                        "Connection attempt {}/{} failed: {}",
                        failures,
                        self.config.reconnect_ceiling,
                        e
                    );
                    if failures >= self.config.reconnect_ceiling {
                        let fatal = TransportError::TransportFatal {
                            attempts: failures,
                            last_error: e.to_string(),
                        };
                        let _ = self.events.send(TransportEvent::Fatal(fatal));
                        break;
                    }
                }
            }

            log::info!("Retrying in {:?}...", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
            delay = (delay * 2).min(self.config.backoff_max);
        }

        self.connected.store(false, Ordering::Release);
        log::debug!("Transport adapter exited");
    }

    /// Frames queued before the link went down are stale by now.
    fn discard_stale(&mut self) {
        while self.outbound.try_recv().is_ok() {
            SessionStats::incr(&self.stats.transport_drops);
        }
    }

    async fn serve(&mut self, link: Link) -> Result<Exit, TransportError> {
        let Link {
            mut sink,
            mut stream,
        } = link;

        // 发送Hello消息进行初始化链接
        let hello = HelloMessage::new(&self.session_id, &self.wire)
            .to_json()
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        log::debug!("Sending hello: {}", hello);
        sink.send(WireMessage::Text(hello)).await?;

        // while the pipeline's queue is full, stop reading the link
        let mut stalled: Option<EncodedFrame> = None;
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    self.close(&mut sink).await;
                    return Ok(Exit::Shutdown);
                }
                frame = self.outbound.recv() => match frame {
                    Some(frame) => {
                        sink.send(WireMessage::Binary(frame.to_wire(self.wire.framing))).await?;
                    }
                    None => {
                        self.close(&mut sink).await;
                        return Ok(Exit::Shutdown);
                    }
                },
                _ = tokio::time::sleep(INBOUND_RETRY), if stalled.is_some() => {
                    if let Some(frame) = stalled.take() {
                        stalled = self.deliver(frame);
                    }
                }
                msg = stream.next(), if stalled.is_none() => match msg {
                    Some(Ok(WireMessage::Binary(data))) => stalled = self.on_binary(data),
                    Some(Ok(WireMessage::Text(text))) => {
                        if self.on_text(&text) {
                            self.close(&mut sink).await;
                            return Ok(Exit::ServerClosed);
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(TransportError::Closed("stream ended".to_string())),
                },
            }
        }
    }

    fn on_binary(&self, data: bytes::Bytes) -> Option<EncodedFrame> {
        match EncodedFrame::from_wire(data, self.wire.framing) {
            Ok(frame) => self.deliver(frame),
            Err(e) => {
                log::warn!("Dropping inbound message: {}", e);
                SessionStats::incr(&self.stats.codec_errors);
                None
            }
        }
    }

    /// Hand a frame to the pipeline. A full queue gives it back.
    fn deliver(&self, frame: EncodedFrame) -> Option<EncodedFrame> {
        match self.inbound.try_send(frame) {
            Ok(()) => None,
            Err(crossbeam_channel::TrySendError::Full(frame)) => Some(frame),
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                SessionStats::incr(&self.stats.transport_drops);
                None
            }
        }
    }

    /// Returns true when the server asked to end the session.
    fn on_text(&self, text: &str) -> bool {
        match ControlEvent::parse(text) {
            Ok(event) => {
                let close = event == ControlEvent::CloseConnection;
                let _ = self.events.send(TransportEvent::Control(event));
                close
            }
            Err(e) => {
                log::warn!("Unrecognised server message ({}): {}", e, text);
                false
            }
        }
    }

    async fn close(&self, sink: &mut LinkSink) {
        match tokio::time::timeout(self.config.close_timeout, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Error during close: {}", e),
            Err(_) => log::warn!(
                "Close handshake timed out after {:?}",
                self.config.close_timeout
            ),
        }
    }
}
