//! Session controller.
//!
//! Owns the lifecycle: `start()` opens both devices, spawns the pipeline
//! thread and the transport task, then hands everything to a supervisor
//! task. The supervisor is the only place resources are torn down, whether
//! the session ends through `stop()`, a server request or a fatal error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::{FramePool, ring_buffer};
use crate::config::{OverflowPolicy, SessionConfig};
use crate::device::{CaptureSink, DeviceBackend, DeviceEvent, DeviceHandle, PlaybackSource};
use crate::error::SessionError;
use crate::pipeline::{Pipeline, PipelineHandle};
use crate::protocol::ControlEvent;
use crate::state_machine::{SessionState, StateMachine};
use crate::stats::{SessionStats, StatsSnapshot};
use crate::transport::{Connector, TransportEvent, transport};

/// Spare pool buffers beyond what both rings can hold.
const POOL_SLACK: usize = 4;
/// Extra time the transport task gets beyond its own close timeout.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

enum Command {
    Stop,
}

pub struct Session {
    config: SessionConfig,
    backend: Arc<dyn DeviceBackend>,
    connector: Arc<dyn Connector>,
    machine: Arc<StateMachine>,
    stats: Arc<SessionStats>,
    session_id: String,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    stop_requested: AtomicBool,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        backend: Arc<dyn DeviceBackend>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            config,
            backend,
            connector,
            machine: Arc::new(StateMachine::new()),
            stats: Arc::new(SessionStats::new()),
            session_id: Uuid::new_v4().to_string(),
            commands: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.machine.current()
    }

    /// Watch every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.machine.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.machine.current())
    }

    /// Cause of the transition to `Failed`, if any.
    pub fn failure(&self) -> Option<String> {
        self.machine.failure()
    }

    pub fn failed_transitions(&self) -> u32 {
        self.machine.failed_transitions()
    }

    /// Resolves once the session is `Stopped` or `Failed`.
    pub async fn wait_terminal(&self) -> SessionState {
        let mut rx = self.machine.subscribe();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.machine.current(),
        }
    }

    /// Open devices, spawn the pipeline and transport. Returns once
    /// everything is launched; the session reaches `Running` when both
    /// device streams have called back.
    pub async fn start(&self) -> Result<(), SessionError> {
        if let Err(state) = self.machine.transition(SessionState::Starting) {
            return Err(if state.is_terminal() {
                SessionError::AlreadyStopped
            } else {
                SessionError::InvalidState {
                    op: "start",
                    state: state.to_string(),
                }
            });
        }
        log::info!("Starting session {}", self.session_id);

        let supervisor = match self.launch() {
            Ok(s) => s,
            Err(e) => {
                self.machine.fail(e.to_string());
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut slot = self.commands.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(tx.clone());
        }
        tokio::spawn(supervisor.run(rx));
        if self.stop_requested.load(Ordering::SeqCst) {
            let _ = tx.send(Command::Stop);
        }
        Ok(())
    }

    fn launch(&self) -> Result<Supervisor, SessionError> {
        let cfg = &self.config;
        let epoch = Instant::now();
        let samples = cfg.stream.samples_per_frame();
        let capacity = cfg.buffer.capacity;

        let pool = FramePool::new(samples, capacity * 2 + POOL_SLACK);
        let accepting = Arc::new(AtomicBool::new(true));
        let flush = Arc::new(AtomicBool::new(false));

        // 采集环形缓冲区由硬件线程写入，固定使用丢弃最旧策略
        let (cap_tx, cap_rx) = ring_buffer(capacity, OverflowPolicy::DropOldest);
        let (play_tx, play_rx) = ring_buffer(capacity, cfg.buffer.policy);
        let cap_tx = cap_tx.with_recycling(pool.clone());
        let play_tx = play_tx.with_recycling(pool.clone());

        let (dev_tx, dev_rx) = mpsc::unbounded_channel();
        let sink = CaptureSink::new(
            cap_tx,
            pool.clone(),
            self.stats.clone(),
            accepting.clone(),
            dev_tx.clone(),
            cfg.stream.channels,
            epoch,
        );
        let source = PlaybackSource::new(
            play_rx,
            pool.clone(),
            self.stats.clone(),
            flush.clone(),
            dev_tx,
            cfg.buffer.playback_wait,
        );

        let mut capture = self.backend.open_capture(&cfg.stream, sink)?;
        let mut playback = self.backend.open_playback(&cfg.stream, source)?;

        let (tr_tx, tr_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (adapter, handle) = transport(
            self.connector.clone(),
            &cfg.transport,
            &cfg.wire,
            self.session_id.clone(),
            self.stats.clone(),
            tr_tx,
            shutdown_rx,
        );

        let pipeline = Pipeline::new(
            cfg,
            cap_rx,
            play_tx,
            handle,
            pool,
            self.stats.clone(),
            flush,
            epoch,
        )
        .map_err(|e| SessionError::Failed(e.to_string()))?
        .spawn()
        .map_err(|e| SessionError::Failed(format!("spawn pipeline: {}", e)))?;

        playback.start()?;
        capture.start()?;
        let transport_task = tokio::spawn(adapter.run());

        Ok(Supervisor {
            machine: self.machine.clone(),
            resources: Resources {
                capture: Some(capture),
                playback: Some(playback),
                pipeline: Some(pipeline),
                transport: Some(transport_task),
                shutdown: shutdown_tx,
                accepting,
                close_timeout: cfg.transport.close_timeout,
            },
            device_events: dev_rx,
            transport_events: tr_rx,
            drain_timeout: cfg.drain_timeout,
            capture_alive: false,
            playback_alive: false,
        })
    }

    /// Drain and stop. Safe to call from any task; a second call fails with
    /// `AlreadyStopped` and leaves the state alone.
    pub async fn stop(&self) -> Result<(), SessionError> {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStopped);
        }
        match self.machine.current() {
            SessionState::Idle => {
                if self.machine.transition(SessionState::Stopped).is_ok() {
                    return Ok(());
                }
            }
            s if s.is_terminal() => return Err(SessionError::AlreadyStopped),
            _ => {}
        }

        let commands = self
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(tx) = commands {
            let _ = tx.send(Command::Stop);
        }

        match self.wait_terminal().await {
            SessionState::Stopped => Ok(()),
            _ => Err(SessionError::Failed(self.failure().unwrap_or_default())),
        }
    }
}

// ======================== Supervisor ========================

struct Resources {
    capture: Option<Box<dyn DeviceHandle>>,
    playback: Option<Box<dyn DeviceHandle>>,
    pipeline: Option<PipelineHandle>,
    transport: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    accepting: Arc<AtomicBool>,
    close_timeout: Duration,
}

impl Resources {
    /// Stop devices first so no callback runs afterwards, then the pipeline,
    /// then the link. Dropping the pipeline releases both rings.
    async fn release(&mut self) {
        self.accepting.store(false, Ordering::SeqCst);

        let capture = self.capture.take();
        let playback = self.playback.take();
        let pipeline = self.pipeline.take();
        let joined = tokio::task::spawn_blocking(move || {
            for mut device in [capture, playback].into_iter().flatten() {
                if let Err(e) = device.stop() {
                    log::debug!("{} stop: {}", device.direction(), e);
                }
            }
            if let Some(mut pipeline) = pipeline {
                pipeline.stop();
            }
        })
        .await;
        if let Err(e) = joined {
            log::error!("Device teardown panicked: {}", e);
        }

        let _ = self.shutdown.send(true);
        if let Some(mut task) = self.transport.take() {
            if tokio::time::timeout(self.close_timeout + CLOSE_GRACE, &mut task)
                .await
                .is_err()
            {
                log::warn!("Transport did not close in time, aborting");
                task.abort();
            }
        }
    }
}

enum Outcome {
    Stop,
    Fail(String),
}

struct Supervisor {
    machine: Arc<StateMachine>,
    resources: Resources,
    device_events: mpsc::UnboundedReceiver<DeviceEvent>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    drain_timeout: Duration,
    capture_alive: bool,
    playback_alive: bool,
}

impl Supervisor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let outcome = loop {
            tokio::select! {
                Some(event) = self.device_events.recv() => {
                    if let Some(o) = self.on_device(event) {
                        break o;
                    }
                }
                Some(event) = self.transport_events.recv() => {
                    if let Some(o) = self.on_transport(event) {
                        break o;
                    }
                }
                // None: the session handle was dropped
                _ = commands.recv() => break Outcome::Stop,
            }
        };

        match outcome {
            Outcome::Fail(cause) => {
                self.resources.release().await;
                self.machine.fail(cause);
            }
            Outcome::Stop => {
                if self.machine.transition(SessionState::Draining).is_err() {
                    self.resources.release().await;
                    return;
                }
                let drained = self.drain().await;
                self.resources.release().await;
                match drained {
                    Ok(()) => {
                        let _ = self.machine.transition(SessionState::Stopped);
                    }
                    Err(cause) => {
                        self.machine.fail(cause);
                    }
                }
            }
        }
    }

    /// Stop accepting capture and let queued frames flow out, bounded by
    /// the drain timeout. Fatal errors still abort the drain.
    async fn drain(&mut self) -> Result<(), String> {
        self.resources.accepting.store(false, Ordering::SeqCst);
        let Some(drained) = self.resources.pipeline.as_ref().map(|p| p.begin_drain()) else {
            return Ok(());
        };
        let deadline = tokio::time::sleep(self.drain_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = drained.wait() => {
                    log::info!("Drain complete");
                    return Ok(());
                }
                _ = &mut deadline => {
                    log::warn!("Drain timed out after {:?}", self.drain_timeout);
                    return Ok(());
                }
                Some(event) = self.device_events.recv() => {
                    if let Some(Outcome::Fail(cause)) = self.on_device(event) {
                        return Err(cause);
                    }
                }
                Some(event) = self.transport_events.recv() => {
                    if let Some(Outcome::Fail(cause)) = self.on_transport(event) {
                        return Err(cause);
                    }
                }
            }
        }
    }

    fn on_device(&mut self, event: DeviceEvent) -> Option<Outcome> {
        match event {
            DeviceEvent::FirstCallback(direction) => {
                log::debug!("{} stream is live", direction);
                match direction {
                    crate::device::Direction::Capture => self.capture_alive = true,
                    crate::device::Direction::Playback => self.playback_alive = true,
                }
                if self.capture_alive && self.playback_alive {
                    let _ = self.machine.transition(SessionState::Running);
                }
                None
            }
            DeviceEvent::Fault { direction, message } => Some(Outcome::Fail(format!(
                "{} device fault: {}",
                direction, message
            ))),
        }
    }

    fn on_transport(&mut self, event: TransportEvent) -> Option<Outcome> {
        match event {
            TransportEvent::Connected => None,
            TransportEvent::Disconnected(e) => {
                log::warn!("Disconnected: {}", e);
                None
            }
            TransportEvent::Fatal(e) => Some(Outcome::Fail(e.to_string())),
            TransportEvent::Control(control) => match control {
                ControlEvent::Welcome { session_id } => {
                    log::info!("Connected with session ID: {:?}", session_id);
                    None
                }
                ControlEvent::UserStartedSpeaking => {
                    if let Some(pipeline) = &self.resources.pipeline {
                        pipeline.barge_in();
                    }
                    None
                }
                ControlEvent::CloseConnection => {
                    log::info!("Server requested close");
                    Some(Outcome::Stop)
                }
                ControlEvent::ConversationText { role, content } => {
                    log::info!("{}: {}", role, content);
                    None
                }
                ControlEvent::Error(description) => {
                    log::warn!("Server error: {}", description);
                    None
                }
                ControlEvent::Other(kind) => {
                    log::debug!("Server: {}", kind);
                    None
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::SimBackend;
    use crate::error::DeviceError;
    use crate::transport::loopback::LoopbackConnector;

    fn session(backend: SimBackend) -> Session {
        Session::new(
            SessionConfig::default(),
            Arc::new(backend),
            Arc::new(LoopbackConnector::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn stop_before_start() {
        let s = session(SimBackend::new());
        s.stop().await.unwrap();
        assert_eq!(s.state(), SessionState::Stopped);
        assert_eq!(s.stop().await, Err(SessionError::AlreadyStopped));
        assert_eq!(s.start().await, Err(SessionError::AlreadyStopped));
    }

    #[tokio::test]
    async fn unknown_device_fails_start() {
        let mut cfg = SessionConfig::default();
        cfg.stream.input_device = "missing".to_string();
        let s = Session::new(
            cfg,
            Arc::new(SimBackend::new()),
            Arc::new(LoopbackConnector::new()),
        )
        .unwrap();

        let err = s.start().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Device(DeviceError::DeviceUnavailable(_))
        ));
        assert_eq!(s.state(), SessionState::Failed);
        assert_eq!(s.failed_transitions(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_then_stop() {
        let s = session(SimBackend::new());
        s.start().await.unwrap();
        let mut rx = s.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|st| *st == SessionState::Running),
        )
        .await
        .unwrap()
        .unwrap();

        s.stop().await.unwrap();
        assert_eq!(s.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut cfg = SessionConfig::default();
        cfg.buffer.capacity = 0;
        let r = Session::new(
            cfg,
            Arc::new(SimBackend::new()),
            Arc::new(LoopbackConnector::new()),
        );
        assert!(matches!(r, Err(SessionError::Config(_))));
    }
}
