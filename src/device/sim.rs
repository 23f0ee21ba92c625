//! In-process device backend.
//!
//! Paces capture and playback threads with the frame period exactly like a
//! sound card would, but takes its input from a scripted queue and records
//! the most recent periods it rendered. Meant for tests; the render history is
//! bounded so a long-running session does not grow without limit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{
    CaptureSink, DeviceBackend, DeviceHandle, Direction, PlaybackSource, StreamThread, sleep_until,
};
use crate::config::StreamConfig;
use crate::error::DeviceError;

/// Rendered periods kept by default: one minute of 20 ms frames.
pub const DEFAULT_HISTORY: usize = 3_000;

/// One rendered playback period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    /// `None` when the period was silence because the queue ran dry.
    pub seq: Option<u64>,
    pub filler: bool,
    pub samples: Vec<i16>,
}

#[derive(Debug)]
struct Shared {
    devices: Vec<String>,
    rates: Vec<u32>,
    period: Option<Duration>,
    loop_script: bool,
    history: usize,
    script: Mutex<VecDeque<Vec<i16>>>,
    rendered: Mutex<VecDeque<Rendered>>,
    capture_fault: AtomicBool,
    playback_fault: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
pub struct SimBackend {
    shared: Arc<Shared>,
}

impl SimBackend {
    /// Backend exposing the `default` and `sim` devices at any sample rate.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> SimBackendBuilder {
        SimBackendBuilder::default()
    }

    /// Queue frames for the capture side. Each entry is delivered as one
    /// period; when the queue is empty the capture thread keeps ticking
    /// without delivering audio.
    pub fn push_capture<I>(&self, frames: I)
    where
        I: IntoIterator<Item = Vec<i16>>,
    {
        lock(&self.shared.script).extend(frames);
    }

    pub fn pending_capture(&self) -> usize {
        lock(&self.shared.script).len()
    }

    /// The most recent rendered periods, silence included, oldest first.
    pub fn rendered(&self) -> Vec<Rendered> {
        lock(&self.shared.rendered).iter().cloned().collect()
    }

    /// Sequence numbers of the frames actually played, in order.
    pub fn played_seqs(&self) -> Vec<u64> {
        lock(&self.shared.rendered)
            .iter()
            .filter_map(|r| r.seq)
            .collect()
    }

    /// Make the given stream report a fault on its next period.
    pub fn inject_fault(&self, direction: Direction) {
        match direction {
            Direction::Capture => self.shared.capture_fault.store(true, Ordering::SeqCst),
            Direction::Playback => self.shared.playback_fault.store(true, Ordering::SeqCst),
        }
    }

    fn check(&self, device: &str, config: &StreamConfig) -> Result<(), DeviceError> {
        if !self.shared.devices.iter().any(|d| d == device) {
            return Err(DeviceError::DeviceUnavailable(format!(
                "no such device `{}`",
                device
            )));
        }
        if !self.shared.rates.is_empty() && !self.shared.rates.contains(&config.sample_rate) {
            return Err(DeviceError::DeviceUnavailable(format!(
                "`{}` cannot run at {} Hz",
                device, config.sample_rate
            )));
        }
        if !(1..=2).contains(&config.channels) {
            return Err(DeviceError::DeviceUnavailable(format!(
                "`{}` cannot open {} channels",
                device, config.channels
            )));
        }
        Ok(())
    }

    fn period(&self, config: &StreamConfig) -> Duration {
        self.shared.period.unwrap_or_else(|| config.frame_duration())
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct SimBackendBuilder {
    devices: Vec<String>,
    rates: Vec<u32>,
    period: Option<Duration>,
    loop_script: bool,
    history: usize,
}

impl Default for SimBackendBuilder {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            rates: Vec::new(),
            period: None,
            loop_script: false,
            history: DEFAULT_HISTORY,
        }
    }
}

impl SimBackendBuilder {
    /// Add a known device id. Without any, `default` and `sim` exist.
    pub fn device(mut self, id: impl Into<String>) -> Self {
        self.devices.push(id.into());
        self
    }

    /// Restrict the sample rates the devices accept.
    pub fn sample_rates(mut self, rates: &[u32]) -> Self {
        self.rates = rates.to_vec();
        self
    }

    /// Override the callback period (defaults to the frame duration).
    pub fn period(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    /// Re-queue each scripted frame after delivering it.
    pub fn loop_script(mut self, on: bool) -> Self {
        self.loop_script = on;
        self
    }

    /// Number of rendered periods to remember; older ones are forgotten.
    pub fn history(mut self, periods: usize) -> Self {
        self.history = periods.max(1);
        self
    }

    pub fn build(self) -> SimBackend {
        let devices = if self.devices.is_empty() {
            vec!["default".to_string(), "sim".to_string()]
        } else {
            self.devices
        };
        SimBackend {
            shared: Arc::new(Shared {
                devices,
                rates: self.rates,
                period: self.period,
                loop_script: self.loop_script,
                history: self.history,
                script: Mutex::new(VecDeque::new()),
                rendered: Mutex::new(VecDeque::with_capacity(self.history.min(DEFAULT_HISTORY))),
                capture_fault: AtomicBool::new(false),
                playback_fault: AtomicBool::new(false),
            }),
        }
    }
}

impl DeviceBackend for SimBackend {
    fn name(&self) -> &str {
        "sim"
    }

    fn open_capture(
        &self,
        config: &StreamConfig,
        mut sink: CaptureSink,
    ) -> Result<Box<dyn DeviceHandle>, DeviceError> {
        self.check(&config.input_device, config)?;
        let shared = self.shared.clone();
        let period = self.period(config);
        log::info!(
            "Sim capture: device={}, rate={}, ch={}, period={:?}",
            config.input_device,
            config.sample_rate,
            config.channels,
            period
        );

        let thread = StreamThread::new("sim-capture", Direction::Capture, move |running| {
            let mut next = Instant::now();
            while running.load(Ordering::Relaxed) {
                if shared.capture_fault.swap(false, Ordering::SeqCst) {
                    sink.fault("simulated capture fault");
                    break;
                }
                let frame = lock(&shared.script).pop_front();
                match frame {
                    Some(pcm) => {
                        sink.deliver(&pcm);
                        if shared.loop_script {
                            lock(&shared.script).push_back(pcm);
                        }
                    }
                    None => sink.mark_alive(),
                }
                next += period;
                sleep_until(next);
            }
        });
        Ok(Box::new(thread))
    }

    fn open_playback(
        &self,
        config: &StreamConfig,
        mut source: PlaybackSource,
    ) -> Result<Box<dyn DeviceHandle>, DeviceError> {
        self.check(&config.output_device, config)?;
        let shared = self.shared.clone();
        let period = self.period(config);
        let samples = config.samples_per_frame();
        log::info!(
            "Sim playback: device={}, rate={}, ch={}, period={:?}",
            config.output_device,
            config.sample_rate,
            config.channels,
            period
        );

        let thread = StreamThread::new("sim-playback", Direction::Playback, move |running| {
            let mut buf = vec![0i16; samples];
            let mut next = Instant::now();
            while running.load(Ordering::Relaxed) {
                if shared.playback_fault.swap(false, Ordering::SeqCst) {
                    source.fault("simulated playback fault");
                    break;
                }
                let played = source.pull(&mut buf);
                {
                    let mut rendered = lock(&shared.rendered);
                    if rendered.len() >= shared.history {
                        rendered.pop_front();
                    }
                    rendered.push_back(Rendered {
                        seq: played.map(|p| p.seq),
                        filler: played.is_some_and(|p| p.filler),
                        samples: buf.clone(),
                    });
                }
                next += period;
                sleep_until(next);
            }
        });
        Ok(Box::new(thread))
    }
}
