//! ALSA PCM backend for audio capture and playback.

use std::sync::atomic::Ordering;

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::ValueOr;
use anyhow::{Context, Result};

use super::{CaptureSink, DeviceBackend, DeviceHandle, Direction, PlaybackSource, StreamThread};
use crate::config::StreamConfig;
use crate::error::DeviceError;

/// 连续写入失败的熔断阈值
const MAX_WRITE_RETRIES: u32 = 3;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames (one frame = channels × sample_width)
    pub period_size: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlsaBackend;

impl AlsaBackend {
    pub fn new() -> Self {
        Self
    }
}

fn open_pcm(
    device: &str,
    direction: alsa::Direction,
    config: &StreamConfig,
    dir_name: &str,
) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    // Configure hardware parameters
    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(config.channels as u32)?;
        hwp.set_rate_near(config.sample_rate, ValueOr::Nearest)?;
        hwp.set_period_size_near(config.frame_size as alsa::pcm::Frames, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let (actual_rate, actual_channels, period_size) = {
        let hwp = pcm.hw_params_current()?;
        let rate = hwp.get_rate()?;
        let ch = hwp.get_channels()?;
        let ps = hwp.get_period_size()? as usize;
        (rate, ch, ps)
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        actual_rate,
        actual_channels,
        period_size,
    );

    Ok((
        pcm,
        AlsaParams {
            sample_rate: actual_rate,
            channels: actual_channels,
            period_size,
        },
    ))
}

/// Open and insist on the exact format: frames are fixed-size and the rest
/// of the pipeline does not renegotiate.
fn open_exact(
    device: &str,
    direction: alsa::Direction,
    config: &StreamConfig,
    dir_name: &str,
) -> Result<(PCM, AlsaParams), DeviceError> {
    let (pcm, params) = open_pcm(device, direction, config, dir_name)
        .map_err(|e| DeviceError::DeviceUnavailable(format!("{:#}", e)))?;
    if params.sample_rate != config.sample_rate || params.channels != config.channels as u32 {
        return Err(DeviceError::DeviceUnavailable(format!(
            "{} negotiated {} Hz/{} ch, wanted {} Hz/{} ch",
            device, params.sample_rate, params.channels, config.sample_rate, config.channels
        )));
    }
    Ok((pcm, params))
}

impl DeviceBackend for AlsaBackend {
    fn name(&self) -> &str {
        "alsa"
    }

    fn open_capture(
        &self,
        config: &StreamConfig,
        mut sink: CaptureSink,
    ) -> Result<Box<dyn DeviceHandle>, DeviceError> {
        let (pcm, params) = open_exact(
            &config.input_device,
            alsa::Direction::Capture,
            config,
            "Capture",
        )?;
        let channels = config.channels as usize;
        let frame_samples = config.samples_per_frame();

        let thread = StreamThread::new("alsa-capture", Direction::Capture, move |running| {
            let io = match pcm.io_i16() {
                Ok(io) => io,
                Err(e) => {
                    sink.fault(format!("capture io: {}", e));
                    return;
                }
            };
            // ALSA read buffer (interleaved i16, one period)
            let mut read_buf = vec![0i16; params.period_size * channels];
            // Accumulation buffer; periods need not line up with frames
            let mut accum_buf: Vec<i16> = Vec::with_capacity(frame_samples + read_buf.len());

            log::info!("Recording started: period={}", params.period_size);
            while running.load(Ordering::Relaxed) {
                match io.readi(&mut read_buf) {
                    Ok(frames) => {
                        accum_buf.extend_from_slice(&read_buf[..frames * channels]);
                        while accum_buf.len() >= frame_samples {
                            sink.deliver(&accum_buf[..frame_samples]);
                            accum_buf.drain(..frame_samples);
                        }
                    }
                    Err(e) => {
                        log::warn!("ALSA capture error: {}, recovering...", e);
                        if let Err(e2) = pcm.prepare() {
                            log::error!("Failed to recover PCM capture: {}", e2);
                            sink.fault(format!("capture recovery failed: {}", e2));
                            break;
                        }
                    }
                }
            }
            log::info!("Recording stopped");
        });
        Ok(Box::new(thread))
    }

    fn open_playback(
        &self,
        config: &StreamConfig,
        mut source: PlaybackSource,
    ) -> Result<Box<dyn DeviceHandle>, DeviceError> {
        let (pcm, params) = open_exact(
            &config.output_device,
            alsa::Direction::Playback,
            config,
            "Playback",
        )?;
        let channels = config.channels as usize;
        let frame_samples = config.samples_per_frame();

        let thread = StreamThread::new("alsa-playback", Direction::Playback, move |running| {
            let io = match pcm.io_i16() {
                Ok(io) => io,
                Err(e) => {
                    source.fault(format!("playback io: {}", e));
                    return;
                }
            };
            let mut buf = vec![0i16; frame_samples];
            let total_frames = frame_samples / channels;

            log::info!("Playback started: period={}", params.period_size);
            'outer: while running.load(Ordering::Relaxed) {
                source.pull(&mut buf);

                // Short writes and XRUN recovery without losing the frame.
                let mut frames_written = 0;
                let mut retry_count = 0u32;
                while frames_written < total_frames {
                    let offset = frames_written * channels;
                    match io.writei(&buf[offset..]) {
                        Ok(n) => {
                            frames_written += n;
                            retry_count = 0;
                        }
                        Err(e) => {
                            log::warn!("ALSA XRUN or error: {}, recovering...", e);
                            retry_count += 1;

                            // 触发 ALSA 硬件恢复状态机
                            if let Err(e2) = pcm.prepare() {
                                log::error!("Failed to recover PCM playback: {}", e2);
                                source.fault(format!("playback recovery failed: {}", e2));
                                break 'outer;
                            }

                            // 熔断器：底层持续跟不上写入速度时，丢弃剩余帧防止死循环
                            if retry_count >= MAX_WRITE_RETRIES {
                                log::error!(
                                    "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                                    retry_count,
                                    total_frames - frames_written
                                );
                                break;
                            }
                        }
                    }
                }
            }
            log::info!("Playback stopped");
        });
        Ok(Box::new(thread))
    }
}
