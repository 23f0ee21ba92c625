use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ======================== Build-time configuration ========================

/// 从 config.toml 编译期导出的原始配置
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 音频设备
    pub capture_device: &'static str,
    pub playback_device: &'static str,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,

    // 环形缓冲区
    pub buffer_capacity: usize,
    pub overflow_policy: &'static str,
    pub push_timeout_ms: u64,
    pub playback_wait_ms: u64,
    pub downlink_backlog_ms: u64,

    // 线路格式
    pub wire_codec: &'static str,
    pub wire_framing: &'static str,
    pub uplink_sample_rate: u32,
    pub downlink_sample_rate: u32,
    pub wire_channels: u16,
    pub opus_bitrate: i32,

    // 网络
    pub ws_url: &'static str,
    pub ws_token: &'static str,
    pub token_env: &'static str,
    pub auth_scheme: &'static str,

    // 重连
    pub reconnect_ceiling: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub queue_depth: usize,
    pub close_timeout_ms: u64,

    // 会话
    pub drain_timeout_ms: u64,
    pub expected_latency_ms: u64,
}

fn parse<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Parse(key))
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            capture_device: env!("AUDIO_CAPTURE_DEVICE"),
            playback_device: env!("AUDIO_PLAYBACK_DEVICE"),
            sample_rate: parse("AUDIO_SAMPLE_RATE", env!("AUDIO_SAMPLE_RATE"))?,
            channels: parse("AUDIO_CHANNELS", env!("AUDIO_CHANNELS"))?,
            frame_duration_ms: parse("AUDIO_FRAME_DURATION_MS", env!("AUDIO_FRAME_DURATION_MS"))?,

            buffer_capacity: parse("BUFFER_CAPACITY", env!("BUFFER_CAPACITY"))?,
            overflow_policy: env!("BUFFER_OVERFLOW_POLICY"),
            push_timeout_ms: parse("BUFFER_PUSH_TIMEOUT_MS", env!("BUFFER_PUSH_TIMEOUT_MS"))?,
            playback_wait_ms: parse("BUFFER_PLAYBACK_WAIT_MS", env!("BUFFER_PLAYBACK_WAIT_MS"))?,
            downlink_backlog_ms: parse(
                "BUFFER_DOWNLINK_BACKLOG_MS",
                env!("BUFFER_DOWNLINK_BACKLOG_MS"),
            )?,

            wire_codec: env!("WIRE_CODEC"),
            wire_framing: env!("WIRE_FRAMING"),
            uplink_sample_rate: parse("WIRE_UPLINK_SAMPLE_RATE", env!("WIRE_UPLINK_SAMPLE_RATE"))?,
            downlink_sample_rate: parse(
                "WIRE_DOWNLINK_SAMPLE_RATE",
                env!("WIRE_DOWNLINK_SAMPLE_RATE"),
            )?,
            wire_channels: parse("WIRE_CHANNELS", env!("WIRE_CHANNELS"))?,
            opus_bitrate: parse("WIRE_OPUS_BITRATE", env!("WIRE_OPUS_BITRATE"))?,

            ws_url: env!("WS_URL"),
            ws_token: env!("WS_TOKEN"),
            token_env: env!("WS_TOKEN_ENV"),
            auth_scheme: env!("WS_AUTH_SCHEME"),

            reconnect_ceiling: parse(
                "TRANSPORT_RECONNECT_CEILING",
                env!("TRANSPORT_RECONNECT_CEILING"),
            )?,
            backoff_initial_ms: parse(
                "TRANSPORT_BACKOFF_INITIAL_MS",
                env!("TRANSPORT_BACKOFF_INITIAL_MS"),
            )?,
            backoff_max_ms: parse("TRANSPORT_BACKOFF_MAX_MS", env!("TRANSPORT_BACKOFF_MAX_MS"))?,
            queue_depth: parse("TRANSPORT_QUEUE_DEPTH", env!("TRANSPORT_QUEUE_DEPTH"))?,
            close_timeout_ms: parse(
                "TRANSPORT_CLOSE_TIMEOUT_MS",
                env!("TRANSPORT_CLOSE_TIMEOUT_MS"),
            )?,

            drain_timeout_ms: parse("SESSION_DRAIN_TIMEOUT_MS", env!("SESSION_DRAIN_TIMEOUT_MS"))?,
            expected_latency_ms: parse(
                "SESSION_EXPECTED_LATENCY_MS",
                env!("SESSION_EXPECTED_LATENCY_MS"),
            )?,
        })
    }

    /// Token for the websocket endpoint: the runtime environment variable
    /// named by `token_env` wins over the compiled-in value.
    pub fn resolve_token(&self) -> Option<String> {
        if !self.token_env.is_empty() {
            if let Ok(token) = std::env::var(self.token_env) {
                if !token.trim().is_empty() {
                    return Some(token.trim().to_string());
                }
            }
        }
        if self.ws_token.is_empty() {
            None
        } else {
            Some(self.ws_token.to_string())
        }
    }

    /// Build and validate the configuration consumed by the session core.
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let frame_size = (self.sample_rate as u64 * self.frame_duration_ms as u64 / 1000) as usize;

        let policy = match self.overflow_policy {
            "drop_oldest" => OverflowPolicy::DropOldest,
            "block" => OverflowPolicy::Block {
                timeout: Duration::from_millis(self.push_timeout_ms),
            },
            other => {
                return Err(ConfigError::Invalid {
                    key: "buffer.overflow_policy",
                    reason: format!("unknown policy `{}`", other),
                });
            }
        };

        let cfg = SessionConfig {
            stream: StreamConfig {
                sample_rate: self.sample_rate,
                channels: self.channels,
                frame_size,
                input_device: self.capture_device.to_string(),
                output_device: self.playback_device.to_string(),
            },
            buffer: BufferConfig {
                capacity: self.buffer_capacity,
                policy,
                playback_wait: Duration::from_millis(self.playback_wait_ms),
                backlog: Duration::from_millis(self.downlink_backlog_ms),
            },
            wire: WireConfig {
                codec: self.wire_codec.parse()?,
                framing: self.wire_framing.parse()?,
                uplink_sample_rate: self.uplink_sample_rate,
                downlink_sample_rate: self.downlink_sample_rate,
                channels: self.wire_channels,
                opus_bitrate: self.opus_bitrate,
            },
            transport: TransportConfig {
                reconnect_ceiling: self.reconnect_ceiling,
                backoff_initial: Duration::from_millis(self.backoff_initial_ms),
                backoff_max: Duration::from_millis(self.backoff_max_ms),
                queue_depth: self.queue_depth,
                close_timeout: Duration::from_millis(self.close_timeout_ms),
            },
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            expected_latency: Duration::from_millis(self.expected_latency_ms),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

// ======================== Session configuration ========================

/// Device-side stream parameters. Fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel delivered by one hardware callback.
    pub frame_size: usize,
    pub input_device: String,
    pub output_device: String,
}

impl StreamConfig {
    /// Interleaved samples in one frame.
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size * self.channels as usize
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_micros(self.frame_size as u64 * 1_000_000 / self.sample_rate.max(1) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Discard the oldest queued frame and count a drop.
    DropOldest,
    /// Stall the producer up to `timeout`, then fail with `BufferTimeout`.
    Block { timeout: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    pub capacity: usize,
    /// Policy of the playback ring (pipeline → speaker). The capture ring is
    /// fed from a hardware context and always drops the oldest frame.
    pub policy: OverflowPolicy,
    /// How long a playback callback may wait for a frame before rendering silence.
    pub playback_wait: Duration,
    /// Return audio the pipeline holds back while the playback ring is full.
    /// Beyond this it stops reading the inbound queue.
    pub backlog: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Pcm,
    Opus,
}

impl std::str::FromStr for CodecKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pcm" | "linear16" => Ok(Self::Pcm),
            "opus" => Ok(Self::Opus),
            other => Err(ConfigError::Invalid {
                key: "wire.codec",
                reason: format!("unsupported codec `{}`", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Every binary message carries a sequence/timestamp header.
    Framed,
    /// Bare payload; sequence numbers are assigned on arrival.
    Raw,
}

impl std::str::FromStr for Framing {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "framed" => Ok(Self::Framed),
            "raw" => Ok(Self::Raw),
            other => Err(ConfigError::Invalid {
                key: "wire.framing",
                reason: format!("unknown framing `{}`", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireConfig {
    pub codec: CodecKind,
    pub framing: Framing,
    pub uplink_sample_rate: u32,
    pub downlink_sample_rate: u32,
    pub channels: u16,
    pub opus_bitrate: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Consecutive failed connection attempts before `TransportFatal`.
    pub reconnect_ceiling: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Depth of the outbound and inbound queues between pipeline and link.
    pub queue_depth: usize,
    pub close_timeout: Duration,
}

/// Everything the core needs, already validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub stream: StreamConfig,
    pub buffer: BufferConfig,
    pub wire: WireConfig,
    pub transport: TransportConfig,
    pub drain_timeout: Duration,
    /// Expected processing latency, used to sanity check the ring capacity.
    pub expected_latency: Duration,
}

impl Default for SessionConfig {
    /// 48 kHz mono, 20 ms frames, PCM framed loopback-friendly defaults.
    fn default() -> Self {
        Self {
            stream: StreamConfig {
                sample_rate: 48_000,
                channels: 1,
                frame_size: 960,
                input_device: "default".to_string(),
                output_device: "default".to_string(),
            },
            buffer: BufferConfig {
                capacity: 4,
                policy: OverflowPolicy::DropOldest,
                playback_wait: Duration::from_millis(2),
                backlog: Duration::from_secs(10),
            },
            wire: WireConfig {
                codec: CodecKind::Pcm,
                framing: Framing::Framed,
                uplink_sample_rate: 48_000,
                downlink_sample_rate: 48_000,
                channels: 1,
                opus_bitrate: 32_000,
            },
            transport: TransportConfig {
                reconnect_ceiling: 8,
                backoff_initial: Duration::from_millis(100),
                backoff_max: Duration::from_secs(5),
                queue_depth: 32,
                close_timeout: Duration::from_secs(5),
            },
            drain_timeout: Duration::from_secs(2),
            expected_latency: Duration::from_millis(20),
        }
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

/// Frame lengths Opus accepts, in microseconds.
const OPUS_FRAME_US: [u64; 6] = [2_500, 5_000, 10_000, 20_000, 40_000, 60_000];

impl SessionConfig {
    /// Samples per channel in one uplink wire frame.
    pub fn uplink_frame_size(&self) -> usize {
        self.wire_frame_size(self.wire.uplink_sample_rate)
    }

    /// Samples per channel in one frame's worth of downlink audio.
    pub fn downlink_frame_size(&self) -> usize {
        self.wire_frame_size(self.wire.downlink_sample_rate)
    }

    fn wire_frame_size(&self, rate: u32) -> usize {
        let s = &self.stream;
        ((s.frame_size as u64 * rate as u64 / s.sample_rate.max(1) as u64) as usize).max(1)
    }

    /// Interleaved device-rate samples the downlink backlog may hold.
    pub fn backlog_samples(&self) -> usize {
        let s = &self.stream;
        let frames = s.sample_rate as u128 * self.buffer.backlog.as_micros() / 1_000_000;
        frames as usize * s.channels as usize
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.stream;
        if s.sample_rate == 0 {
            return Err(invalid("audio.sample_rate", "must be positive"));
        }
        if !(1..=2).contains(&s.channels) {
            return Err(invalid("audio.channels", "only mono and stereo are supported"));
        }
        if s.frame_size == 0 {
            return Err(invalid("audio.frame_duration_ms", "frame size must be positive"));
        }
        if self.buffer.capacity == 0 {
            return Err(invalid("buffer.capacity", "must be at least 1"));
        }
        if self.buffer.backlog < s.frame_duration() {
            return Err(invalid(
                "buffer.downlink_backlog_ms",
                "must hold at least one frame",
            ));
        }
        let w = &self.wire;
        if w.uplink_sample_rate == 0 || w.downlink_sample_rate == 0 {
            return Err(invalid("wire.sample_rate", "must be positive"));
        }
        if !(1..=2).contains(&w.channels) {
            return Err(invalid("wire.channels", "only mono and stereo are supported"));
        }
        if w.codec == CodecKind::Opus
            && ![8_000, 12_000, 16_000, 24_000, 48_000].contains(&w.uplink_sample_rate)
        {
            return Err(invalid("wire.uplink_sample_rate", "not an opus rate"));
        }
        if w.codec == CodecKind::Opus {
            let micros = s.frame_size as u64 * 1_000_000;
            let exact = micros % s.sample_rate as u64 == 0;
            if !exact || !OPUS_FRAME_US.contains(&(micros / s.sample_rate as u64)) {
                return Err(invalid(
                    "audio.frame_duration_ms",
                    "opus frames must be 2.5, 5, 10, 20, 40 or 60 ms",
                ));
            }
        }
        let t = &self.transport;
        if t.reconnect_ceiling == 0 {
            return Err(invalid("transport.reconnect_ceiling", "must be at least 1"));
        }
        if t.backoff_initial.is_zero() || t.backoff_initial > t.backoff_max {
            return Err(invalid(
                "transport.backoff_initial_ms",
                "must be positive and not above backoff_max_ms",
            ));
        }
        if t.queue_depth == 0 {
            return Err(invalid("transport.queue_depth", "must be at least 1"));
        }

        // capacity × frame_duration should cover twice the pipeline latency
        let window = s.frame_duration() * self.buffer.capacity as u32;
        if window < self.expected_latency * 2 {
            log::warn!(
                "Ring window {:?} is below 2x expected latency {:?}; expect audible gaps",
                window,
                self.expected_latency
            );
        }
        Ok(())
    }
}
