use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    application: Application,
    audio: Audio,
    buffer: Buffer,
    wire: Wire,
    network: Network,
    transport: Transport,
    session: Session,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    sample_rate: u32,
    channels: u16,
    frame_duration_ms: u32,
}

#[derive(Deserialize)]
struct Buffer {
    capacity: usize,
    overflow_policy: String,
    push_timeout_ms: u64,
    playback_wait_ms: u64,
    downlink_backlog_ms: u64,
}

#[derive(Deserialize)]
struct Wire {
    codec: String,
    framing: String,
    uplink_sample_rate: u32,
    downlink_sample_rate: u32,
    channels: u16,
    opus_bitrate: i32,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
    ws_token: String,
    token_env: String,
    auth_scheme: String,
}

#[derive(Deserialize)]
struct Transport {
    reconnect_ceiling: u32,
    backoff_initial_ms: u64,
    backoff_max_ms: u64,
    queue_depth: usize,
    close_timeout_ms: u64,
}

#[derive(Deserialize)]
struct Session {
    drain_timeout_ms: u64,
    expected_latency_ms: u64,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 音频设备配置
    println!("cargo:rustc-env=AUDIO_CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=AUDIO_SAMPLE_RATE={}", config.audio.sample_rate);
    println!("cargo:rustc-env=AUDIO_CHANNELS={}", config.audio.channels);
    println!("cargo:rustc-env=AUDIO_FRAME_DURATION_MS={}", config.audio.frame_duration_ms);

    // 环形缓冲区配置
    println!("cargo:rustc-env=BUFFER_CAPACITY={}", config.buffer.capacity);
    println!("cargo:rustc-env=BUFFER_OVERFLOW_POLICY={}", config.buffer.overflow_policy);
    println!("cargo:rustc-env=BUFFER_PUSH_TIMEOUT_MS={}", config.buffer.push_timeout_ms);
    println!("cargo:rustc-env=BUFFER_PLAYBACK_WAIT_MS={}", config.buffer.playback_wait_ms);
    println!("cargo:rustc-env=BUFFER_DOWNLINK_BACKLOG_MS={}", config.buffer.downlink_backlog_ms);

    // 线路格式
    println!("cargo:rustc-env=WIRE_CODEC={}", config.wire.codec);
    println!("cargo:rustc-env=WIRE_FRAMING={}", config.wire.framing);
    println!("cargo:rustc-env=WIRE_UPLINK_SAMPLE_RATE={}", config.wire.uplink_sample_rate);
    println!("cargo:rustc-env=WIRE_DOWNLINK_SAMPLE_RATE={}", config.wire.downlink_sample_rate);
    println!("cargo:rustc-env=WIRE_CHANNELS={}", config.wire.channels);
    println!("cargo:rustc-env=WIRE_OPUS_BITRATE={}", config.wire.opus_bitrate);

    // 网络配置
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=WS_TOKEN={}", config.network.ws_token);
    println!("cargo:rustc-env=WS_TOKEN_ENV={}", config.network.token_env);
    println!("cargo:rustc-env=WS_AUTH_SCHEME={}", config.network.auth_scheme);

    // 重连与队列
    println!("cargo:rustc-env=TRANSPORT_RECONNECT_CEILING={}", config.transport.reconnect_ceiling);
    println!("cargo:rustc-env=TRANSPORT_BACKOFF_INITIAL_MS={}", config.transport.backoff_initial_ms);
    println!("cargo:rustc-env=TRANSPORT_BACKOFF_MAX_MS={}", config.transport.backoff_max_ms);
    println!("cargo:rustc-env=TRANSPORT_QUEUE_DEPTH={}", config.transport.queue_depth);
    println!("cargo:rustc-env=TRANSPORT_CLOSE_TIMEOUT_MS={}", config.transport.close_timeout_ms);

    // 会话
    println!("cargo:rustc-env=SESSION_DRAIN_TIMEOUT_MS={}", config.session.drain_timeout_ms);
    println!("cargo:rustc-env=SESSION_EXPECTED_LATENCY_MS={}", config.session.expected_latency_ms);
}
