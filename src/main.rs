use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;

use voice_agent::device::alsa_device::AlsaBackend;
use voice_agent::transport::ws::WsConnector;
use voice_agent::{Config, Session, SessionState};

/// 统计信息打印间隔
const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new().context("failed to load build-time config")?;
    let session_config = config.session_config()?;
    log::info!("{} {} starting", config.app_name, config.app_version);

    // 鉴权 token：运行时环境变量优先
    let token = config.resolve_token();
    if token.is_none() {
        log::warn!(
            "No API token configured (set {} or network.ws_token)",
            config.token_env
        );
    }
    let connector = WsConnector::new(config.ws_url, token, config.auth_scheme)?;

    let session = Session::new(
        session_config,
        Arc::new(AlsaBackend::new()),
        Arc::new(connector),
    )?;
    session.start().await?;

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;

    let final_state = loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                if let Err(e) = session.stop().await {
                    log::error!("Stop failed: {}", e);
                }
                break session.state();
            }
            state = session.wait_terminal() => break state,
            _ = ticker.tick() => {
                match serde_json::to_string(&session.stats()) {
                    Ok(json) => log::info!("stats {}", json),
                    Err(e) => log::debug!("stats unavailable: {}", e),
                }
            }
        }
    };

    log::info!("Final stats: {:?}", session.stats());
    if final_state == SessionState::Failed {
        anyhow::bail!(
            "session failed: {}",
            session.failure().unwrap_or_else(|| "unknown cause".to_string())
        );
    }
    Ok(())
}
