use std::sync::Arc;

use clap::Parser;
use lumen_config::{Config, ConfigManager, LogLevel};
use lumen_observability::Observability;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod auth;
mod handler;
mod server;

use server::run_server;

#[derive(Parser, Debug, Clone)]
#[command(name = "lumen-server")]
#[command(about = "Lumen IM Gateway")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(long, env = "DEBUG", default_value = "false")]
    debug: bool,

    /// Config file path
    #[arg(long, env = "LUMEN_CONFIG", default_value = "~/.lumen/config.json")]
    config: String,

    /// Process identity (overrides config)
    #[arg(long, env = "LUMEN_SERVER_ID")]
    server_id: Option<String>,

    /// WebSocket bind address (overrides config)
    #[arg(long, env = "LUMEN_WS_BIND")]
    ws_bind: Option<String>,

    /// TCP bind address (overrides config)
    #[arg(long, env = "LUMEN_TCP_BIND")]
    tcp_bind: Option<String>,

    /// Redis URL (overrides config)
    #[arg(long, env = "LUMEN_REDIS_URL")]
    redis_url: Option<String>,

    /// Log level (overrides config)
    #[arg(long, env = "LUMEN_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// CLI 参数覆盖配置文件
    fn apply(&self, config: &mut Config) -> anyhow::Result<()> {
        if let Some(sid) = &self.server_id {
            config.server.server_id = Some(sid.clone());
        }
        if let Some(bind) = &self.ws_bind {
            config.server.websocket_bind = bind.clone();
        }
        if let Some(bind) = &self.tcp_bind {
            config.server.tcp_bind = Some(bind.clone());
        }
        if let Some(url) = &self.redis_url {
            config.store.redis_url = Some(url.clone());
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.parse()?;
        } else if self.debug {
            config.logging.level = LogLevel::Debug;
        }
        config.validate()?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = lumen_config::expand_tilde(&cli.config)
        .unwrap_or_else(|| std::path::PathBuf::from(&cli.config));
    let manager = ConfigManager::load(&config_path).await?;
    let mut config = manager.snapshot().await;
    cli.apply(&mut config)?;

    let observability = Arc::new(Observability::init(lumen_observability::Config::from(&config))?);
    if let Some(addr) = observability.health_server().start().await? {
        info!("Health endpoints on http://{}", addr);
    }

    let sid = config
        .server
        .server_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    info!(sid = %sid, config = ?config_path, "Starting Lumen gateway");

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });
    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(
        manager,
        Arc::clone(&observability),
        cancel.clone(),
    ));

    let result = run_server(config, sid, &observability, cancel).await;

    if let Err(e) = observability.shutdown().await {
        warn!("Observability shutdown failed: {}", e);
    }
    result
}

/// SIGHUP 时重新加载配置文件，目前只有日志级别可以热更新
#[cfg(unix)]
async fn reload_on_hangup(
    manager: ConfigManager,
    observability: Arc<Observability>,
    cancel: CancellationToken,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("Failed to register SIGHUP: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = hangup.recv() => {}
        }
        if let Err(e) = manager.reload().await {
            warn!("Config reload failed, keeping current config: {}", e);
            continue;
        }
        let level = manager.snapshot().await.logging.level;
        match observability.update_log_level(level.as_str()) {
            Ok(()) => info!(level = level.as_str(), "Config reloaded"),
            Err(e) => warn!("Failed to apply log level: {}", e),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
