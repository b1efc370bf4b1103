//! 结构化日志模块
//!
//! 基于 tracing 的结构化日志，支持动态调整级别和按天滚动的文件输出。

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use crate::config::{Config, LoggingConfig};
use crate::error::{ObservabilityError, Result};

/// 日志级别重新加载句柄类型
type ReloadHandle = Handle<EnvFilter, Registry>;

/// 日志管理器
pub struct LogManager {
    /// 配置
    config: LoggingConfig,

    /// 过滤器重新加载句柄
    reload_handle: Option<ReloadHandle>,

    /// 文件输出的后台写线程，drop 时刷盘
    _file_guard: Option<WorkerGuard>,
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager")
            .field("config", &self.config)
            .field("initialized", &self.reload_handle.is_some())
            .finish()
    }
}

impl LogManager {
    /// 创建并安装全局日志订阅者
    pub fn new(config: &Config) -> Result<Self> {
        let mut manager = Self {
            config: config.logging.clone(),
            reload_handle: None,
            _file_guard: None,
        };

        manager.init()?;

        Ok(manager)
    }

    fn init(&mut self) -> Result<()> {
        let filter = self.build_filter(&self.config.level)?;
        let (filter, reload_handle) = reload::Layer::new(filter);

        let (file_layer, guard) = match self.config.file_path.as_deref() {
            Some(path) => {
                let (dir, file_name) = split_log_path(path)?;
                std::fs::create_dir_all(dir)?;
                let appender = tracing_appender::rolling::daily(dir, file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        let registry = tracing_subscriber::registry().with(filter).with(file_layer);

        let installed = if self.config.json_format {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(self.config.include_target)
                .with_line_number(self.config.include_line_number)
                .with_ansi(false);
            registry.with(layer).try_init()
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_target(self.config.include_target)
                .with_line_number(self.config.include_line_number)
                .with_ansi(self.config.ansi_colors);
            registry.with(layer).try_init()
        };

        installed.map_err(|e| {
            ObservabilityError::logging(format!("Failed to install subscriber: {}", e))
        })?;

        self.reload_handle = Some(reload_handle);
        self._file_guard = guard;

        tracing::info!(
            target: "lumen_observability",
            "Log manager initialized with level: {}",
            self.config.level
        );

        Ok(())
    }

    /// 构建环境过滤器
    fn build_filter(&self, level: &str) -> Result<EnvFilter> {
        let mut filter = EnvFilter::try_new(level)
            .map_err(|e| ObservabilityError::logging(format!("Invalid log level: {}", e)))?;

        for (module, level) in &self.config.module_levels {
            filter = filter.add_directive(
                format!("{}={}", module, level)
                    .parse()
                    .map_err(|e| ObservabilityError::logging(format!("Invalid directive: {}", e)))?,
            );
        }

        Ok(filter)
    }

    /// 动态更新日志级别
    pub fn update_level(&mut self, level: &str) -> Result<()> {
        let new_filter = self.build_filter(level)?;

        let handle = self
            .reload_handle
            .as_ref()
            .ok_or_else(|| ObservabilityError::logging("Log manager not initialized"))?;

        handle
            .modify(|filter| *filter = new_filter)
            .map_err(|e| ObservabilityError::logging(format!("Failed to update log level: {}", e)))?;

        self.config.level = level.to_string();

        tracing::info!(
            target: "lumen_observability",
            "Log level updated to: {}",
            level
        );

        Ok(())
    }

    /// 获取当前配置
    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }
}

fn split_log_path(path: &Path) -> Result<(&Path, &std::ffi::OsStr)> {
    let file_name = path
        .file_name()
        .ok_or_else(|| ObservabilityError::logging(format!("Invalid log file path: {:?}", path)))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok((dir, file_name))
}

/// 连接级别的 span
pub fn connection_span(cid: i64, channel: &str, network: &str) -> tracing::Span {
    tracing::info_span!(
        "connection",
        cid = cid,
        channel = %channel,
        network = %network,
    )
}

/// 消息投递 span
pub fn message_span(event: &str, record_id: Option<i64>) -> tracing::Span {
    match record_id {
        Some(record_id) => tracing::info_span!("message", event = %event, record_id = record_id),
        None => tracing::info_span!("message", event = %event),
    }
}
