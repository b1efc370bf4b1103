//! Lumen Observability Infrastructure
//!
//! 提供统一的日志、指标和健康检查功能。

pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod metrics;

pub use crate::config::Config;
pub use crate::error::{ObservabilityError, Result};
pub use crate::health::{FnHealthCheck, HealthCheck, HealthCheckResult, HealthServer, HealthStatus};
pub use crate::logging::LogManager;
pub use crate::metrics::{
    AckMetrics, ConnectionMetrics, FanoutMetrics, MetricsCollector, SequenceMetrics,
};

use parking_lot::RwLock;
use std::sync::Arc;

/// 统一的观测性句柄
#[derive(Debug)]
pub struct Observability {
    log_manager: Arc<RwLock<LogManager>>,
    metrics: Arc<MetricsCollector>,
    health_server: Arc<HealthServer>,
    config: Config,
}

impl Observability {
    /// 初始化观测性基础设施：全局日志订阅者、指标 recorder 和健康检查服务器
    pub fn init(config: Config) -> Result<Self> {
        let log_manager = Arc::new(RwLock::new(LogManager::new(&config)?));
        let metrics = Arc::new(MetricsCollector::new(&config)?);
        let health_server = Arc::new(HealthServer::new(&config, Arc::clone(&metrics)));

        tracing::info!(
            target: "lumen_observability",
            "Observability infrastructure initialized"
        );

        Ok(Self {
            log_manager,
            metrics,
            health_server,
            config,
        })
    }

    /// 获取指标收集器
    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    /// 获取健康检查服务器
    pub fn health_server(&self) -> Arc<HealthServer> {
        Arc::clone(&self.health_server)
    }

    /// 获取配置
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 动态更新日志级别
    pub fn update_log_level(&self, level: &str) -> Result<()> {
        self.log_manager.write().update_level(level)
    }

    /// 优雅关闭
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!(
            target: "lumen_observability",
            "Shutting down observability infrastructure"
        );
        self.health_server.shutdown().await
    }
}

/// 便捷导入模块
pub mod prelude {
    pub use crate::{Config, Observability, Result};

    pub use tracing::{debug, error, info, instrument, trace, warn, Span};

    pub use ::metrics::{counter, gauge, histogram};
}
