//! 健康检查模块
//!
//! 提供健康检查端点：
//! - /health - 汇总所有注册的检查项
//! - /ready - 就绪检查（监听器绑定完成后置为就绪）
//! - /live - 存活检查
//! - /metrics - Prometheus 格式指标

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{Config, HealthConfig};
use crate::error::{ObservabilityError, Result};
use crate::metrics::MetricsCollector;

/// 健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// 健康
    #[default]
    Healthy,
    /// 不健康
    Unhealthy,
    /// 降级
    Degraded,
}

impl HealthStatus {
    /// 转换为 HTTP 状态码
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            HealthStatus::Healthy => StatusCode::OK,
            HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// 检查是否健康
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// 健康检查结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// 检查名称
    pub name: String,
    /// 状态
    pub status: HealthStatus,
    /// 消息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// 响应时间（毫秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    /// 额外元数据
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl HealthCheckResult {
    /// 健康
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            response_time_ms: None,
            metadata: None,
        }
    }

    /// 不健康，附带原因
    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            response_time_ms: None,
            metadata: None,
        }
    }

    /// 附加元数据
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// 整体健康响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// 整体状态
    pub status: HealthStatus,
    /// 应用名称
    pub app_name: String,
    /// 版本
    pub version: String,
    /// 运行时间（秒）
    pub uptime_seconds: u64,
    /// 时间戳
    pub timestamp: String,
    /// 各检查项结果
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks: Option<Vec<HealthCheckResult>>,
}

/// 就绪检查响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyResponse {
    /// 是否就绪
    pub ready: bool,
    /// 时间戳
    pub timestamp: String,
}

/// 健康检查 trait
#[async_trait::async_trait]
pub trait HealthCheck: Send + Sync {
    /// 执行检查
    async fn check(&self) -> HealthCheckResult;

    /// 获取检查名称
    fn name(&self) -> &str;
}

/// 简单的函数式健康检查
pub struct FnHealthCheck<F> {
    name: String,
    check_fn: F,
}

impl<F, Fut> FnHealthCheck<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HealthCheckResult> + Send + 'static,
{
    /// 创建新的函数式健康检查
    pub fn new(name: impl Into<String>, check_fn: F) -> Self {
        Self {
            name: name.into(),
            check_fn,
        }
    }
}

#[async_trait::async_trait]
impl<F, Fut> HealthCheck for FnHealthCheck<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HealthCheckResult> + Send + 'static,
{
    async fn check(&self) -> HealthCheckResult {
        (self.check_fn)().await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

type Checks = Arc<RwLock<Vec<Arc<dyn HealthCheck>>>>;

#[derive(Clone)]
struct AppState {
    metrics: Arc<MetricsCollector>,
    checks: Checks,
    ready: Arc<AtomicBool>,
    app_name: String,
    version: String,
    start_time: Instant,
    check_timeout: Duration,
}

/// 健康检查服务器
pub struct HealthServer {
    config: HealthConfig,
    state: AppState,
    shutdown_tx: broadcast::Sender<()>,
    server_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for HealthServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthServer")
            .field("config", &self.config)
            .field("checks", &self.state.checks.read().len())
            .finish()
    }
}

impl HealthServer {
    /// 创建新的健康检查服务器
    pub fn new(config: &Config, metrics: Arc<MetricsCollector>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config: config.health.clone(),
            state: AppState {
                metrics,
                checks: Arc::new(RwLock::new(Vec::new())),
                ready: Arc::new(AtomicBool::new(false)),
                app_name: config.app_name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                start_time: Instant::now(),
                check_timeout: Duration::from_secs(config.health.timeout_seconds.max(1)),
            },
            shutdown_tx,
            server_handle: Mutex::new(None),
        }
    }

    /// 注册健康检查
    pub fn register<C>(&self, check: C)
    where
        C: HealthCheck + 'static,
    {
        let name = check.name().to_string();
        self.state.checks.write().push(Arc::new(check));

        tracing::info!(
            target: "lumen_observability",
            "Health check '{}' registered",
            name
        );
    }

    /// 设置就绪状态
    pub fn set_ready(&self, ready: bool) {
        self.state.ready.store(ready, Ordering::SeqCst);
    }

    /// 启动健康检查服务器，返回实际监听地址
    pub async fn start(&self) -> Result<Option<SocketAddr>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let addr: SocketAddr = self
            .config
            .bind
            .parse()
            .map_err(|e| ObservabilityError::health(format!("Invalid address: {}", e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ObservabilityError::health(format!("Failed to bind: {}", e)))?;
        let local_addr = listener.local_addr()?;

        tracing::info!(
            target: "lumen_observability",
            "Health server starting on http://{}",
            local_addr
        );

        let app = self.router();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            });
            if let Err(e) = server.await {
                tracing::error!(target: "lumen_observability", "Health server error: {}", e);
            }
        });

        *self.server_handle.lock() = Some(handle);

        Ok(Some(local_addr))
    }

    /// 构建路由
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/live", get(live_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(Arc::new(self.state.clone()))
    }

    /// 关闭服务器
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(());

        let handle = self.server_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
            tracing::info!(target: "lumen_observability", "Health server stopped");
        }

        Ok(())
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let checks: Vec<Arc<dyn HealthCheck>> = state.checks.read().clone();

    let mut results = Vec::with_capacity(checks.len());
    let mut overall_status = HealthStatus::Healthy;

    for check in checks {
        let started = Instant::now();
        let mut result = match tokio::time::timeout(state.check_timeout, check.check()).await {
            Ok(result) => result,
            Err(_) => HealthCheckResult::unhealthy(check.name(), "check timed out"),
        };
        result.response_time_ms = Some(started.elapsed().as_millis() as u64);

        match result.status {
            HealthStatus::Unhealthy => overall_status = HealthStatus::Unhealthy,
            HealthStatus::Degraded if overall_status == HealthStatus::Healthy => {
                overall_status = HealthStatus::Degraded;
            }
            _ => {}
        }

        results.push(result);
    }

    let response = HealthResponse {
        status: overall_status,
        app_name: state.app_name.clone(),
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        checks: if results.is_empty() { None } else { Some(results) },
    };

    (overall_status.to_status_code(), Json(response))
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ready = state.ready.load(Ordering::SeqCst);
    let response = ReadyResponse {
        ready,
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(response))
}

async fn live_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn server() -> HealthServer {
        HealthServer::new(&Config::default(), Arc::new(MetricsCollector::disabled()))
    }

    async fn get_status(router: Router, path: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[test]
    fn test_health_status() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(HealthStatus::Degraded.is_healthy());
        assert!(!HealthStatus::Unhealthy.is_healthy());

        assert_eq!(HealthStatus::Healthy.to_status_code(), StatusCode::OK);
        assert_eq!(
            HealthStatus::Unhealthy.to_status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_health_aggregates_checks() {
        let server = server();
        let (status, body) = get_status(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        server.register(FnHealthCheck::new("store", || async {
            HealthCheckResult::unhealthy("store", "connection refused")
        }));
        let (status, body) = get_status(server.router(), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["checks"][0]["name"], "store");
    }

    #[tokio::test]
    async fn test_ready_follows_flag() {
        let server = server();
        let (status, _) = get_status(server.router(), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        server.set_ready(true);
        let (status, body) = get_status(server.router(), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let config = Config::default().with_health_bind("127.0.0.1:0");
        let server = HealthServer::new(&config, Arc::new(MetricsCollector::disabled()));
        let addr = server.start().await.unwrap();
        assert!(addr.is_some());
        server.shutdown().await.unwrap();

        let disabled = HealthServer::new(
            &Config::default().with_health_enabled(false),
            Arc::new(MetricsCollector::disabled()),
        );
        assert!(disabled.start().await.unwrap().is_none());
    }
}
