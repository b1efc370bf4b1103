//! 指标收集模块
//!
//! 基于 metrics 库的指标收集；网关各组件通过下面的记录器上报，
//! 未安装 recorder 时这些调用都是空操作。

use ::metrics::{describe_counter, describe_gauge, Unit};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::{Config, MetricsConfig};
#[cfg(feature = "prometheus")]
use crate::error::ObservabilityError;
use crate::error::Result;

/// 指标名称
pub mod names {
    /// 累计建立的连接
    pub const CONNECTIONS_OPENED: &str = "lumen_connections_opened_total";
    /// 累计关闭的连接
    pub const CONNECTIONS_CLOSED: &str = "lumen_connections_closed_total";
    /// 当前活跃连接
    pub const CONNECTIONS_ACTIVE: &str = "lumen_connections_active";
    /// 心跳超时被踢下线的连接
    pub const HEARTBEAT_TIMEOUTS: &str = "lumen_heartbeat_timeouts_total";
    /// 因队列满被丢弃的出站消息
    pub const QUEUE_DROPPED: &str = "lumen_outbound_dropped_total";
    /// 注册到 ack 缓冲区的消息
    pub const ACK_REGISTERED: &str = "lumen_ack_registered_total";
    /// 收到客户端确认的消息
    pub const ACK_ACKNOWLEDGED: &str = "lumen_ack_acknowledged_total";
    /// 重发次数
    pub const ACK_RESENT: &str = "lumen_ack_resent_total";
    /// 超过重试上限或客户端已离线而丢弃
    pub const ACK_DROPPED: &str = "lumen_ack_dropped_total";
    /// 当前待确认的消息数
    pub const ACK_PENDING: &str = "lumen_ack_pending";
    /// 全局广播次数
    pub const FANOUT_GLOBAL: &str = "lumen_fanout_global_total";
    /// 定向投递次数
    pub const FANOUT_TARGETED: &str = "lumen_fanout_targeted_total";
    /// 发布失败次数
    pub const FANOUT_FAILURES: &str = "lumen_fanout_failures_total";
    /// 本进程推送给客户端的事件数
    pub const FANOUT_DELIVERED: &str = "lumen_fanout_delivered_total";
    /// 分配的序列号数量
    pub const SEQUENCE_ALLOCATED: &str = "lumen_sequence_allocated_total";
    /// 序列号分配失败
    pub const SEQUENCE_ERRORS: &str = "lumen_sequence_errors_total";
}

/// 指标收集器
pub struct MetricsCollector {
    /// Prometheus 句柄
    #[cfg(feature = "prometheus")]
    handle: Option<PrometheusHandle>,

    /// 配置
    config: MetricsConfig,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("config", &self.config)
            .finish()
    }
}

impl MetricsCollector {
    /// 创建新的指标收集器并安装全局 recorder
    pub fn new(config: &Config) -> Result<Self> {
        let mut collector = Self {
            #[cfg(feature = "prometheus")]
            handle: None,
            config: config.metrics.clone(),
        };

        collector.init()?;

        Ok(collector)
    }

    /// 不安装全局 recorder 的收集器，render 返回空字符串
    pub fn disabled() -> Self {
        Self {
            #[cfg(feature = "prometheus")]
            handle: None,
            config: MetricsConfig {
                enabled: false,
                prometheus_enabled: false,
            },
        }
    }

    fn init(&mut self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        #[cfg(feature = "prometheus")]
        if self.config.prometheus_enabled {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();

            ::metrics::set_global_recorder(recorder).map_err(|e| {
                ObservabilityError::metrics(format!("Failed to set global recorder: {}", e))
            })?;

            self.handle = Some(handle);
        }

        register_descriptions();

        tracing::info!(
            target: "lumen_observability",
            "Metrics collector initialized"
        );

        Ok(())
    }

    /// 获取 Prometheus 格式的指标
    pub fn render(&self) -> String {
        #[cfg(feature = "prometheus")]
        {
            self.handle.as_ref().map(|h| h.render()).unwrap_or_default()
        }
        #[cfg(not(feature = "prometheus"))]
        {
            String::new()
        }
    }
}

fn register_descriptions() {
    describe_counter!(names::CONNECTIONS_OPENED, Unit::Count, "Total accepted client connections");
    describe_counter!(names::CONNECTIONS_CLOSED, Unit::Count, "Total closed client connections");
    describe_gauge!(names::CONNECTIONS_ACTIVE, Unit::Count, "Currently open client connections");
    describe_counter!(
        names::HEARTBEAT_TIMEOUTS,
        Unit::Count,
        "Clients closed by the health monitor"
    );
    describe_counter!(names::QUEUE_DROPPED, Unit::Count, "Outbound messages evicted from a full queue");
    describe_counter!(names::ACK_REGISTERED, Unit::Count, "Messages awaiting client acknowledgment");
    describe_counter!(names::ACK_ACKNOWLEDGED, Unit::Count, "Messages acknowledged by clients");
    describe_counter!(names::ACK_RESENT, Unit::Count, "Unacknowledged messages resent");
    describe_counter!(names::ACK_DROPPED, Unit::Count, "Unacknowledged messages given up on");
    describe_gauge!(names::ACK_PENDING, Unit::Count, "Entries in the ack buffer");
    describe_counter!(names::FANOUT_GLOBAL, Unit::Count, "Events published to the global topic");
    describe_counter!(names::FANOUT_TARGETED, Unit::Count, "Events published to per-server topics");
    describe_counter!(names::FANOUT_FAILURES, Unit::Count, "Failed topic publishes");
    describe_counter!(names::FANOUT_DELIVERED, Unit::Count, "Events pushed to local clients");
    describe_counter!(names::SEQUENCE_ALLOCATED, Unit::Count, "Sequence numbers handed out");
    describe_counter!(names::SEQUENCE_ERRORS, Unit::Count, "Failed sequence allocations");
}

/// 连接指标记录器
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    /// 记录新连接
    pub fn record_opened(network: &'static str) {
        ::metrics::counter!(names::CONNECTIONS_OPENED, "network" => network).increment(1);
        ::metrics::gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
    }

    /// 记录连接关闭
    pub fn record_closed(code: u16) {
        ::metrics::counter!(names::CONNECTIONS_CLOSED, "code" => code.to_string()).increment(1);
        ::metrics::gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }

    /// 记录心跳超时
    pub fn record_heartbeat_timeout() {
        ::metrics::counter!(names::HEARTBEAT_TIMEOUTS).increment(1);
    }

    /// 记录出站队列丢弃
    pub fn record_queue_dropped() {
        ::metrics::counter!(names::QUEUE_DROPPED).increment(1);
    }
}

/// Ack 缓冲区指标记录器
pub struct AckMetrics;

impl AckMetrics {
    pub fn record_registered() {
        ::metrics::counter!(names::ACK_REGISTERED).increment(1);
    }

    pub fn record_acknowledged() {
        ::metrics::counter!(names::ACK_ACKNOWLEDGED).increment(1);
    }

    pub fn record_resent() {
        ::metrics::counter!(names::ACK_RESENT).increment(1);
    }

    /// `reason` 为 `retry_exhausted` 或 `client_gone`
    pub fn record_dropped(reason: &'static str) {
        ::metrics::counter!(names::ACK_DROPPED, "reason" => reason).increment(1);
    }

    pub fn set_pending(count: usize) {
        ::metrics::gauge!(names::ACK_PENDING).set(count as f64);
    }
}

/// 消息分发指标记录器
pub struct FanoutMetrics;

impl FanoutMetrics {
    pub fn record_global() {
        ::metrics::counter!(names::FANOUT_GLOBAL).increment(1);
    }

    pub fn record_targeted(servers: usize) {
        ::metrics::counter!(names::FANOUT_TARGETED).increment(servers as u64);
    }

    pub fn record_failure(topic_kind: &'static str) {
        ::metrics::counter!(names::FANOUT_FAILURES, "topic" => topic_kind).increment(1);
    }

    pub fn record_delivered(count: usize) {
        ::metrics::counter!(names::FANOUT_DELIVERED).increment(count as u64);
    }
}

/// 发号器指标记录器
pub struct SequenceMetrics;

impl SequenceMetrics {
    pub fn record_allocated(count: u64) {
        ::metrics::counter!(names::SEQUENCE_ALLOCATED).increment(count);
    }

    pub fn record_error() {
        ::metrics::counter!(names::SEQUENCE_ERRORS).increment(1);
    }
}
