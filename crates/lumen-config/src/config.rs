use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 主配置结构体
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub ack: AckConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            server: ServerConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            ack: AckConfig::default(),
            queue: QueueConfig::default(),
            presence: PresenceConfig::default(),
            sequence: SequenceConfig::default(),
            store: StoreConfig::default(),
            health: HealthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// 获取配置值的快捷方法
    pub fn get_value(&self, key: &str) -> Option<String> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["version"] => Some(self.version.clone()),
            ["server", "server_id"] => self.server.server_id.clone(),
            ["server", "websocket_bind"] => Some(self.server.websocket_bind.clone()),
            ["server", "tcp_bind"] => self.server.tcp_bind.clone(),
            ["server", "max_connections"] => Some(self.server.max_connections.to_string()),
            ["server", "write_timeout_ms"] => Some(self.server.write_timeout_ms.to_string()),
            ["heartbeat", "interval_secs"] => Some(self.heartbeat.interval_secs.to_string()),
            ["heartbeat", "timeout_secs"] => Some(self.heartbeat.timeout_secs.to_string()),
            ["ack", "resend_interval_secs"] => Some(self.ack.resend_interval_secs.to_string()),
            ["ack", "max_retry"] => Some(self.ack.max_retry.to_string()),
            ["queue", "capacity"] => Some(self.queue.capacity.to_string()),
            ["queue", "overflow"] => Some(self.queue.overflow.to_string()),
            ["presence", "private_fanout_threshold"] => {
                Some(self.presence.private_fanout_threshold.to_string())
            }
            ["store", "redis_url"] => self.store.redis_url.clone(),
            ["logging", "level"] => Some(format!("{:?}", self.logging.level).to_lowercase()),
            ["logging", "file"] => self.logging.file.clone(),
            _ => None,
        }
    }

    /// 设置配置值
    pub fn set_value(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["server", "server_id"] => {
                self.server.server_id = Some(value.to_string());
            }
            ["server", "websocket_bind"] => {
                self.server.websocket_bind = value.to_string();
            }
            ["server", "tcp_bind"] => {
                self.server.tcp_bind = Some(value.to_string());
            }
            ["server", "max_connections"] => {
                self.server.max_connections = parse_number(value)?;
            }
            ["server", "write_timeout_ms"] => {
                self.server.write_timeout_ms = parse_number(value)?;
            }
            ["heartbeat", "interval_secs"] => {
                self.heartbeat.interval_secs = parse_number(value)?;
            }
            ["heartbeat", "timeout_secs"] => {
                self.heartbeat.timeout_secs = parse_number(value)?;
            }
            ["ack", "resend_interval_secs"] => {
                self.ack.resend_interval_secs = parse_number(value)?;
            }
            ["ack", "max_retry"] => {
                self.ack.max_retry = parse_number(value)?;
            }
            ["queue", "capacity"] => {
                self.queue.capacity = parse_number(value)?;
            }
            ["queue", "overflow"] => {
                self.queue.overflow = value.parse()?;
            }
            ["presence", "private_fanout_threshold"] => {
                self.presence.private_fanout_threshold = parse_number(value)?;
            }
            ["store", "redis_url"] => {
                self.store.redis_url = Some(value.to_string());
            }
            ["logging", "level"] => {
                self.logging.level = value.parse()?;
            }
            ["logging", "file"] => {
                self.logging.file = Some(value.to_string());
            }
            _ => return Err(ConfigError::KeyNotFound(key.to_string())),
        }
        Ok(())
    }

    /// 校验配置的一致性
    pub fn validate(&self) -> ConfigResult<()> {
        if self.heartbeat.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "heartbeat.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.heartbeat.timeout_secs <= self.heartbeat.interval_secs {
            return Err(ConfigError::Validation(format!(
                "heartbeat.timeout_secs ({}) must be greater than heartbeat.interval_secs ({})",
                self.heartbeat.timeout_secs, self.heartbeat.interval_secs
            )));
        }
        if self.heartbeat.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "heartbeat.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.ack.resend_interval_secs == 0 || self.ack.sweep_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "ack intervals must be greater than 0".to_string(),
            ));
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::Validation(
                "queue.capacity must be greater than 0".to_string(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::Validation(
                "server.max_connections must be greater than 0".to_string(),
            ));
        }
        if self.server.max_frame_bytes == 0 || self.server.write_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "server.max_frame_bytes and server.write_timeout_ms must be greater than 0"
                    .to_string(),
            ));
        }
        if self.presence.report_interval_secs == 0
            || self.presence.overtime_secs <= self.presence.report_interval_secs
        {
            return Err(ConfigError::Validation(format!(
                "presence.overtime_secs ({}) must be greater than presence.report_interval_secs ({})",
                self.presence.overtime_secs, self.presence.report_interval_secs
            )));
        }
        if self.sequence.ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "sequence.ttl_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> ConfigResult<T> {
    value
        .parse()
        .map_err(|_| ConfigError::Validation(format!("Invalid number: {}", value)))
}

/// Server 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// 进程标识，缺省时启动时生成
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// WebSocket 监听地址
    pub websocket_bind: String,
    /// TCP 监听地址，None 表示不启用
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_bind: Option<String>,
    /// 最大并发连接数
    pub max_connections: usize,
    /// TCP 单帧最大字节数
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// WebSocket 写超时（毫秒）
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

fn default_write_timeout_ms() -> u64 {
    50
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: None,
            websocket_bind: "0.0.0.0:9501".to_string(),
            tcp_bind: Some("0.0.0.0:9505".to_string()),
            max_connections: 10_000,
            max_frame_bytes: default_max_frame_bytes(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// 心跳配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatConfig {
    /// 客户端心跳间隔（秒），随 connect 事件下发
    pub interval_secs: u64,
    /// 心跳超时（秒），超过即断开
    pub timeout_secs: u64,
    /// 健康检查扫描周期（秒）
    pub sweep_interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 75,
            sweep_interval_secs: 5,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// ACK 重传配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AckConfig {
    /// 未确认消息的重发间隔（秒）
    pub resend_interval_secs: u64,
    /// 最大重试次数，超过后丢弃
    pub max_retry: u32,
    /// 扫描周期（毫秒）
    pub sweep_interval_ms: u64,
    /// 推送聊天事件时是否要求客户端确认
    pub deliver_with_ack: bool,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            resend_interval_secs: 5,
            max_retry: 3,
            sweep_interval_ms: 1000,
            deliver_with_ack: true,
        }
    }
}

impl AckConfig {
    pub fn resend_interval(&self) -> Duration {
        Duration::from_secs(self.resend_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// 发送队列溢出策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// 队列满时阻塞写入方
    Block,
    /// 队列满时丢弃最旧的消息
    DropOldest,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self::Block
    }
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::DropOldest => write!(f, "drop_oldest"),
        }
    }
}

impl std::str::FromStr for OverflowPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "drop_oldest" | "drop-oldest" => Ok(Self::DropOldest),
            _ => Err(ConfigError::Validation(format!(
                "Invalid overflow policy: {}",
                s
            ))),
        }
    }
}

/// 客户端发送队列配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    pub capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            overflow: OverflowPolicy::Block,
        }
    }
}

/// 服务发现与消息分发配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceConfig {
    /// 上报心跳周期（秒）
    pub report_interval_secs: u64,
    /// 超过该时长未上报视为下线（秒）
    pub overtime_secs: u64,
    /// 在线服务数不超过该值时私聊消息走全局广播
    pub private_fanout_threshold: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 10,
            overtime_secs: 50,
            private_fanout_threshold: 3,
        }
    }
}

impl PresenceConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn overtime(&self) -> Duration {
        Duration::from_secs(self.overtime_secs)
    }
}

/// 发号器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceConfig {
    pub ttl_secs: u64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 12 * 60 * 60,
        }
    }
}

impl SequenceConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Store 配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Redis 地址；为空时使用进程内存储（仅限单节点）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
}

/// 健康检查端点配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:9580".to_string(),
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::Validation(format!("Invalid log level: {}", s))),
        }
    }
}

/// Logging 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub level: LogLevel,
    #[serde(default)]
    pub json: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json: false,
            file: None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
