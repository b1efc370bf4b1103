//! 观测性错误类型

#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    /// 日志订阅者安装或重载失败
    #[error("Logging error: {0}")]
    Logging(String),

    /// Prometheus recorder 安装失败
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// 健康检查服务器绑定或关闭失败
    #[error("Health server error: {0}")]
    Health(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ObservabilityError {
    pub fn logging(message: impl Into<String>) -> Self {
        Self::Logging(message.into())
    }

    pub fn metrics(message: impl Into<String>) -> Self {
        Self::Metrics(message.into())
    }

    pub fn health(message: impl Into<String>) -> Self {
        Self::Health(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ObservabilityError>;
