pub mod config;
pub mod manager;

pub use config::{
    AckConfig, Config, ConfigError, ConfigResult, HealthConfig, HeartbeatConfig, LogLevel,
    LoggingConfig, OverflowPolicy, PresenceConfig, QueueConfig, SequenceConfig, ServerConfig,
    StoreConfig,
};
pub use manager::ConfigManager;

use std::path::PathBuf;

/// 获取 Lumen 配置目录路径
pub fn lumen_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".lumen"))
}

/// 获取默认配置文件路径
pub fn default_config_path() -> Option<PathBuf> {
    lumen_dir().map(|dir| dir.join("config.json"))
}

/// 获取默认日志目录
pub fn default_log_dir() -> Option<PathBuf> {
    lumen_dir().map(|dir| dir.join("logs"))
}

/// 展开路径中的 ~ 为用户主目录
pub fn expand_tilde(path: &str) -> Option<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map(|home| home.join(rest)),
        None => Some(PathBuf::from(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lumen_dir() {
        let dir = lumen_dir();
        assert!(dir.is_some());
        assert!(dir.unwrap().to_string_lossy().contains(".lumen"));
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/.lumen/config.json");
        assert!(expanded.is_some());
        assert!(!expanded.unwrap().to_string_lossy().starts_with('~'));
        assert_eq!(expand_tilde("/etc/lumen.json"), Some(PathBuf::from("/etc/lumen.json")));
    }
}
