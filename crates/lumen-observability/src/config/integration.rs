//! lumen-config 集成模块

use crate::config::Config as ObservabilityConfig;

impl From<&lumen_config::Config> for ObservabilityConfig {
    fn from(config: &lumen_config::Config) -> Self {
        let mut obs = ObservabilityConfig::default()
            .with_log_level(config.logging.level.as_str())
            .with_json_format(config.logging.json)
            .with_health_enabled(config.health.enabled)
            .with_health_bind(config.health.bind.clone());

        if let Some(ref file) = config.logging.file {
            if let Some(path) = lumen_config::expand_tilde(file) {
                obs = obs.with_log_file(path);
            }
        }

        obs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_config::LogLevel;

    #[test]
    fn test_from_lumen_config() {
        let mut config = lumen_config::Config::default();
        config.logging.level = LogLevel::Debug;
        config.logging.json = true;
        config.logging.file = Some("/var/log/lumen/gateway.log".to_string());
        config.health.bind = "127.0.0.1:9999".to_string();

        let obs = ObservabilityConfig::from(&config);
        assert_eq!(obs.logging.level, "debug");
        assert!(obs.logging.json_format);
        assert_eq!(
            obs.logging.file_path.as_deref(),
            Some(std::path::Path::new("/var/log/lumen/gateway.log"))
        );
        assert_eq!(obs.health.bind, "127.0.0.1:9999");
    }
}
