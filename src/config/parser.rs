//! Configuration file parsing (HOCON format).

use std::path::Path;

use crate::common::error::ConfigError;
use crate::config::types::Config;
use hocon::HoconLoader;

/// Load configuration from a HOCON file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    HoconLoader::new()
        .load_file(path)
        .map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?
        .resolve()
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
}

/// Load configuration from a HOCON string.
pub fn load_config_str(content: &str) -> Result<Config, ConfigError> {
    HoconLoader::new()
        .load_str(content)
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?
        .resolve()
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_full_config() {
        let config = load_config_str(
            r#"
            realtime {
                key = "app.key:secret"
                client_id = "worker-1"
                environment = "sandbox"
                fallback_hosts = ["a.example.com", "b.example.com"]
                disconnected_retry_timeout_ms = 5000
                queue_messages = false
            }
            channels = ["chat", "news"]
            "#,
        )
        .unwrap();

        assert_eq!(config.realtime.key.as_deref(), Some("app.key:secret"));
        assert_eq!(config.realtime.client_id.as_deref(), Some("worker-1"));
        assert_eq!(config.realtime.environment(), Some("sandbox"));
        assert_eq!(
            config.realtime.fallback_hosts,
            Some(vec!["a.example.com".to_string(), "b.example.com".to_string()])
        );
        assert_eq!(config.realtime.disconnected_retry_timeout_ms, 5000);
        assert!(!config.realtime.queue_messages);
        assert_eq!(config.channels, vec!["chat", "news"]);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config = load_config_str(r#"realtime { key = "app.key:secret" }"#).unwrap();
        assert!(config.realtime.tls);
        assert!(config.realtime.queue_messages);
        assert_eq!(config.realtime.connecting_timeout_ms, 15_000);
        assert_eq!(config.realtime.connection_state_ttl_ms, 120_000);
        assert!(config.channels.is_empty());
    }

    #[test]
    fn test_missing_file() {
        let result = load_config("/nonexistent/realtime.conf");
        assert!(result.is_err());
    }
}
