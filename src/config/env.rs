//! Environment variable overrides for configuration.
//!
//! Supports overriding config values with environment variables:
//! - `REALTIME_KEY` - API key
//! - `REALTIME_CLIENT_ID` - client identity
//! - `REALTIME_HOST` - custom primary host
//! - `REALTIME_PORT` - custom TLS port
//! - `REALTIME_ENVIRONMENT` - environment name

use std::env;

use crate::config::types::Config;

/// Environment variable prefix for all config overrides.
const ENV_PREFIX: &str = "REALTIME";

/// Apply environment variable overrides to a config.
///
/// Lets the API key come from the environment instead of the config file.
pub fn apply_env_overrides(mut config: Config) -> Config {
    if let Ok(key) = env::var(format!("{}_KEY", ENV_PREFIX)) {
        config.realtime.key = Some(key);
    }
    if let Ok(client_id) = env::var(format!("{}_CLIENT_ID", ENV_PREFIX)) {
        config.realtime.client_id = Some(client_id);
    }

    // Host settings
    if let Ok(host) = env::var(format!("{}_HOST", ENV_PREFIX)) {
        config.realtime.realtime_host = Some(host);
    }
    if let Ok(port) = env::var(format!("{}_PORT", ENV_PREFIX)) {
        if let Ok(port) = port.parse() {
            config.realtime.tls_port = Some(port);
        }
    }
    if let Ok(environment) = env::var(format!("{}_ENVIRONMENT", ENV_PREFIX)) {
        config.realtime.environment = Some(environment);
    }

    config
}

/// Get the config file path from environment or use default.
///
/// Checks `REALTIME_CONFIG` environment variable, otherwise returns "realtime.conf".
pub fn get_config_path() -> String {
    env::var(format!("{}_CONFIG", ENV_PREFIX)).unwrap_or_else(|_| "realtime.conf".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_prefix() {
        assert_eq!(ENV_PREFIX, "REALTIME");
    }

    #[test]
    fn test_get_config_path_default() {
        env::remove_var("REALTIME_CONFIG");
        assert_eq!(get_config_path(), "realtime.conf");
    }

    #[test]
    fn test_apply_env_overrides() {
        env::remove_var("REALTIME_KEY");
        env::set_var("REALTIME_ENVIRONMENT", "sandbox");

        let mut config = Config::default();
        config.realtime.key = Some("app.key:original".to_string());
        let result = apply_env_overrides(config);
        env::remove_var("REALTIME_ENVIRONMENT");

        assert_eq!(result.realtime.key.as_deref(), Some("app.key:original"));
        assert_eq!(result.realtime.environment.as_deref(), Some("sandbox"));
    }
}
