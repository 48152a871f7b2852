//! Configuration validation.
//!
//! Validates configuration values and provides helpful error messages.

use crate::common::error::ConfigError;
use crate::config::types::{ClientOptions, Config};

/// Validate a configuration and return detailed errors.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = validate_options(&config.realtime);

    for (i, channel) in config.channels.iter().enumerate() {
        if channel.trim().is_empty() {
            errors.push(format!("channels[{}] must not be empty", i));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError {
            message: errors.join("\n"),
        })
    }
}

fn validate_options(options: &ClientOptions) -> Vec<String> {
    let mut errors = Vec::new();

    match options.key.as_deref() {
        None | Some("") => errors.push("realtime.key is required".to_string()),
        Some(key) if !is_valid_key(key) => {
            errors.push("realtime.key must have the form 'app.keyid:secret'".to_string())
        }
        Some(_) => {}
    }

    if let Some(env) = options.environment.as_deref() {
        if env.trim().is_empty() {
            errors.push("realtime.environment must not be empty when set".to_string());
        }
    }
    if let Some(host) = options.realtime_host.as_deref() {
        if host.trim().is_empty() {
            errors.push("realtime.realtime_host must not be empty when set".to_string());
        }
    }
    if options.port == Some(0) {
        errors.push("realtime.port must be non-zero".to_string());
    }
    if options.tls_port == Some(0) {
        errors.push("realtime.tls_port must be non-zero".to_string());
    }

    if let Some(ref hosts) = options.fallback_hosts {
        for (i, host) in hosts.iter().enumerate() {
            if host.trim().is_empty() {
                errors.push(format!("realtime.fallback_hosts[{}] must not be empty", i));
            }
        }
    }

    let timeouts = [
        ("connecting_timeout_ms", options.connecting_timeout_ms),
        (
            "disconnected_retry_timeout_ms",
            options.disconnected_retry_timeout_ms,
        ),
        ("suspended_retry_timeout_ms", options.suspended_retry_timeout_ms),
        ("channel_request_timeout_ms", options.channel_request_timeout_ms),
    ];
    for (name, value) in timeouts {
        if value == 0 {
            errors.push(format!("realtime.{} must be non-zero", name));
        }
    }

    if !options.connectivity_check_url.starts_with("http://")
        && !options.connectivity_check_url.starts_with("https://")
    {
        errors.push(format!(
            "realtime.connectivity_check_url '{}' is not an http(s) URL",
            options.connectivity_check_url
        ));
    }

    errors
}

/// `app.keyid:secret`, each part non-empty.
fn is_valid_key(key: &str) -> bool {
    let Some((name, secret)) = key.split_once(':') else {
        return false;
    };
    let Some((app, key_id)) = name.split_once('.') else {
        return false;
    };
    !app.is_empty() && !key_id.is_empty() && !secret.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_valid_config() -> Config {
        Config {
            realtime: ClientOptions::with_key("app.keyid:secret"),
            channels: vec!["chat".to_string()],
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(validate_config(&make_valid_config()).is_ok());
    }

    #[test]
    fn test_missing_key_fails() {
        let mut config = make_valid_config();
        config.realtime.key = None;

        let result = validate_config(&config);
        assert!(result.unwrap_err().to_string().contains("realtime.key is required"));
    }

    #[test]
    fn test_malformed_key_fails() {
        for key in ["nocolon", "app:secret", "app.:secret", "app.id:"] {
            let mut config = make_valid_config();
            config.realtime.key = Some(key.to_string());
            let result = validate_config(&config);
            assert!(
                result.unwrap_err().to_string().contains("app.keyid:secret"),
                "key {:?} should be rejected",
                key
            );
        }
    }

    #[test]
    fn test_zero_timeout_fails() {
        let mut config = make_valid_config();
        config.realtime.connecting_timeout_ms = 0;

        let result = validate_config(&config);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("connecting_timeout_ms"));
    }

    #[test]
    fn test_errors_are_collected() {
        let mut config = make_valid_config();
        config.realtime.port = Some(0);
        config.realtime.fallback_hosts = Some(vec!["".to_string()]);
        config.channels.push(" ".to_string());

        let message = validate_config(&config).unwrap_err().to_string();
        assert!(message.contains("realtime.port"));
        assert!(message.contains("fallback_hosts[0]"));
        assert!(message.contains("channels[1]"));
    }
}
