//! Configuration type definitions.

use std::time::Duration;

use serde::Deserialize;

use crate::connection::ConnectionState;

/// Port used for plain WebSocket connections unless overridden.
pub const DEFAULT_PORT: u16 = 80;
/// Port used for TLS WebSocket connections unless overridden.
pub const DEFAULT_TLS_PORT: u16 = 443;
/// Endpoint used to tell "no internet" apart from "service down".
pub const DEFAULT_CONNECTIVITY_CHECK_URL: &str =
    "https://internet-up.ably-realtime.com/is-the-internet-up.txt";

/// Root of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub realtime: ClientOptions,
    /// Channels the binary attaches on startup.
    #[serde(default)]
    pub channels: Vec<String>,
}

/// Options consumed by the connection core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// API key of the form `app.keyid:secret`.
    pub key: Option<String>,
    pub client_id: Option<String>,
    /// Non-production environment name; prefixes every default host.
    pub environment: Option<String>,
    /// Custom primary host. Disables default fallbacks unless
    /// `fallback_hosts_use_default` is set.
    pub realtime_host: Option<String>,
    pub port: Option<u16>,
    pub tls_port: Option<u16>,
    pub tls: bool,
    /// Custom fallback hosts; take precedence over every other rule.
    pub fallback_hosts: Option<Vec<String>>,
    pub fallback_hosts_use_default: bool,
    /// Queue outbound messages while not connected instead of failing them.
    pub queue_messages: bool,
    pub echo_messages: bool,
    pub auto_connect: bool,
    pub connecting_timeout_ms: u64,
    pub disconnected_retry_timeout_ms: u64,
    pub suspended_retry_timeout_ms: u64,
    /// How long the connection may stay down before it is suspended.
    pub connection_state_ttl_ms: u64,
    pub channel_request_timeout_ms: u64,
    pub connectivity_check_url: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            key: None,
            client_id: None,
            environment: None,
            realtime_host: None,
            port: None,
            tls_port: None,
            tls: true,
            fallback_hosts: None,
            fallback_hosts_use_default: false,
            queue_messages: true,
            echo_messages: true,
            auto_connect: true,
            connecting_timeout_ms: default_timeout_ms(ConnectionState::Connecting),
            disconnected_retry_timeout_ms: default_timeout_ms(ConnectionState::Disconnected),
            suspended_retry_timeout_ms: default_timeout_ms(ConnectionState::Suspended),
            connection_state_ttl_ms: 120_000,
            channel_request_timeout_ms: 10_000,
            connectivity_check_url: DEFAULT_CONNECTIVITY_CHECK_URL.to_string(),
        }
    }
}

/// Default timeout of `state` from the state table, in milliseconds.
fn default_timeout_ms(state: ConnectionState) -> u64 {
    state.info().timeout.as_millis() as u64
}

impl ClientOptions {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Port the transport should dial for the configured TLS mode.
    pub fn effective_port(&self) -> u16 {
        if self.tls {
            self.tls_port.unwrap_or(DEFAULT_TLS_PORT)
        } else {
            self.port.unwrap_or(DEFAULT_PORT)
        }
    }

    /// A non-default port pins a specific deployment.
    pub fn has_explicit_port(&self) -> bool {
        self.port.is_some_and(|port| port != DEFAULT_PORT)
            || self.tls_port.is_some_and(|port| port != DEFAULT_TLS_PORT)
    }

    /// Environment name, treating "production" as no environment.
    pub fn environment(&self) -> Option<&str> {
        self.environment
            .as_deref()
            .filter(|env| !env.is_empty() && !env.eq_ignore_ascii_case("production"))
    }

    pub fn connecting_timeout(&self) -> Duration {
        Duration::from_millis(self.connecting_timeout_ms)
    }

    pub fn disconnected_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnected_retry_timeout_ms)
    }

    pub fn suspended_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.suspended_retry_timeout_ms)
    }

    pub fn connection_state_ttl(&self) -> Duration {
        Duration::from_millis(self.connection_state_ttl_ms)
    }

    pub fn channel_request_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port_follows_tls() {
        let mut options = ClientOptions::default();
        assert_eq!(options.effective_port(), 443);
        options.tls = false;
        assert_eq!(options.effective_port(), 80);
        options.port = Some(8080);
        assert_eq!(options.effective_port(), 8080);
    }

    #[test]
    fn test_default_timeouts_follow_state_table() {
        let options = ClientOptions::default();
        assert_eq!(
            options.connecting_timeout(),
            ConnectionState::Connecting.info().timeout
        );
        assert_eq!(
            options.disconnected_retry_timeout(),
            ConnectionState::Disconnected.info().timeout
        );
        assert_eq!(
            options.suspended_retry_timeout(),
            ConnectionState::Suspended.info().timeout
        );
        assert_eq!(options.connecting_timeout(), Duration::from_secs(15));
        assert_eq!(options.suspended_retry_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_explicit_port() {
        let mut options = ClientOptions::default();
        assert!(!options.has_explicit_port());
        options.tls_port = Some(443);
        assert!(!options.has_explicit_port());
        options.tls_port = Some(8443);
        assert!(options.has_explicit_port());
    }

    #[test]
    fn test_production_environment_is_default() {
        let mut options = ClientOptions::default();
        options.environment = Some("production".to_string());
        assert_eq!(options.environment(), None);
        options.environment = Some("sandbox".to_string());
        assert_eq!(options.environment(), Some("sandbox"));
    }
}
