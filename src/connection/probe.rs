//! Internet connectivity check.
//!
//! Used to tell "this host is down" apart from "we are offline" before
//! failing over to another host.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::common::error::ClientError;

/// Body the check endpoint returns when the internet is reachable.
const EXPECTED_BODY: &str = "yes";

pub trait ConnectivityProbe: Send + Sync {
    /// Resolves to `true` when the wider internet is reachable.
    fn check(&self) -> BoxFuture<'static, bool>;
}

/// GETs a well-known URL and expects a short fixed body.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ClientError::Transport {
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl ConnectivityProbe for HttpProbe {
    fn check(&self) -> BoxFuture<'static, bool> {
        let client = self.client.clone();
        let url = self.url.clone();
        async move {
            let response = match client.get(&url).send().await {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    debug!("Connectivity check returned {}", response.status());
                    return false;
                }
                Err(e) => {
                    debug!("Connectivity check failed: {}", e);
                    return false;
                }
            };
            match response.text().await {
                Ok(body) => is_up(&body),
                Err(e) => {
                    debug!("Connectivity check body unreadable: {}", e);
                    false
                }
            }
        }
        .boxed()
    }
}

fn is_up(body: &str) -> bool {
    body.trim() == EXPECTED_BODY
}

/// Probe with a fixed answer, for wiring tests and offline setups.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub bool);

impl ConnectivityProbe for StaticProbe {
    fn check(&self) -> BoxFuture<'static, bool> {
        futures::future::ready(self.0).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_match() {
        assert!(is_up("yes"));
        assert!(is_up("yes\n"));
        assert!(!is_up("no"));
        assert!(!is_up("<html>captive portal</html>"));
    }

    #[test]
    fn test_static_probe() {
        assert!(tokio_test::block_on(StaticProbe(true).check()));
        assert!(!tokio_test::block_on(StaticProbe(false).check()));
    }
}
