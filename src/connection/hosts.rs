//! Primary and fallback host selection.

use rand::seq::SliceRandom;

use crate::config::ClientOptions;

pub const DEFAULT_HOST: &str = "realtime.ably.io";

/// Default fallback set, without environment prefix.
pub const DEFAULT_FALLBACK_HOSTS: [&str; 5] = [
    "a.ably-realtime.com",
    "b.ably-realtime.com",
    "c.ably-realtime.com",
    "d.ably-realtime.com",
    "e.ably-realtime.com",
];

/// Knows which host to dial first and which host to try after a failure.
///
/// The fallback list is fixed at construction (shuffled once when it comes
/// from the default set) so a failover sequence walks every host exactly once.
#[derive(Debug, Clone)]
pub struct HostRegistry {
    primary: String,
    fallbacks: Vec<String>,
}

impl HostRegistry {
    pub fn new(options: &ClientOptions) -> Self {
        let environment = options.environment();

        let primary = match (options.realtime_host.as_deref(), environment) {
            (Some(host), _) => host.to_string(),
            (None, Some(env)) => format!("{}-{}", env, DEFAULT_HOST),
            (None, None) => DEFAULT_HOST.to_string(),
        };

        let fallbacks = match options.fallback_hosts {
            // An explicit list always wins, even over a pinned host or port.
            Some(ref hosts) => hosts.clone(),
            None => {
                let pinned_host = options.realtime_host.is_some() && !options.fallback_hosts_use_default;
                if pinned_host || options.has_explicit_port() {
                    Vec::new()
                } else {
                    let mut hosts = default_fallbacks(environment);
                    hosts.shuffle(&mut rand::thread_rng());
                    hosts
                }
            }
        };

        Self { primary, fallbacks }
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn fallbacks(&self) -> &[String] {
        &self.fallbacks
    }

    pub fn has_fallbacks(&self) -> bool {
        !self.fallbacks.is_empty()
    }

    /// Next host to try after `current` failed, or `None` once the list is
    /// exhausted. Starting from the primary yields the first fallback; an
    /// unknown host yields nothing.
    pub fn fallback(&self, current: &str) -> Option<&str> {
        // Position in the list is checked first so a custom list that repeats
        // the primary still terminates.
        let next = match self.fallbacks.iter().position(|host| host == current) {
            Some(index) => index + 1,
            None if current == self.primary => 0,
            None => return None,
        };
        self.fallbacks.get(next).map(String::as_str)
    }
}

fn default_fallbacks(environment: Option<&str>) -> Vec<String> {
    DEFAULT_FALLBACK_HOSTS
        .iter()
        .map(|host| match environment {
            // a.ably-realtime.com -> sandbox-a-fallback.ably-realtime.com
            Some(env) => match host.split_once('.') {
                Some((letter, domain)) => format!("{}-{}-fallback.{}", env, letter, domain),
                None => format!("{}-{}", env, host),
            },
            None => host.to_string(),
        })
        .collect()
}
