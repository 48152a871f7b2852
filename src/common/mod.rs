//! Common utilities and types shared across the client.

pub mod error;
pub mod reconnect;
pub mod types;

pub use error::{ClientError, ConfigError, ErrorInfo};
pub use reconnect::{BackoffStrategy, RetryBackoff, RetryBackoffBuilder};
pub use types::{Callback, Completion, Outcome, QueuedMessage};
