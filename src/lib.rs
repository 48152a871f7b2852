//! realtime-link - a realtime pub/sub client.
//!
//! Keeps one logical connection to the service over a replaceable
//! transport, multiplexes named channels over it, and delivers outbound
//! messages in order with acknowledgement across transport failures,
//! server disconnects and host outages.

pub mod channel;
pub mod client;
pub mod common;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod transport;

pub use channel::{Channel, ChannelState};
pub use client::Realtime;
pub use common::error::{ClientError, ErrorInfo};
pub use config::ClientOptions;
pub use connection::{ConnectionHandle, ConnectionState};
