//! Connection lifecycle: states, hosts, the outbound queues and the worker
//! that drives them.

pub mod core;
pub mod hosts;
pub mod manager;
pub mod pending;
pub mod probe;
pub mod state;

pub use hosts::HostRegistry;
pub use manager::{ConnectionHandle, ConnectionManager};
pub use pending::PendingMessageQueue;
pub use probe::{ConnectivityProbe, HttpProbe, StaticProbe};
pub use state::{Connection, ConnectionState, ConnectionStateChange, StateInfo};
