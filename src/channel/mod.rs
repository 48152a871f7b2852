//! Named channels multiplexed over the connection.

#[allow(clippy::module_inception)]
pub mod channel;
pub mod registry;
pub mod state;

pub use channel::Channel;
pub use registry::ChannelRegistry;
pub use state::{ChannelEvent, ChannelState, ChannelStateChange};
