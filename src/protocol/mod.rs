//! Protocol message envelope and frame codec.

pub mod codec;
pub mod message;

pub use codec::{FrameCodec, JsonCodec};
pub use message::{
    Action, ConnectionDetails, Message, ProtocolMessage, FLAG_HAS_BACKLOG, FLAG_HAS_PRESENCE,
    FLAG_RESUMED,
};
