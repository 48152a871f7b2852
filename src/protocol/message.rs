//! Protocol message types.
//!
//! Only the envelope matters to the connection core: the action, the
//! addressing fields (channel, serials) and the control payloads
//! (connection details, errors, ack ranges). Message bodies stay opaque.

use serde::{Deserialize, Serialize};

use crate::common::error::ErrorInfo;

/// `flags` bit: the channel has members present; a presence sync follows.
pub const FLAG_HAS_PRESENCE: u32 = 1 << 0;
/// `flags` bit: the channel has a backlog to deliver.
pub const FLAG_HAS_BACKLOG: u32 = 1 << 1;
/// `flags` bit: the attach resumed without loss of continuity.
pub const FLAG_RESUMED: u32 = 1 << 2;

/// Protocol message action, carried on the wire as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Action {
    Heartbeat,
    Ack,
    Nack,
    Connect,
    Connected,
    Disconnect,
    Disconnected,
    Close,
    Closed,
    Error,
    Attach,
    Attached,
    Detach,
    Detached,
    Presence,
    Message,
    Sync,
    Auth,
}

impl Action {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Heartbeat),
            1 => Some(Self::Ack),
            2 => Some(Self::Nack),
            3 => Some(Self::Connect),
            4 => Some(Self::Connected),
            5 => Some(Self::Disconnect),
            6 => Some(Self::Disconnected),
            7 => Some(Self::Close),
            8 => Some(Self::Closed),
            9 => Some(Self::Error),
            10 => Some(Self::Attach),
            11 => Some(Self::Attached),
            12 => Some(Self::Detach),
            13 => Some(Self::Detached),
            14 => Some(Self::Presence),
            15 => Some(Self::Message),
            16 => Some(Self::Sync),
            17 => Some(Self::Auth),
            _ => None,
        }
    }

    /// Wire value; inverse of [`Action::from_id`].
    pub fn to_id(self) -> u8 {
        match self {
            Self::Heartbeat => 0,
            Self::Ack => 1,
            Self::Nack => 2,
            Self::Connect => 3,
            Self::Connected => 4,
            Self::Disconnect => 5,
            Self::Disconnected => 6,
            Self::Close => 7,
            Self::Closed => 8,
            Self::Error => 9,
            Self::Attach => 10,
            Self::Attached => 11,
            Self::Detach => 12,
            Self::Detached => 13,
            Self::Presence => 14,
            Self::Message => 15,
            Self::Sync => 16,
            Self::Auth => 17,
        }
    }

    /// Outbound messages of these kinds are tracked until ACK/NACK.
    pub fn requires_ack(self) -> bool {
        matches!(self, Self::Message | Self::Presence)
    }
}

impl TryFrom<u8> for Action {
    type Error = String;

    fn try_from(id: u8) -> Result<Self, String> {
        Action::from_id(id).ok_or_else(|| format!("unknown protocol action {}", id))
    }
}

impl From<Action> for u8 {
    fn from(action: Action) -> u8 {
        action.to_id()
    }
}

/// A single published message. The payload is opaque to the client core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Message {
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: Some(name.into()),
            data: Some(data),
            ..Default::default()
        }
    }
}

/// Connection parameters supplied by the service in CONNECTED.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    /// Milliseconds the service keeps connection state after a drop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state_ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

/// The envelope exchanged with the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
}

impl ProtocolMessage {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            flags: None,
            count: None,
            error: None,
            id: None,
            channel: None,
            channel_serial: None,
            connection_id: None,
            connection_serial: None,
            msg_serial: None,
            timestamp: None,
            messages: None,
            presence: None,
            connection_details: None,
        }
    }

    pub fn for_channel(action: Action, channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Self::new(action)
        }
    }

    pub fn attach(channel: &str, channel_serial: Option<String>) -> Self {
        Self {
            channel_serial,
            ..Self::for_channel(Action::Attach, channel)
        }
    }

    pub fn detach(channel: &str) -> Self {
        Self::for_channel(Action::Detach, channel)
    }

    pub fn publish(channel: &str, messages: Vec<Message>) -> Self {
        Self {
            messages: Some(messages),
            ..Self::for_channel(Action::Message, channel)
        }
    }

    pub fn heartbeat(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::new(Action::Heartbeat)
        }
    }

    pub fn close() -> Self {
        Self::new(Action::Close)
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.map(|flags| flags & flag == flag).unwrap_or(false)
    }

    pub fn requires_ack(&self) -> bool {
        self.action.requires_ack()
    }

    /// Whether `other` can be folded into this message while both wait in
    /// the outbound queue: same action and channel, and neither carries
    /// client-assigned message ids (those must stay in separate envelopes so
    /// the service can deduplicate them).
    pub fn can_merge(&self, other: &ProtocolMessage) -> bool {
        self.action == Action::Message
            && other.action == Action::Message
            && self.channel.is_some()
            && self.channel == other.channel
            && !self.has_client_ids()
            && !other.has_client_ids()
    }

    /// Appends `other`'s messages. Callers check [`ProtocolMessage::can_merge`] first.
    pub fn merge(&mut self, other: ProtocolMessage) {
        let incoming = other.messages.unwrap_or_default();
        self.messages.get_or_insert_with(Vec::new).extend(incoming);
    }

    fn has_client_ids(&self) -> bool {
        self.messages
            .as_ref()
            .map(|messages| messages.iter().any(|m| m.id.is_some()))
            .unwrap_or(false)
    }
}
