use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Discriminator carried in the `type` field of every envelope
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Bind `from` to the sending connection
    Register,
    /// WebRTC negotiation payloads, forwarded verbatim
    Offer,
    Answer,
    Candidate,
    /// Call control sent by clients
    InitiateCall,
    AcceptCall,
    DeclineCall,
    /// Call control built by the relay
    CallAccepted,
    CallDeclined,
    Error,
    Chat,
}

impl MessageType {
    pub const ALL: [MessageType; 11] = [
        MessageType::Register,
        MessageType::Offer,
        MessageType::Answer,
        MessageType::Candidate,
        MessageType::InitiateCall,
        MessageType::AcceptCall,
        MessageType::DeclineCall,
        MessageType::CallAccepted,
        MessageType::CallDeclined,
        MessageType::Error,
        MessageType::Chat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Register => "register",
            MessageType::Offer => "offer",
            MessageType::Answer => "answer",
            MessageType::Candidate => "candidate",
            MessageType::InitiateCall => "initiate_call",
            MessageType::AcceptCall => "accept_call",
            MessageType::DeclineCall => "decline_call",
            MessageType::CallAccepted => "call_accepted",
            MessageType::CallDeclined => "call_declined",
            MessageType::Error => "error",
            MessageType::Chat => "chat",
        }
    }

    /// Whether a well-formed envelope of this type must name a destination
    pub fn requires_destination(&self) -> bool {
        !matches!(self, MessageType::Register)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown message type '{0}'")]
pub struct UnknownMessageType(pub String);

impl FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| UnknownMessageType(value.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope missing type")]
    MissingType,
    #[error("envelope missing from")]
    MissingFrom,
}

/// Inbound frame as seen by the relay. Only the routing fields are typed;
/// `sdp`, `candidate` and `message` stay inside the raw frame and are never
/// inspected. `callId` is opaque and kept as whatever JSON the sender used.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    /// Raw `type` string, kept so unknown types can be logged as sent
    pub kind: String,
    pub from: String,
    /// `None` when absent, empty or not a string
    pub to: Option<String>,
    pub call_id: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<Value>,
    #[serde(rename = "callId", default)]
    call_id: Option<Value>,
}

impl InboundEnvelope {
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        let kind = raw
            .kind
            .filter(|kind| !kind.is_empty())
            .ok_or(EnvelopeError::MissingType)?;
        let from = raw
            .from
            .filter(|from| !from.is_empty())
            .ok_or(EnvelopeError::MissingFrom)?;

        Ok(Self {
            kind,
            from,
            to: raw
                .to
                .as_ref()
                .and_then(Value::as_str)
                .filter(|to| !to.is_empty())
                .map(str::to_string),
            call_id: raw.call_id.filter(|call_id| !call_id.is_null()),
        })
    }

    /// `None` when the sender used a type outside the enumeration
    pub fn message_type(&self) -> Option<MessageType> {
        self.kind.parse().ok()
    }
}

/// Envelope written by the relay (call control and error echoes) and by the
/// debug client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<serde_json::Value>,
    #[serde(rename = "callId", default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub const RECIPIENT_OFFLINE: &str = "Recipient not online";

impl Envelope {
    pub fn new(kind: MessageType, from: impl Into<String>) -> Self {
        Self {
            kind,
            from: from.into(),
            to: None,
            sdp: None,
            candidate: None,
            call_id: None,
            message: None,
        }
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn call_id(mut self, call_id: Option<Value>) -> Self {
        self.call_id = call_id;
        self
    }

    /// `{type, from, to, callId}` rebuilt from the inbound routing fields
    pub fn call_control(kind: MessageType, from: &str, to: &str, call_id: Option<Value>) -> Self {
        Envelope::new(kind, from).to(to).call_id(call_id)
    }

    /// Reply sent back to a caller whose callee has no open connection. The
    /// callee is named as the sender.
    pub fn recipient_offline(caller: &str, callee: &str, call_id: Option<Value>) -> Self {
        let mut envelope = Envelope::call_control(MessageType::Error, callee, caller, call_id);
        envelope.message = Some(RECIPIENT_OFFLINE.to_string());
        envelope
    }
}
