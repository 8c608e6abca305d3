//! Wire types spoken between bonfire peers and the relay.
//!
//! Every frame is a JSON object tagged by `"type"`. Signaling kinds travel
//! through the relay; `text` and `reaction` only ever travel over an
//! established peer data channel. The description and candidate shapes match
//! the browser `RTCSessionDescriptionInit` / `RTCIceCandidateInit` objects so
//! browser peers can share a room with native ones.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid envelope json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope is not a json object")]
    NotAnObject,
}

/// Relay-assigned identifier of one connected peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: PeerId,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// AEAD output, both fields base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPayload {
    pub nonce: String,
    pub ciphertext: String,
}

/// Body shared by `text` and `reaction`. For reactions `id` names the message
/// being reacted to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEnvelope {
    pub room: String,
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    pub data: SealedPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Join {
        #[serde(default)]
        room: String,
        username: String,
    },
    Joined {
        room: String,
        id: PeerId,
        #[serde(default)]
        peers: Vec<PeerSummary>,
    },
    Offer {
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        offer: SessionDescription,
    },
    Answer {
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        answer: SessionDescription,
    },
    Candidate {
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<PeerId>,
        candidate: IceCandidate,
    },
    NewPeer {
        room: String,
        id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
    PeerLeft {
        room: String,
        id: PeerId,
    },
    Text(ChatEnvelope),
    Reaction(ChatEnvelope),
    Error {
        message: String,
    },
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Join { .. } => EnvelopeKind::Join,
            Envelope::Joined { .. } => EnvelopeKind::Joined,
            Envelope::Offer { .. } => EnvelopeKind::Offer,
            Envelope::Answer { .. } => EnvelopeKind::Answer,
            Envelope::Candidate { .. } => EnvelopeKind::Candidate,
            Envelope::NewPeer { .. } => EnvelopeKind::NewPeer,
            Envelope::PeerLeft { .. } => EnvelopeKind::PeerLeft,
            Envelope::Text(_) => EnvelopeKind::Text,
            Envelope::Reaction(_) => EnvelopeKind::Reaction,
            Envelope::Error { .. } => EnvelopeKind::Error,
        }
    }

    pub fn room(&self) -> Option<&str> {
        match self {
            Envelope::Join { room, .. }
            | Envelope::Joined { room, .. }
            | Envelope::Offer { room, .. }
            | Envelope::Answer { room, .. }
            | Envelope::Candidate { room, .. }
            | Envelope::NewPeer { room, .. }
            | Envelope::PeerLeft { room, .. } => Some(room),
            Envelope::Text(chat) | Envelope::Reaction(chat) => Some(&chat.room),
            Envelope::Error { .. } => None,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Envelope::Error {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Join,
    Joined,
    Offer,
    Answer,
    Candidate,
    NewPeer,
    PeerLeft,
    Text,
    Reaction,
    Error,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Join => "join",
            EnvelopeKind::Joined => "joined",
            EnvelopeKind::Offer => "offer",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::Candidate => "candidate",
            EnvelopeKind::NewPeer => "new_peer",
            EnvelopeKind::PeerLeft => "peer_left",
            EnvelopeKind::Text => "text",
            EnvelopeKind::Reaction => "reaction",
            EnvelopeKind::Error => "error",
        }
    }

    /// Kinds carried peer to peer over the data channel.
    pub fn is_application(self) -> bool {
        matches!(self, EnvelopeKind::Text | EnvelopeKind::Reaction)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fields the relay routes on. Everything else in a frame stays opaque.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteHeader {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub target: Option<PeerId>,
    #[serde(default)]
    pub username: Option<String>,
}

impl RouteHeader {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ProtoError> {
        if !value.is_object() {
            return Err(ProtoError::NotAnObject);
        }
        Ok(Self::deserialize(value)?)
    }
}
