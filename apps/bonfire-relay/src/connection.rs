use axum::extract::ws::Message;
use bonfire_proto::{Envelope, EnvelopeKind, PeerId, ProtoError, RouteHeader};
use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::rooms::{Delivery, LeaveOutcome, RoomRegistry, RouteError};

/// Why a frame from a client was refused. The sender gets an `error`
/// envelope; nothing is forwarded.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("malformed envelope: {0}")]
    Malformed(#[from] ProtoError),
    #[error("binary frames must be utf-8 json")]
    NotUtf8,
    #[error("join a room before sending {0}")]
    NotJoined(EnvelopeKind),
    #[error("{kind} is missing a room")]
    MissingRoom { kind: EnvelopeKind },
    #[error("envelope addressed to room {got} but this connection joined {expected}")]
    RoomMismatch { expected: String, got: String },
    #[error("{0} is only sent by the relay")]
    RelayOnly(EnvelopeKind),
    #[error("{0} messages travel over the peer channel, not the relay")]
    PeerChannelOnly(EnvelopeKind),
    #[error("join requires a non-empty username")]
    BlankUsername,
    #[error(transparent)]
    Route(#[from] RouteError),
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::TooLarge { .. } => "too_large",
            Rejection::Malformed(_) | Rejection::NotUtf8 => "malformed",
            Rejection::NotJoined(_) => "not_joined",
            Rejection::MissingRoom { .. } | Rejection::RoomMismatch { .. } => "room_mismatch",
            Rejection::RelayOnly(_) | Rejection::PeerChannelOnly(_) => "unsupported_kind",
            Rejection::BlankUsername => "blank_username",
            Rejection::Route(RouteError::NotMember { .. }) => "not_member",
            Rejection::Route(RouteError::UnknownTarget(_)) => "unknown_target",
        }
    }
}

struct Membership {
    room: String,
}

/// Relay-side state of one websocket: its peer id, its outbound queue and the
/// room it joined. Frames from the socket go through [`RelayConnection::handle_text`].
pub struct RelayConnection {
    peer_id: PeerId,
    registry: RoomRegistry,
    sender: mpsc::Sender<Message>,
    membership: Option<Membership>,
    max_frame_bytes: usize,
}

impl RelayConnection {
    pub fn new(registry: RoomRegistry, sender: mpsc::Sender<Message>, max_frame_bytes: usize) -> Self {
        Self {
            peer_id: PeerId::generate(),
            registry,
            sender,
            membership: None,
            max_frame_bytes,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn room(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.room.as_str())
    }

    /// Processes one inbound frame. Failures are logged and answered with an
    /// `error` envelope to this connection only.
    pub fn handle_text(&mut self, text: &str) {
        if let Err(rejection) = self.dispatch(text) {
            counter!(
                "bonfire_relay_envelopes_rejected_total",
                1,
                "reason" => rejection.reason()
            );
            warn!(
                peer_id = %self.peer_id,
                room = self.room().unwrap_or("-"),
                reason = rejection.reason(),
                error = %rejection,
                "rejected envelope"
            );
            self.reply(&Envelope::error(rejection.to_string()));
        }
    }

    pub fn handle_binary(&mut self, bytes: Vec<u8>) {
        match String::from_utf8(bytes) {
            Ok(text) => self.handle_text(&text),
            Err(_) => {
                counter!(
                    "bonfire_relay_envelopes_rejected_total",
                    1,
                    "reason" => Rejection::NotUtf8.reason()
                );
                self.reply(&Envelope::error(Rejection::NotUtf8.to_string()));
            }
        }
    }

    fn dispatch(&mut self, text: &str) -> Result<(), Rejection> {
        if text.len() > self.max_frame_bytes {
            return Err(Rejection::TooLarge {
                size: text.len(),
                limit: self.max_frame_bytes,
            });
        }

        let mut value: Value = serde_json::from_str(text).map_err(ProtoError::from)?;
        let header = RouteHeader::from_value(&value)?;

        match header.kind {
            EnvelopeKind::Join => {
                let room = header.room.unwrap_or_default();
                let username = header.username.unwrap_or_default();
                self.join(&room, &username).map(|_| ())
            }
            EnvelopeKind::Offer | EnvelopeKind::Answer | EnvelopeKind::Candidate => {
                self.route(&header, &mut value).map(|_| ())
            }
            kind if kind.is_application() => Err(Rejection::PeerChannelOnly(kind)),
            kind => Err(Rejection::RelayOnly(kind)),
        }
    }

    /// Registers this connection in `room`, leaving any previous room first.
    /// A blank room name is replaced by a generated one. Returns the room
    /// actually joined.
    pub fn join(&mut self, room: &str, username: &str) -> Result<String, Rejection> {
        let username = username.trim();
        if username.is_empty() {
            return Err(Rejection::BlankUsername);
        }
        let room = match room.trim() {
            "" => generate_room_id(),
            named => named.to_string(),
        };

        if self.membership.is_some() {
            self.leave();
        }

        self.registry
            .join(&room, &self.peer_id, username, self.sender.clone());
        self.membership = Some(Membership { room: room.clone() });
        Ok(room)
    }

    /// Forwards a signaling envelope to the rest of the room, stamping the
    /// sender's peer id into `from`. The payload is never inspected.
    pub fn route(&mut self, header: &RouteHeader, value: &mut Value) -> Result<Delivery, Rejection> {
        let joined = self
            .membership
            .as_ref()
            .ok_or(Rejection::NotJoined(header.kind))?;
        let room = header
            .room
            .as_deref()
            .ok_or(Rejection::MissingRoom { kind: header.kind })?;
        if room != joined.room {
            return Err(Rejection::RoomMismatch {
                expected: joined.room.clone(),
                got: room.to_string(),
            });
        }

        let object = value.as_object_mut().ok_or(ProtoError::NotAnObject)?;
        object.insert("from".into(), Value::String(self.peer_id.to_string()));
        let frame = serde_json::to_string(value).map_err(ProtoError::from)?;

        let delivery = self
            .registry
            .route(room, &self.peer_id, header.target.as_ref(), &frame)?;
        counter!(
            "bonfire_relay_envelopes_routed_total",
            delivery.delivered as u64,
            "kind" => header.kind.as_str()
        );
        debug!(
            peer_id = %self.peer_id,
            room = %room,
            kind = %header.kind,
            target = ?header.target,
            delivered = delivery.delivered,
            "routed envelope"
        );
        Ok(delivery)
    }

    /// Drops this connection's membership. Idempotent.
    pub fn leave(&mut self) -> Option<LeaveOutcome> {
        let membership = self.membership.take()?;
        let outcome = self.registry.leave(&membership.room, &self.peer_id);
        debug!(
            peer_id = %self.peer_id,
            room = %membership.room,
            remaining = outcome.remaining,
            room_closed = outcome.room_closed,
            "peer left room"
        );
        Some(outcome)
    }

    fn reply(&self, envelope: &Envelope) {
        match envelope.to_json() {
            Ok(frame) => {
                if self.sender.try_send(Message::Text(frame)).is_err() {
                    debug!(peer_id = %self.peer_id, "reply dropped; connection queue unavailable");
                }
            }
            Err(err) => warn!(error = %err, "failed to encode reply"),
        }
    }
}

fn generate_room_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
