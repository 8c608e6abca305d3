use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use axum::extract::ws::Message;
use bonfire_proto::{Envelope, PeerId, PeerSummary};
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Room membership for the relay.
///
/// Every mutation of a room runs while holding that room's map entry, so two
/// joins never interleave a partial update. A room is removed as soon as its
/// last member leaves.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<RoomRegistryInner>,
}

#[derive(Default)]
struct RoomRegistryInner {
    rooms: DashMap<String, Room>,
    join_seq: AtomicU64,
}

#[derive(Default)]
struct Room {
    members: HashMap<PeerId, Member>,
}

struct Member {
    username: String,
    sender: mpsc::Sender<Message>,
    joined_seq: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("peer {peer} is not a member of room {room}")]
    NotMember { room: String, peer: PeerId },
    #[error("target {0} is not in the room")]
    UnknownTarget(PeerId),
}

#[derive(Debug)]
pub struct JoinOutcome {
    pub existing: Vec<PeerSummary>,
    pub members: usize,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub removed: bool,
    pub remaining: usize,
    pub room_closed: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Serialize)]
pub struct RoomSnapshot {
    pub room: String,
    pub members: usize,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `peer` to `room`, creating the room if needed.
    ///
    /// The joiner's `joined` ack is queued before any `new_peer` notice goes
    /// out, so nothing another member sends in response can overtake it.
    pub fn join(
        &self,
        room: &str,
        peer: &PeerId,
        username: &str,
        sender: mpsc::Sender<Message>,
    ) -> JoinOutcome {
        let joined_seq = self.inner.join_seq.fetch_add(1, Ordering::Relaxed);
        let mut created = false;
        let mut entry = match self.inner.rooms.entry(room.to_string()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                created = true;
                entry.insert(Room::default())
            }
        };
        let state = entry.value_mut();

        let mut existing: Vec<(u64, PeerSummary)> = state
            .members
            .iter()
            .filter(|(id, _)| *id != peer)
            .map(|(id, member)| {
                (
                    member.joined_seq,
                    PeerSummary {
                        id: id.clone(),
                        username: member.username.clone(),
                    },
                )
            })
            .collect();
        existing.sort_by_key(|(seq, _)| *seq);
        let existing: Vec<PeerSummary> = existing.into_iter().map(|(_, peer)| peer).collect();

        let ack = Envelope::Joined {
            room: room.to_string(),
            id: peer.clone(),
            peers: existing.clone(),
        };
        if let Some(frame) = encode(&ack) {
            deliver(&sender, frame);
        }

        let notice = Envelope::NewPeer {
            room: room.to_string(),
            id: peer.clone(),
            username: Some(username.to_string()),
        };
        if let Some(frame) = encode(&notice) {
            for member in state.members.values() {
                deliver(&member.sender, frame.clone());
            }
        }

        state.members.insert(
            peer.clone(),
            Member {
                username: username.to_string(),
                sender,
                joined_seq,
            },
        );
        let members = state.members.len();
        drop(entry);

        if created {
            gauge!("bonfire_relay_rooms_active", self.room_count() as f64);
            info!(room = %room, "room created");
        }
        debug!(room = %room, peer_id = %peer, members, "peer joined room");

        JoinOutcome { existing, members }
    }

    /// Removes `peer` from `room` and tells the remaining members. Safe to
    /// call for a peer that already left.
    pub fn leave(&self, room: &str, peer: &PeerId) -> LeaveOutcome {
        let mut outcome = LeaveOutcome::default();

        if let Some(mut state) = self.inner.rooms.get_mut(room) {
            if state.members.remove(peer).is_some() {
                outcome.removed = true;
                let notice = Envelope::PeerLeft {
                    room: room.to_string(),
                    id: peer.clone(),
                };
                if let Some(frame) = encode(&notice) {
                    for member in state.members.values() {
                        deliver(&member.sender, frame.clone());
                    }
                }
            }
            outcome.remaining = state.members.len();
        }

        if outcome.removed && outcome.remaining == 0 {
            // A concurrent join may have repopulated the room since the guard
            // above was released; only an empty room is removed.
            outcome.room_closed = self
                .inner
                .rooms
                .remove_if(room, |_, state| state.members.is_empty())
                .is_some();
            if outcome.room_closed {
                gauge!("bonfire_relay_rooms_active", self.room_count() as f64);
                info!(room = %room, "room closed");
            }
        }

        outcome
    }

    /// Forwards an already-encoded frame from `from` to `target`, or to every
    /// other member of the room when no target is given.
    pub fn route(
        &self,
        room: &str,
        from: &PeerId,
        target: Option<&PeerId>,
        frame: &str,
    ) -> Result<Delivery, RouteError> {
        let not_member = || RouteError::NotMember {
            room: room.to_string(),
            peer: from.clone(),
        };
        let state = self.inner.rooms.get(room).ok_or_else(not_member)?;
        if !state.members.contains_key(from) {
            return Err(not_member());
        }

        let mut delivery = Delivery::default();
        let mut push = |member: &Member| {
            if deliver(&member.sender, frame.to_string()) {
                delivery.delivered += 1;
            } else {
                delivery.dropped += 1;
            }
        };

        match target {
            Some(target) => {
                let member = state
                    .members
                    .get(target)
                    .filter(|_| target != from)
                    .ok_or_else(|| RouteError::UnknownTarget(target.clone()))?;
                push(member);
            }
            None => {
                for (id, member) in state.members.iter() {
                    if id != from {
                        push(member);
                    }
                }
            }
        }

        Ok(delivery)
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    pub fn contains(&self, room: &str) -> bool {
        self.inner.rooms.contains_key(room)
    }

    pub fn members(&self, room: &str) -> Vec<PeerId> {
        self.inner
            .rooms
            .get(room)
            .map(|state| state.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<RoomSnapshot> {
        let mut rooms: Vec<RoomSnapshot> = self
            .inner
            .rooms
            .iter()
            .map(|entry| RoomSnapshot {
                room: entry.key().clone(),
                members: entry.value().members.len(),
            })
            .collect();
        rooms.sort_by(|a, b| a.room.cmp(&b.room));
        rooms
    }
}

fn encode(envelope: &Envelope) -> Option<String> {
    match envelope.to_json() {
        Ok(frame) => Some(frame),
        Err(err) => {
            warn!(kind = %envelope.kind(), error = %err, "failed to encode relay envelope");
            None
        }
    }
}

/// Queues a frame without waiting. A full queue drops the frame for that
/// connection only.
fn deliver(sender: &mpsc::Sender<Message>, frame: String) -> bool {
    match sender.try_send(Message::Text(frame)) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            counter!("bonfire_relay_frames_dropped_total", 1);
            warn!("connection queue full; dropping frame");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
