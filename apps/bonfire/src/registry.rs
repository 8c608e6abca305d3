//! Channel bookkeeping for one session.
//!
//! Entries are indexed by link, with a secondary index by remote peer so
//! registering, unregistering and addressed sends are all map lookups.

use std::{collections::HashMap, sync::Arc};

use bonfire_proto::PeerId;
use tracing::{debug, warn};

use crate::transport::{DataChannel, LinkId, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

pub struct ChannelEntry {
    pub link: LinkId,
    pub peer: Option<PeerId>,
    pub state: ChannelState,
    channel: Arc<dyn DataChannel>,
}

/// Result of [`ChannelRegistry::unregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Unregistered {
    pub removed: bool,
    /// Set only by the call that removed the last entry.
    pub now_empty: bool,
}

#[derive(Default)]
pub struct ChannelRegistry {
    entries: HashMap<LinkId, ChannelEntry>,
    by_peer: HashMap<PeerId, LinkId>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a channel in the `Connecting` state. Re-registering a link
    /// replaces its channel and resets it.
    pub fn register(&mut self, link: LinkId, peer: Option<PeerId>, channel: Arc<dyn DataChannel>) {
        if let Some(peer) = &peer {
            if let Some(previous) = self.by_peer.insert(peer.clone(), link) {
                if previous != link {
                    self.entries.remove(&previous);
                }
            }
        }
        self.entries.insert(
            link,
            ChannelEntry {
                link,
                peer,
                state: ChannelState::Connecting,
                channel,
            },
        );
    }

    /// Binds a peer to a channel registered before the peer was known.
    pub fn bind_peer(&mut self, link: LinkId, peer: PeerId) {
        if let Some(entry) = self.entries.get_mut(&link) {
            entry.peer = Some(peer.clone());
            self.by_peer.insert(peer, link);
        }
    }

    /// Moves a channel from `Connecting` to `Open`. Returns false for unknown
    /// links and for channels that already moved on.
    pub fn mark_open(&mut self, link: LinkId) -> bool {
        match self.entries.get_mut(&link) {
            Some(entry) if entry.state == ChannelState::Connecting => {
                entry.state = ChannelState::Open;
                true
            }
            _ => false,
        }
    }

    /// Marks a channel the transport reported closed. The entry stays visible
    /// as `Closed` until its link is unregistered.
    pub fn mark_closed(&mut self, link: LinkId) -> bool {
        match self.entries.get_mut(&link) {
            Some(entry) if entry.state != ChannelState::Closed => {
                entry.state = ChannelState::Closed;
                true
            }
            _ => false,
        }
    }

    pub fn unregister(&mut self, link: LinkId) -> Unregistered {
        let Some(entry) = self.entries.remove(&link) else {
            return Unregistered::default();
        };
        if let Some(peer) = &entry.peer {
            if self.by_peer.get(peer) == Some(&link) {
                self.by_peer.remove(peer);
            }
        }
        debug!(target: "bonfire::signaling", %link, peer = ?entry.peer, "channel unregistered");
        Unregistered {
            removed: true,
            now_empty: self.entries.is_empty(),
        }
    }

    /// Sends `payload` on every open channel. Returns how many accepted it.
    pub async fn broadcast(&self, payload: &str) -> usize {
        let mut delivered = 0;
        for entry in self.entries.values() {
            if entry.state != ChannelState::Open {
                continue;
            }
            match entry.channel.send_text(payload.to_string()).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(target: "bonfire::signaling", link = %entry.link, error = %err, "broadcast send failed");
                }
            }
        }
        delivered
    }

    /// Sends on the channel bound to `peer`; a two-party session has only one.
    pub async fn send_to(&self, peer: &PeerId, payload: &str) -> Result<(), TransportError> {
        let entry = self
            .by_peer
            .get(peer)
            .and_then(|link| self.entries.get(link))
            .filter(|entry| entry.state == ChannelState::Open)
            .ok_or(TransportError::ChannelClosed)?;
        entry.channel.send_text(payload.to_string()).await
    }

    pub fn state(&self, link: LinkId) -> Option<ChannelState> {
        self.entries.get(&link).map(|entry| entry.state)
    }

    pub fn peer_state(&self, peer: &PeerId) -> Option<ChannelState> {
        self.by_peer.get(peer).and_then(|link| self.state(*link))
    }

    pub fn open_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.state == ChannelState::Open)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
