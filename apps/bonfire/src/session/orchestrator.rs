//! Per-session signaling state machine.
//!
//! The orchestrator owns every [`PeerLink`] and the [`ChannelRegistry`]. It
//! is driven by two inputs, envelopes forwarded by the relay and events raised
//! by the transport, and is only ever touched from the session actor, so none
//! of its state needs locking.

use std::{collections::HashMap, sync::Arc};

use bonfire_proto::{ChatEnvelope, Envelope, IceCandidate, PeerId, PeerSummary, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::link::{NegotiationPhase, PeerLink, SignalingState};
use super::{ChatMessage, ConnectionStatus, PeerStatus, SessionEvent};
use crate::config::ChatMode;
use crate::crypto::{MessageContext, MessageKind, SessionKey};
use crate::error::SessionError;
use crate::registry::{ChannelRegistry, Unregistered};
use crate::transport::{
    ConnectionState, LinkEvent, LinkEventSender, LinkId, LinkRole, TransportAdapter,
    TransportError,
};

/// Early candidates kept per sender before a link exists for it.
const MAX_EARLY_CANDIDATES: usize = 64;

/// Identity of the local peer inside its joined room.
pub(crate) struct SessionContext {
    pub mode: ChatMode,
    pub room: String,
    pub local_id: PeerId,
    pub username: String,
    pub key: SessionKey,
}

pub(crate) struct Orchestrator {
    mode: ChatMode,
    room: String,
    local_id: PeerId,
    username: String,
    key: SessionKey,
    adapter: Arc<dyn TransportAdapter>,
    link_events: LinkEventSender,
    signals: mpsc::UnboundedSender<Envelope>,
    events: mpsc::UnboundedSender<SessionEvent>,
    links: HashMap<LinkId, PeerLink>,
    by_peer: HashMap<PeerId, LinkId>,
    members: HashMap<PeerId, Option<String>>,
    early_candidates: HashMap<PeerId, Vec<IceCandidate>>,
    registry: ChannelRegistry,
    next_link: u64,
    next_message: u64,
    status: ConnectionStatus,
    ended: bool,
}

impl Orchestrator {
    /// Returns the orchestrator and the receiver its transport events arrive on.
    pub fn new(
        context: SessionContext,
        adapter: Arc<dyn TransportAdapter>,
        signals: mpsc::UnboundedSender<Envelope>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (link_events, link_rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            mode: context.mode,
            room: context.room,
            local_id: context.local_id,
            username: context.username,
            key: context.key,
            adapter,
            link_events,
            signals,
            events,
            links: HashMap::new(),
            by_peer: HashMap::new(),
            members: HashMap::new(),
            early_candidates: HashMap::new(),
            registry: ChannelRegistry::new(),
            next_link: 1,
            next_message: 0,
            status: ConnectionStatus::Connecting,
            ended: false,
        };
        (orchestrator, link_rx)
    }

    /// Seeds room membership from the join acknowledgement. A two-party peer
    /// that finds the room empty prepares the offering side right away and
    /// sends its offer once the counterpart shows up.
    pub async fn start(&mut self, existing: Vec<PeerSummary>) {
        for peer in existing {
            self.members.insert(peer.id, Some(peer.username));
        }
        self.emit(SessionEvent::Status(self.status));
        if self.mode == ChatMode::TwoParty && self.members.is_empty() {
            if let Err(err) = self.open_link(None, LinkRole::Offerer).await {
                warn!(target: "bonfire::signaling", error = %err, "failed to prepare offerer link");
            }
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn peers(&self) -> Vec<PeerStatus> {
        let mut peers: Vec<PeerStatus> = self
            .members
            .iter()
            .map(|(id, username)| PeerStatus {
                id: id.clone(),
                username: username.clone(),
                channel: self.registry.peer_state(id),
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    #[cfg(test)]
    pub fn link_state(&self, peer: &PeerId) -> Option<SignalingState> {
        self.by_peer
            .get(peer)
            .and_then(|id| self.links.get(id))
            .map(|link| link.state)
    }

    pub async fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), SessionError> {
        if self.ended {
            return Ok(());
        }
        if let Some(room) = envelope.room() {
            if room != self.room {
                return Err(SessionError::Protocol(format!(
                    "{} envelope for room {room} while joined to {}",
                    envelope.kind(),
                    self.room
                )));
            }
        }

        match envelope {
            Envelope::NewPeer { id, username, .. } => {
                self.on_new_peer(id, username).await;
            }
            Envelope::PeerLeft { id, .. } => {
                self.on_peer_left(id).await;
            }
            Envelope::Offer {
                from,
                username,
                offer,
                ..
            } => {
                let from = self.sender(from, "offer")?;
                self.remember(&from, username);
                self.on_offer(from, offer).await;
            }
            Envelope::Answer {
                from,
                username,
                answer,
                ..
            } => {
                let from = self.sender(from, "answer")?;
                self.remember(&from, username);
                self.on_answer(from, answer).await;
            }
            Envelope::Candidate {
                from, candidate, ..
            } => {
                let from = self.sender(from, "candidate")?;
                self.on_candidate(from, candidate).await;
            }
            Envelope::Error { message } => {
                warn!(target: "bonfire::signaling", room = %self.room, %message, "relay reported an error");
                self.emit(SessionEvent::RelayError { message });
            }
            Envelope::Joined { .. } => {
                debug!(target: "bonfire::signaling", "ignoring repeated join acknowledgement");
            }
            other @ (Envelope::Join { .. } | Envelope::Text(_) | Envelope::Reaction(_)) => {
                return Err(SessionError::Protocol(format!(
                    "relay forwarded a {} envelope",
                    other.kind()
                )));
            }
        }
        Ok(())
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        let id = event.link();
        if !self.links.contains_key(&id) {
            if let LinkEvent::Channel { channel, .. } = event {
                if let Err(err) = channel.close().await {
                    debug!(target: "bonfire::transport", link = %id, error = %err, "closing stray channel reported an error");
                }
            }
            trace!(target: "bonfire::signaling", link = %id, "ignoring event from retired link");
            return;
        }

        match event {
            LinkEvent::LocalCandidate { candidate, .. } => {
                let target = self.links.get(&id).and_then(|link| link.peer.clone());
                self.signal(Envelope::Candidate {
                    room: self.room.clone(),
                    from: None,
                    target,
                    candidate,
                });
            }
            LinkEvent::Channel { channel, .. } => {
                let mut peer = None;
                if let Some(link) = self.links.get_mut(&id) {
                    link.attach_channel(&channel);
                    peer = link.peer.clone();
                }
                debug!(target: "bonfire::signaling", link = %id, label = channel.label(), "channel registered");
                self.registry.register(id, peer, channel);
            }
            LinkEvent::ChannelOpen { .. } => {
                if self.registry.mark_open(id) {
                    let peer = self.links.get(&id).and_then(|link| link.peer.clone());
                    info!(target: "bonfire::signaling", link = %id, peer_id = ?peer, "data channel open");
                    self.set_status(ConnectionStatus::Connected);
                }
            }
            LinkEvent::ChannelMessage { text, .. } => {
                self.on_channel_message(id, &text);
            }
            LinkEvent::ChannelClosed { .. } => {
                if self.registry.mark_closed(id) {
                    debug!(target: "bonfire::signaling", link = %id, "data channel closed");
                    self.refresh_status();
                }
            }
            LinkEvent::ConnectionState { state, .. } => match state {
                ConnectionState::Failed | ConnectionState::Disconnected => {
                    warn!(target: "bonfire::signaling", link = %id, ?state, "peer connection lost");
                    self.drop_link(id, "peer connection lost").await;
                }
                other => {
                    debug!(target: "bonfire::signaling", link = %id, state = ?other, "peer connection state");
                }
            },
        }
    }

    /// Seals and sends a text message. Returns its id for later reactions.
    pub async fn send_text(&mut self, text: &str) -> Result<String, SessionError> {
        if self.ended {
            return Err(SessionError::Closed);
        }
        self.next_message += 1;
        let id = format!("{}:{}", self.local_id, self.next_message);
        self.send_chat(MessageKind::Text, id.clone(), text).await?;
        Ok(id)
    }

    pub async fn send_reaction(&mut self, message_id: &str, emoji: &str) -> Result<(), SessionError> {
        self.send_chat(MessageKind::Reaction, message_id.to_string(), emoji)
            .await
    }

    /// Closes every link and reports the session as ended. Idempotent.
    pub async fn shutdown(&mut self, reason: &str) {
        if self.ended {
            return;
        }
        self.ended = true;
        let ids: Vec<LinkId> = self.links.keys().copied().collect();
        for id in ids {
            self.close_link(id).await;
        }
        self.early_candidates.clear();
        self.set_status(ConnectionStatus::Disconnected);
        info!(target: "bonfire::signaling", room = %self.room, reason, "session ended");
        self.emit(SessionEvent::Ended {
            reason: reason.to_string(),
        });
    }

    async fn on_new_peer(&mut self, id: PeerId, username: Option<String>) {
        if id == self.local_id {
            return;
        }
        self.members.insert(id.clone(), username.clone());
        self.emit(SessionEvent::PeerJoined {
            id: id.clone(),
            username,
        });

        match self.mode {
            ChatMode::Group => {
                if self.by_peer.contains_key(&id) {
                    debug!(target: "bonfire::signaling", peer_id = %id, "already linked to announced peer");
                    return;
                }
                match self.open_link(Some(id.clone()), LinkRole::Offerer).await {
                    Ok(link) => self.send_offer(link).await,
                    Err(err) => {
                        warn!(target: "bonfire::signaling", peer_id = %id, error = %err, "failed to create link");
                    }
                }
            }
            ChatMode::TwoParty => match self.idle_unbound_link() {
                Some(link) => {
                    self.bind_peer(link, id);
                    self.send_offer(link).await;
                }
                None => {
                    debug!(target: "bonfire::signaling", peer_id = %id, "two-party room already has a counterpart");
                }
            },
        }
    }

    async fn on_peer_left(&mut self, id: PeerId) {
        self.members.remove(&id);
        self.early_candidates.remove(&id);
        self.emit(SessionEvent::PeerLeft { id: id.clone() });
        if let Some(link) = self.by_peer.get(&id).copied() {
            info!(target: "bonfire::signaling", peer_id = %id, link = %link, "peer left; closing link");
            self.drop_link(link, "peer left the room").await;
        }
    }

    async fn on_offer(&mut self, from: PeerId, offer: SessionDescription) {
        if let Some(existing) = self.by_peer.get(&from).copied() {
            let state = self.links.get(&existing).map(|link| link.state);
            match state {
                Some(SignalingState::Stable) => {
                    debug!(target: "bonfire::signaling", peer_id = %from, "renegotiating stable link");
                    self.answer(existing, from, offer).await;
                    return;
                }
                Some(SignalingState::Negotiating(NegotiationPhase::OfferSent)) => {
                    if self.local_id < from {
                        info!(target: "bonfire::signaling", peer_id = %from, "offer collision; keeping local offer");
                        return;
                    }
                    info!(target: "bonfire::signaling", peer_id = %from, "offer collision; answering remote offer");
                    self.close_link(existing).await;
                }
                Some(SignalingState::Idle) => {
                    self.close_link(existing).await;
                }
                _ => {
                    debug!(target: "bonfire::signaling", peer_id = %from, ?state, "ignoring offer for busy link");
                    return;
                }
            }
        } else if self.mode == ChatMode::TwoParty {
            if let Some(idle) = self.idle_unbound_link() {
                debug!(target: "bonfire::signaling", peer_id = %from, "switching to answerer");
                self.close_link(idle).await;
            } else if !self.links.is_empty() {
                warn!(target: "bonfire::signaling", peer_id = %from, "ignoring offer; two-party room already linked");
                return;
            }
        }

        match self.open_link(Some(from.clone()), LinkRole::Answerer).await {
            Ok(link) => self.answer(link, from, offer).await,
            Err(err) => {
                warn!(target: "bonfire::signaling", peer_id = %from, error = %err, "failed to create answering link");
            }
        }
    }

    async fn on_answer(&mut self, from: PeerId, answer: SessionDescription) {
        let Some(id) = self.by_peer.get(&from).copied() else {
            debug!(target: "bonfire::signaling", peer_id = %from, "answer from peer without a link");
            return;
        };
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        let state = link.state;
        match state {
            SignalingState::Negotiating(NegotiationPhase::OfferSent) => {
                let result = link.accept_answer(answer).await;
                match result {
                    Ok(()) => {
                        debug!(target: "bonfire::signaling", peer_id = %from, link = %id, "answer applied");
                    }
                    Err(err) => self.negotiation_failed(id, err).await,
                }
            }
            SignalingState::Stable => {
                debug!(target: "bonfire::signaling", peer_id = %from, "ignoring duplicate answer");
            }
            _ => {
                debug!(target: "bonfire::signaling", peer_id = %from, ?state, "ignoring unexpected answer");
            }
        }
    }

    async fn on_candidate(&mut self, from: PeerId, candidate: IceCandidate) {
        let Some(id) = self.by_peer.get(&from).copied() else {
            let queue = self.early_candidates.entry(from).or_default();
            if queue.len() < MAX_EARLY_CANDIDATES {
                queue.push(candidate);
            } else {
                warn!(target: "bonfire::signaling", "early candidate queue full; dropping candidate");
            }
            return;
        };
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        let result = link.add_candidate(candidate).await;
        if let Err(err) = result {
            self.negotiation_failed(id, err).await;
        }
    }

    fn on_channel_message(&mut self, id: LinkId, text: &str) {
        let peer = self.links.get(&id).and_then(|link| link.peer.clone());
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(target: "bonfire::signaling", link = %id, error = %err, "dropping malformed channel frame");
                return;
            }
        };
        let (kind, chat) = match envelope {
            Envelope::Text(chat) => (MessageKind::Text, chat),
            Envelope::Reaction(chat) => (MessageKind::Reaction, chat),
            other => {
                warn!(target: "bonfire::signaling", link = %id, kind = %other.kind(), "ignoring non-chat frame on data channel");
                return;
            }
        };
        if chat.room != self.room {
            warn!(target: "bonfire::signaling", link = %id, room = %chat.room, "dropping message for another room");
            return;
        }

        let context = MessageContext {
            kind,
            room: &chat.room,
            id: &chat.id,
            username: &chat.username,
        };
        match self.key.open(&context, &chat.data) {
            Ok(plaintext) => {
                let text = String::from_utf8_lossy(&plaintext).into_owned();
                self.emit(SessionEvent::Message(ChatMessage {
                    kind,
                    id: chat.id,
                    from: peer,
                    username: chat.username,
                    text,
                }));
            }
            Err(failure) => {
                let reason = failure.reason();
                let error = SessionError::from(failure);
                warn!(
                    target: "bonfire::signaling",
                    link = %id,
                    peer_id = ?peer,
                    reason,
                    error = %error,
                    "dropping message that failed authentication"
                );
            }
        }
    }

    async fn send_chat(
        &mut self,
        kind: MessageKind,
        id: String,
        body: &str,
    ) -> Result<(), SessionError> {
        if self.ended {
            return Err(SessionError::Closed);
        }
        let context = MessageContext {
            kind,
            room: &self.room,
            id: &id,
            username: &self.username,
        };
        let data = self.key.seal(&context, body.as_bytes())?;
        let chat = ChatEnvelope {
            room: self.room.clone(),
            id,
            username: self.username.clone(),
            from: Some(self.local_id.clone()),
            data,
        };
        let frame = match kind {
            MessageKind::Text => Envelope::Text(chat),
            MessageKind::Reaction => Envelope::Reaction(chat),
        }
        .to_json()?;

        match self.mode {
            ChatMode::Group => {
                let delivered = self.registry.broadcast(&frame).await;
                if delivered == 0 {
                    return Err(SessionError::NoOpenChannel);
                }
                trace!(target: "bonfire::signaling", delivered, kind = kind.as_str(), "chat frame sent");
            }
            ChatMode::TwoParty => {
                let peer = self
                    .links
                    .values()
                    .find_map(|link| link.peer.clone())
                    .ok_or(SessionError::NoOpenChannel)?;
                self.registry
                    .send_to(&peer, &frame)
                    .await
                    .map_err(|_| SessionError::NoOpenChannel)?;
            }
        }
        Ok(())
    }

    async fn open_link(
        &mut self,
        peer: Option<PeerId>,
        role: LinkRole,
    ) -> Result<LinkId, TransportError> {
        let id = LinkId(self.next_link);
        self.next_link += 1;
        let transport = self
            .adapter
            .create_link(id, role, self.link_events.clone())
            .await?;
        let mut link = PeerLink::new(id, peer.clone(), role, transport);
        if let Some(peer) = peer {
            for candidate in self.early_candidates.remove(&peer).unwrap_or_default() {
                link.queue_candidate(candidate);
            }
            self.by_peer.insert(peer, id);
        }
        debug!(target: "bonfire::signaling", link = %id, peer_id = ?link.peer, ?role, "link created");
        self.links.insert(id, link);
        Ok(id)
    }

    fn bind_peer(&mut self, id: LinkId, peer: PeerId) {
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        link.peer = Some(peer.clone());
        for candidate in self.early_candidates.remove(&peer).unwrap_or_default() {
            link.queue_candidate(candidate);
        }
        self.registry.bind_peer(id, peer.clone());
        self.by_peer.insert(peer, id);
    }

    fn idle_unbound_link(&self) -> Option<LinkId> {
        self.links
            .values()
            .find(|link| link.peer.is_none() && link.state == SignalingState::Idle)
            .map(|link| link.id)
    }

    async fn send_offer(&mut self, id: LinkId) {
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        let target = link.peer.clone();
        let result = link.create_offer().await;
        match result {
            Ok(offer) => {
                debug!(target: "bonfire::signaling", link = %id, peer_id = ?target, "sending offer");
                self.signal(Envelope::Offer {
                    room: self.room.clone(),
                    from: None,
                    target,
                    username: Some(self.username.clone()),
                    offer,
                });
            }
            Err(err) => self.negotiation_failed(id, err).await,
        }
    }

    async fn answer(&mut self, id: LinkId, from: PeerId, offer: SessionDescription) {
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        let result = link.accept_offer(offer).await;
        match result {
            Ok(answer) => {
                debug!(target: "bonfire::signaling", link = %id, peer_id = %from, "sending answer");
                self.signal(Envelope::Answer {
                    room: self.room.clone(),
                    from: None,
                    target: Some(from),
                    username: Some(self.username.clone()),
                    answer,
                });
            }
            Err(err) => self.negotiation_failed(id, err).await,
        }
    }

    async fn negotiation_failed(&mut self, id: LinkId, err: TransportError) {
        let peer = self.links.get(&id).and_then(|link| link.peer.clone());
        let error = SessionError::negotiation(peer.as_ref(), &err);
        warn!(target: "bonfire::signaling", link = %id, error = %error, "closing link after negotiation failure");
        self.drop_link(id, "negotiation failed").await;
    }

    /// Closes a link that failed or whose peer went away. A two-party session
    /// has nothing left after that and ends with it.
    async fn drop_link(&mut self, id: LinkId, reason: &str) {
        let Some(outcome) = self.close_link(id).await else {
            return;
        };
        match self.mode {
            ChatMode::TwoParty => self.shutdown(reason).await,
            ChatMode::Group => {
                if outcome.now_empty {
                    debug!(target: "bonfire::signaling", room = %self.room, "last channel removed");
                }
                self.refresh_status();
            }
        }
    }

    /// The one routine every close path funnels through. Returns `None` when
    /// the link was already gone.
    async fn close_link(&mut self, id: LinkId) -> Option<Unregistered> {
        let mut link = self.links.remove(&id)?;
        if let Some(peer) = &link.peer {
            if self.by_peer.get(peer) == Some(&id) {
                self.by_peer.remove(peer);
            }
        }
        link.close().await;
        let outcome = self.registry.unregister(id);
        debug!(
            target: "bonfire::signaling",
            link = %id,
            peer_id = ?link.peer,
            role = ?link.role,
            registry_empty = outcome.now_empty,
            "link closed"
        );
        Some(outcome)
    }

    /// Called after a channel closed or a link was removed. With no channel
    /// left open a group session is disconnected, even when it never got to
    /// connect; a two-party session only once it had been connected.
    fn refresh_status(&mut self) {
        if self.registry.open_count() > 0 {
            return;
        }
        let lost = match self.mode {
            ChatMode::Group => true,
            ChatMode::TwoParty => self.status == ConnectionStatus::Connected,
        };
        if lost {
            self.set_status(ConnectionStatus::Disconnected);
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        self.status = status;
        self.emit(SessionEvent::Status(status));
    }

    fn sender(&self, from: Option<PeerId>, kind: &str) -> Result<PeerId, SessionError> {
        from.ok_or_else(|| SessionError::Protocol(format!("{kind} envelope without a sender")))
    }

    fn remember(&mut self, peer: &PeerId, username: Option<String>) {
        let entry = self.members.entry(peer.clone()).or_insert(None);
        if username.is_some() {
            *entry = username;
        }
    }

    fn signal(&self, envelope: Envelope) {
        trace!(target: "bonfire::signaling", kind = %envelope.kind(), "sending signal");
        if self.signals.send(envelope).is_err() {
            debug!(target: "bonfire::signaling", "relay writer gone; dropping signal");
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ChannelState;
    use crate::transport::mock::{LinkOp, MemoryAdapter, MemoryNetwork};
    use crate::transport::PeerTransport;
    use bonfire_proto::SdpKind;

    struct Node {
        id: PeerId,
        orchestrator: Orchestrator,
        adapter: Arc<MemoryAdapter>,
        signals: mpsc::UnboundedReceiver<Envelope>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
    }

    impl Node {
        fn new(network: &MemoryNetwork, id: &str, mode: ChatMode, key: &SessionKey) -> Self {
            let adapter = Arc::new(MemoryAdapter::new(network));
            let (signal_tx, signals) = mpsc::unbounded_channel();
            let (event_tx, events) = mpsc::unbounded_channel();
            let context = SessionContext {
                mode,
                room: "lobby".into(),
                local_id: PeerId::from(id),
                username: id.to_uppercase(),
                key: key.clone(),
            };
            let (orchestrator, link_events) =
                Orchestrator::new(context, adapter.clone(), signal_tx, event_tx);
            Self {
                id: PeerId::from(id),
                orchestrator,
                adapter,
                signals,
                events,
                link_events,
            }
        }

        fn drain_events(&mut self) -> Vec<SessionEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    fn stamp(envelope: Envelope, sender: &PeerId) -> Envelope {
        let from = Some(sender.clone());
        match envelope {
            Envelope::Offer {
                room,
                target,
                username,
                offer,
                ..
            } => Envelope::Offer {
                room,
                from,
                target,
                username,
                offer,
            },
            Envelope::Answer {
                room,
                target,
                username,
                answer,
                ..
            } => Envelope::Answer {
                room,
                from,
                target,
                username,
                answer,
            },
            Envelope::Candidate {
                room,
                target,
                candidate,
                ..
            } => Envelope::Candidate {
                room,
                from,
                target,
                candidate,
            },
            other => other,
        }
    }

    fn target_of(envelope: &Envelope) -> Option<&PeerId> {
        match envelope {
            Envelope::Offer { target, .. }
            | Envelope::Answer { target, .. }
            | Envelope::Candidate { target, .. } => target.as_ref(),
            _ => None,
        }
    }

    /// Stands in for the relay: drains link events and signals until every
    /// node is quiet.
    async fn pump(nodes: &mut [Node]) {
        loop {
            let mut progressed = false;
            for node in nodes.iter_mut() {
                while let Ok(event) = node.link_events.try_recv() {
                    node.orchestrator.handle_link_event(event).await;
                    progressed = true;
                }
            }
            let mut deliveries = Vec::new();
            for (index, node) in nodes.iter_mut().enumerate() {
                while let Ok(envelope) = node.signals.try_recv() {
                    deliveries.push((index, stamp(envelope, &node.id)));
                }
            }
            for (sender, envelope) in deliveries {
                progressed = true;
                let target = target_of(&envelope).cloned();
                for index in 0..nodes.len() {
                    let addressed = match &target {
                        Some(target) => nodes[index].id == *target,
                        None => index != sender,
                    };
                    if addressed {
                        nodes[index]
                            .orchestrator
                            .handle_envelope(envelope.clone())
                            .await
                            .unwrap();
                    }
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn announce(id: &str) -> Envelope {
        Envelope::NewPeer {
            room: "lobby".into(),
            id: PeerId::from(id),
            username: Some(id.to_uppercase()),
        }
    }

    fn candidate(tag: &str) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{tag}"),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    /// Two group nodes "a" and "b", with "a" already in the room.
    async fn connected_pair(mode: ChatMode) -> (MemoryNetwork, Vec<Node>) {
        let network = MemoryNetwork::new();
        let key = SessionKey::generate();
        let mut a = Node::new(&network, "a", mode, &key);
        let mut b = Node::new(&network, "b", mode, &key);
        a.orchestrator.start(vec![]).await;
        b.orchestrator
            .start(vec![PeerSummary {
                id: "a".into(),
                username: "A".into(),
            }])
            .await;
        a.orchestrator.handle_envelope(announce("b")).await.unwrap();
        let mut nodes = vec![a, b];
        pump(&mut nodes).await;
        (network, nodes)
    }

    #[tokio::test]
    async fn candidates_before_the_offer_are_applied_after_it_in_order() {
        let network = MemoryNetwork::new();
        let remote = MemoryAdapter::new(&network);
        let (remote_events, _remote_rx) = mpsc::unbounded_channel();
        let remote_link = remote
            .create_link(LinkId(1), LinkRole::Offerer, remote_events)
            .await
            .unwrap();
        let offer = remote_link.create_offer().await.unwrap();

        let mut b = Node::new(&network, "b", ChatMode::Group, &SessionKey::generate());
        b.orchestrator.start(vec![]).await;
        for tag in ["1", "2"] {
            b.orchestrator
                .handle_envelope(Envelope::Candidate {
                    room: "lobby".into(),
                    from: Some("a".into()),
                    target: Some("b".into()),
                    candidate: candidate(tag),
                })
                .await
                .unwrap();
        }
        assert!(b.adapter.links().is_empty());

        b.orchestrator
            .handle_envelope(Envelope::Offer {
                room: "lobby".into(),
                from: Some("a".into()),
                target: Some("b".into()),
                username: Some("A".into()),
                offer,
            })
            .await
            .unwrap();

        let link = b.adapter.links()[0];
        assert_eq!(
            b.adapter.ops(link),
            vec![
                LinkOp::RemoteDescription(SdpKind::Offer),
                LinkOp::Candidate("candidate:1".into()),
                LinkOp::Candidate("candidate:2".into()),
                LinkOp::CreateAnswer,
            ]
        );
        match b.signals.try_recv().unwrap() {
            Envelope::Answer { target, .. } => assert_eq!(target, Some(PeerId::from("a"))),
            other => panic!("expected answer, got {other:?}"),
        }
        assert_eq!(b.orchestrator.link_state(&"a".into()), Some(SignalingState::Stable));
    }

    #[tokio::test]
    async fn group_new_peer_triggers_a_targeted_offer() {
        let network = MemoryNetwork::new();
        let mut a = Node::new(&network, "a", ChatMode::Group, &SessionKey::generate());
        a.orchestrator.start(vec![]).await;
        a.orchestrator.handle_envelope(announce("b")).await.unwrap();

        match a.signals.try_recv().unwrap() {
            Envelope::Offer {
                target, username, ..
            } => {
                assert_eq!(target, Some(PeerId::from("b")));
                assert_eq!(username.as_deref(), Some("A"));
            }
            other => panic!("expected offer, got {other:?}"),
        }
        assert_eq!(
            a.orchestrator.link_state(&"b".into()),
            Some(SignalingState::Negotiating(NegotiationPhase::OfferSent))
        );
        assert!(matches!(
            a.drain_events().as_slice(),
            [SessionEvent::Status(ConnectionStatus::Connecting), SessionEvent::PeerJoined { .. }]
        ));
    }

    #[tokio::test]
    async fn pair_connects_and_exchanges_sealed_text() {
        let (_network, mut nodes) = connected_pair(ChatMode::Group).await;
        assert_eq!(nodes[0].orchestrator.status(), ConnectionStatus::Connected);
        assert_eq!(nodes[1].orchestrator.status(), ConnectionStatus::Connected);

        let id = nodes[0].orchestrator.send_text("hello b").await.unwrap();
        assert_eq!(id, "a:1");
        pump(&mut nodes).await;

        let received: Vec<ChatMessage> = nodes[1]
            .drain_events()
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::Message(message) => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].text, "hello b");
        assert_eq!(received[0].username, "A");
        assert_eq!(received[0].from, Some(PeerId::from("a")));

        nodes[1].orchestrator.send_reaction(&id, "🔥").await.unwrap();
        pump(&mut nodes).await;
        assert!(nodes[0].drain_events().iter().any(|event| matches!(
            event,
            SessionEvent::Message(ChatMessage { kind: MessageKind::Reaction, id: reacted, text, .. })
                if reacted == "a:1" && text == "🔥"
        )));
    }

    #[tokio::test]
    async fn duplicate_answer_is_ignored() {
        let (_network, mut nodes) = connected_pair(ChatMode::Group).await;
        let link = nodes[0].adapter.links()[0];
        let answers_before = nodes[0]
            .adapter
            .ops(link)
            .iter()
            .filter(|op| matches!(op, LinkOp::RemoteDescription(SdpKind::Answer)))
            .count();
        assert_eq!(answers_before, 1);

        nodes[0]
            .orchestrator
            .handle_envelope(Envelope::Answer {
                room: "lobby".into(),
                from: Some("b".into()),
                target: Some("a".into()),
                username: None,
                answer: SessionDescription::answer("memory-endpoint:999"),
            })
            .await
            .unwrap();
        let answers_after = nodes[0]
            .adapter
            .ops(link)
            .iter()
            .filter(|op| matches!(op, LinkOp::RemoteDescription(SdpKind::Answer)))
            .count();
        assert_eq!(answers_after, 1);
        assert_eq!(nodes[0].orchestrator.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn offer_collision_keeps_the_smaller_peers_offer() {
        let network = MemoryNetwork::new();
        let key = SessionKey::generate();
        let mut a = Node::new(&network, "a", ChatMode::Group, &key);
        let mut b = Node::new(&network, "b", ChatMode::Group, &key);
        a.orchestrator.start(vec![]).await;
        b.orchestrator.start(vec![]).await;
        a.orchestrator.handle_envelope(announce("b")).await.unwrap();
        b.orchestrator.handle_envelope(announce("a")).await.unwrap();

        let mut nodes = vec![a, b];
        pump(&mut nodes).await;

        assert_eq!(nodes[0].orchestrator.link_state(&"b".into()), Some(SignalingState::Stable));
        assert_eq!(nodes[1].orchestrator.link_state(&"a".into()), Some(SignalingState::Stable));
        assert_eq!(nodes[0].orchestrator.status(), ConnectionStatus::Connected);
        assert_eq!(nodes[1].orchestrator.status(), ConnectionStatus::Connected);
        // "b" yielded: its first link was closed in favour of an answering one.
        let b_links = nodes[1].adapter.links();
        assert_eq!(b_links.len(), 2);
        assert_eq!(nodes[1].adapter.ops(b_links[0]).last(), Some(&LinkOp::Close));
        assert_eq!(nodes[0].adapter.links().len(), 1);
    }

    #[tokio::test]
    async fn negotiation_failure_only_closes_the_affected_link() {
        let (network, mut nodes) = connected_pair(ChatMode::Group).await;
        let c = MemoryAdapter::new(&network);
        let (c_events, _c_rx) = mpsc::unbounded_channel();
        let c_link = c
            .create_link(LinkId(1), LinkRole::Offerer, c_events)
            .await
            .unwrap();
        let offer = c_link.create_offer().await.unwrap();

        nodes[0].adapter.reject_remote_descriptions(true);
        nodes[0]
            .orchestrator
            .handle_envelope(Envelope::Offer {
                room: "lobby".into(),
                from: Some("c".into()),
                target: Some("a".into()),
                username: Some("C".into()),
                offer,
            })
            .await
            .unwrap();

        let a = &nodes[0].orchestrator;
        assert_eq!(a.link_state(&"c".into()), None);
        assert_eq!(a.link_state(&"b".into()), Some(SignalingState::Stable));
        assert!(!a.is_ended());
        assert_eq!(a.status(), ConnectionStatus::Connected);
        assert!(nodes[0].orchestrator.send_text("still fine").await.is_ok());
    }

    fn drain_link_events(node: &mut Node) -> Vec<LinkEvent> {
        let mut out = Vec::new();
        while let Ok(event) = node.link_events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn group_peer_leaving_before_its_channel_opens_disconnects() {
        let network = MemoryNetwork::new();
        let mut a = Node::new(&network, "a", ChatMode::Group, &SessionKey::generate());
        a.orchestrator.start(vec![]).await;
        a.orchestrator.handle_envelope(announce("b")).await.unwrap();
        for event in drain_link_events(&mut a) {
            a.orchestrator.handle_link_event(event).await;
        }
        assert_eq!(a.orchestrator.peers()[0].channel, Some(ChannelState::Connecting));

        a.orchestrator
            .handle_envelope(Envelope::PeerLeft {
                room: "lobby".into(),
                id: "b".into(),
            })
            .await
            .unwrap();

        assert!(a.orchestrator.peers().is_empty());
        assert_eq!(a.orchestrator.status(), ConnectionStatus::Disconnected);
        assert!(!a.orchestrator.is_ended());
        assert!(matches!(
            a.drain_events().as_slice(),
            [
                SessionEvent::Status(ConnectionStatus::Connecting),
                SessionEvent::PeerJoined { .. },
                SessionEvent::PeerLeft { .. },
                SessionEvent::Status(ConnectionStatus::Disconnected),
            ]
        ));
    }

    #[tokio::test]
    async fn group_link_failing_before_open_disconnects_without_ending() {
        let network = MemoryNetwork::new();
        let key = SessionKey::generate();
        let mut a = Node::new(&network, "a", ChatMode::Group, &key);
        a.orchestrator.start(vec![]).await;
        a.orchestrator.handle_envelope(announce("b")).await.unwrap();
        let link = a.adapter.links()[0];
        a.adapter.inject_state(link, ConnectionState::Failed);
        for event in drain_link_events(&mut a) {
            a.orchestrator.handle_link_event(event).await;
        }

        assert_eq!(a.orchestrator.link_state(&"b".into()), None);
        assert_eq!(a.orchestrator.status(), ConnectionStatus::Disconnected);
        assert!(!a.orchestrator.is_ended());

        // A later peer brings the session back.
        let mut c = Node::new(&network, "c", ChatMode::Group, &key);
        c.orchestrator.start(vec![]).await;
        a.orchestrator.handle_envelope(announce("c")).await.unwrap();
        let mut nodes = vec![a, c];
        pump(&mut nodes).await;
        assert_eq!(nodes[0].orchestrator.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn two_party_answerer_buffers_candidates_sent_ahead_of_the_offer() {
        let network = MemoryNetwork::new();
        let remote = MemoryAdapter::new(&network);
        let (remote_events, _remote_rx) = mpsc::unbounded_channel();
        let remote_link = remote
            .create_link(LinkId(1), LinkRole::Offerer, remote_events)
            .await
            .unwrap();
        let offer = remote_link.create_offer().await.unwrap();

        let mut b = Node::new(&network, "b", ChatMode::TwoParty, &SessionKey::generate());
        b.orchestrator
            .start(vec![PeerSummary {
                id: "a".into(),
                username: "A".into(),
            }])
            .await;
        assert!(b.adapter.links().is_empty());

        b.orchestrator
            .handle_envelope(Envelope::Candidate {
                room: "lobby".into(),
                from: Some("a".into()),
                target: None,
                candidate: candidate("early"),
            })
            .await
            .unwrap();
        b.orchestrator
            .handle_envelope(Envelope::Offer {
                room: "lobby".into(),
                from: Some("a".into()),
                target: None,
                username: Some("A".into()),
                offer,
            })
            .await
            .unwrap();

        let links = b.adapter.links();
        assert_eq!(links.len(), 1);
        assert_eq!(
            b.adapter.ops(links[0]),
            vec![
                LinkOp::RemoteDescription(SdpKind::Offer),
                LinkOp::Candidate("candidate:early".into()),
                LinkOp::CreateAnswer,
            ]
        );
        assert_eq!(b.orchestrator.link_state(&"a".into()), Some(SignalingState::Stable));
    }

    #[tokio::test]
    async fn two_party_transport_failure_ends_the_session() {
        let (_network, mut nodes) = connected_pair(ChatMode::TwoParty).await;
        assert_eq!(nodes[0].orchestrator.status(), ConnectionStatus::Connected);
        nodes[0].drain_events();

        let link = nodes[0].adapter.links()[0];
        nodes[0].adapter.inject_state(link, ConnectionState::Failed);
        pump(&mut nodes).await;

        assert!(nodes[0].orchestrator.is_ended());
        let events = nodes[0].drain_events();
        assert!(events
            .iter()
            .any(|event| matches!(event, SessionEvent::Status(ConnectionStatus::Disconnected))));
        assert!(matches!(events.last(), Some(SessionEvent::Ended { .. })));
        assert!(matches!(
            nodes[0].orchestrator.send_text("anyone?").await,
            Err(SessionError::Closed)
        ));
        // The far side saw its link drop too.
        assert!(nodes[1].orchestrator.is_ended());
    }

    #[tokio::test]
    async fn undecryptable_message_is_dropped_and_channel_stays_open() {
        let network = MemoryNetwork::new();
        let mut a = Node::new(&network, "a", ChatMode::Group, &SessionKey::generate());
        let mut b = Node::new(&network, "b", ChatMode::Group, &SessionKey::generate());
        a.orchestrator.start(vec![]).await;
        b.orchestrator.start(vec![]).await;
        a.orchestrator.handle_envelope(announce("b")).await.unwrap();
        let mut nodes = vec![a, b];
        pump(&mut nodes).await;
        nodes[1].drain_events();

        nodes[0].orchestrator.send_text("gibberish to b").await.unwrap();
        pump(&mut nodes).await;

        assert!(!nodes[1]
            .drain_events()
            .iter()
            .any(|event| matches!(event, SessionEvent::Message(_))));
        let b_peers = nodes[1].orchestrator.peers();
        assert_eq!(b_peers.len(), 1);
        assert_eq!(b_peers[0].channel, Some(ChannelState::Open));
        assert_eq!(nodes[1].orchestrator.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn envelopes_for_other_rooms_or_without_sender_are_protocol_errors() {
        let network = MemoryNetwork::new();
        let mut a = Node::new(&network, "a", ChatMode::Group, &SessionKey::generate());
        a.orchestrator.start(vec![]).await;

        let elsewhere = Envelope::NewPeer {
            room: "attic".into(),
            id: "b".into(),
            username: None,
        };
        assert!(matches!(
            a.orchestrator.handle_envelope(elsewhere).await,
            Err(SessionError::Protocol(_))
        ));
        let anonymous = Envelope::Candidate {
            room: "lobby".into(),
            from: None,
            target: None,
            candidate: candidate("x"),
        };
        assert!(matches!(
            a.orchestrator.handle_envelope(anonymous).await,
            Err(SessionError::Protocol(_))
        ));
        assert!(a.orchestrator.peers().is_empty());
    }
}
