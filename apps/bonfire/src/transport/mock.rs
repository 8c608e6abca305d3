//! In-process transport used by tests.
//!
//! A [`MemoryNetwork`] is shared by every [`MemoryAdapter`] taking part in a
//! test. Descriptions carry the endpoint number of their creator, so applying
//! an answer on the offerer side pairs the two endpoints and opens their
//! channels. Candidates are accepted only after a remote description exists,
//! which turns any ordering mistake in the orchestrator into a hard error.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bonfire_proto::{IceCandidate, SdpKind, SessionDescription};
use parking_lot::Mutex;

use super::{
    ConnectionState, DataChannel, LinkEvent, LinkEventSender, LinkId, LinkRole, PeerTransport,
    TransportAdapter, TransportError,
};

const SDP_PREFIX: &str = "memory-endpoint:";
const CHANNEL_LABEL: &str = "chat";

/// Operations observed on one link, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    CreateOffer,
    CreateAnswer,
    RemoteDescription(SdpKind),
    Candidate(String),
    Close,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    next_endpoint: u64,
    endpoints: HashMap<u64, Endpoint>,
}

struct Endpoint {
    link: LinkId,
    role: LinkRole,
    events: LinkEventSender,
    remote: Option<u64>,
    channel_open: bool,
    closed: bool,
    ops: Vec<LinkOp>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, link: LinkId, role: LinkRole, events: LinkEventSender) -> u64 {
        let mut state = self.inner.lock();
        state.next_endpoint += 1;
        let endpoint = state.next_endpoint;
        state.endpoints.insert(
            endpoint,
            Endpoint {
                link,
                role,
                events,
                remote: None,
                channel_open: false,
                closed: false,
                ops: Vec::new(),
            },
        );
        endpoint
    }

    fn ops(&self, endpoint: u64) -> Vec<LinkOp> {
        self.inner
            .lock()
            .endpoints
            .get(&endpoint)
            .map(|ep| ep.ops.clone())
            .unwrap_or_default()
    }

    fn emit(&self, endpoint: u64, event: LinkEvent) {
        if let Some(ep) = self.inner.lock().endpoints.get(&endpoint) {
            let _ = ep.events.send(event);
        }
    }
}

impl NetworkState {
    fn endpoint(&mut self, endpoint: u64) -> Result<&mut Endpoint, TransportError> {
        match self.endpoints.get_mut(&endpoint) {
            Some(ep) if !ep.closed => Ok(ep),
            _ => Err(TransportError::LinkClosed),
        }
    }
}

impl MemoryNetwork {
    /// Pairs offerer and answerer once the answer lands: both report
    /// `Connected`, the answerer learns about its channel, then both open.
    fn connect(&self, offerer: u64, answerer: u64) {
        let mut state = self.inner.lock();
        let live = |state: &NetworkState, id: u64| {
            state.endpoints.get(&id).is_some_and(|ep| !ep.closed)
        };
        if !live(&*state, offerer) || !live(&*state, answerer) {
            return;
        }
        for id in [offerer, answerer] {
            if let Some(ep) = state.endpoints.get(&id) {
                let _ = ep.events.send(LinkEvent::ConnectionState {
                    link: ep.link,
                    state: ConnectionState::Connected,
                });
            }
        }
        if let Some(ep) = state.endpoints.get(&answerer) {
            let _ = ep.events.send(LinkEvent::Channel {
                link: ep.link,
                channel: Arc::new(MemoryChannel {
                    network: self.clone(),
                    endpoint: answerer,
                }),
            });
        }
        for id in [offerer, answerer] {
            if let Some(ep) = state.endpoints.get_mut(&id) {
                ep.channel_open = true;
                let _ = ep.events.send(LinkEvent::ChannelOpen { link: ep.link });
            }
        }
    }
}

/// [`TransportAdapter`] over a shared [`MemoryNetwork`].
pub struct MemoryAdapter {
    network: MemoryNetwork,
    links: Mutex<HashMap<LinkId, u64>>,
    reject_descriptions: Arc<AtomicBool>,
}

impl MemoryAdapter {
    pub fn new(network: &MemoryNetwork) -> Self {
        Self {
            network: network.clone(),
            links: Mutex::new(HashMap::new()),
            reject_descriptions: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Every link this adapter created, oldest first.
    pub fn links(&self) -> Vec<LinkId> {
        let mut links: Vec<LinkId> = self.links.lock().keys().copied().collect();
        links.sort();
        links
    }

    pub fn ops(&self, link: LinkId) -> Vec<LinkOp> {
        match self.links.lock().get(&link) {
            Some(endpoint) => self.network.ops(*endpoint),
            None => Vec::new(),
        }
    }

    /// Makes every later `apply_remote_description` on this adapter's links fail.
    pub fn reject_remote_descriptions(&self, reject: bool) {
        self.reject_descriptions.store(reject, Ordering::SeqCst);
    }

    /// Delivers a connection-state change to one of this adapter's links as if
    /// the underlying transport had reported it.
    pub fn inject_state(&self, link: LinkId, state: ConnectionState) {
        if let Some(endpoint) = self.links.lock().get(&link).copied() {
            self.network
                .emit(endpoint, LinkEvent::ConnectionState { link, state });
        }
    }
}

#[async_trait]
impl TransportAdapter for MemoryAdapter {
    async fn create_link(
        &self,
        link: LinkId,
        role: LinkRole,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let endpoint = self.network.register(link, role, events.clone());
        self.links.lock().insert(link, endpoint);

        if role == LinkRole::Offerer {
            let _ = events.send(LinkEvent::Channel {
                link,
                channel: Arc::new(MemoryChannel {
                    network: self.network.clone(),
                    endpoint,
                }),
            });
        }

        Ok(Arc::new(MemoryLink {
            link,
            endpoint,
            network: self.network.clone(),
            reject_descriptions: Arc::clone(&self.reject_descriptions),
        }))
    }
}

struct MemoryLink {
    link: LinkId,
    endpoint: u64,
    network: MemoryNetwork,
    reject_descriptions: Arc<AtomicBool>,
}

impl MemoryLink {
    fn local_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:memory {} 1 udp 1 127.0.0.1 9 typ host", self.endpoint),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

#[async_trait]
impl PeerTransport for MemoryLink {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        {
            let mut state = self.network.inner.lock();
            state.endpoint(self.endpoint)?.ops.push(LinkOp::CreateOffer);
        }
        self.network.emit(
            self.endpoint,
            LinkEvent::LocalCandidate {
                link: self.link,
                candidate: self.local_candidate(),
            },
        );
        Ok(SessionDescription::offer(format!("{SDP_PREFIX}{}", self.endpoint)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        {
            let mut state = self.network.inner.lock();
            let ep = state.endpoint(self.endpoint)?;
            if ep.remote.is_none() {
                return Err(TransportError::Negotiation(
                    "cannot answer without a remote offer".into(),
                ));
            }
            ep.ops.push(LinkOp::CreateAnswer);
        }
        self.network.emit(
            self.endpoint,
            LinkEvent::LocalCandidate {
                link: self.link,
                candidate: self.local_candidate(),
            },
        );
        Ok(SessionDescription::answer(format!("{SDP_PREFIX}{}", self.endpoint)))
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        if self.reject_descriptions.load(Ordering::SeqCst) {
            return Err(TransportError::Negotiation(
                "remote description rejected".into(),
            ));
        }
        let remote: u64 = description
            .sdp
            .strip_prefix(SDP_PREFIX)
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| TransportError::Negotiation("unrecognised description".into()))?;

        let pair = {
            let mut state = self.network.inner.lock();
            let ep = state.endpoint(self.endpoint)?;
            ep.ops.push(LinkOp::RemoteDescription(description.kind));
            ep.remote = Some(remote);
            (description.kind == SdpKind::Answer && ep.role == LinkRole::Offerer)
                .then_some((self.endpoint, remote))
        };
        if let Some((offerer, answerer)) = pair {
            self.network.connect(offerer, answerer);
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.network.inner.lock();
        let ep = state.endpoint(self.endpoint)?;
        if ep.remote.is_none() {
            return Err(TransportError::Negotiation(
                "candidate applied before remote description".into(),
            ));
        }
        ep.ops.push(LinkOp::Candidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.network.inner.lock();
        let remote = match state.endpoints.get_mut(&self.endpoint) {
            Some(ep) if !ep.closed => {
                ep.closed = true;
                ep.channel_open = false;
                ep.ops.push(LinkOp::Close);
                ep.remote
            }
            _ => return,
        };
        if let Some(peer) = remote.and_then(|id| state.endpoints.get_mut(&id)) {
            if peer.closed {
                return;
            }
            if peer.channel_open {
                peer.channel_open = false;
                let _ = peer.events.send(LinkEvent::ChannelClosed { link: peer.link });
            }
            let _ = peer.events.send(LinkEvent::ConnectionState {
                link: peer.link,
                state: ConnectionState::Disconnected,
            });
        }
    }
}

struct MemoryChannel {
    network: MemoryNetwork,
    endpoint: u64,
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        CHANNEL_LABEL
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let state = self.network.inner.lock();
        let local = state
            .endpoints
            .get(&self.endpoint)
            .filter(|ep| ep.channel_open && !ep.closed)
            .ok_or(TransportError::ChannelClosed)?;
        let peer = local
            .remote
            .and_then(|id| state.endpoints.get(&id))
            .filter(|ep| ep.channel_open && !ep.closed)
            .ok_or(TransportError::ChannelClosed)?;
        peer.events
            .send(LinkEvent::ChannelMessage {
                link: peer.link,
                text,
            })
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.network.inner.lock();
        let remote = match state.endpoints.get_mut(&self.endpoint) {
            Some(ep) if ep.channel_open => {
                ep.channel_open = false;
                let _ = ep.events.send(LinkEvent::ChannelClosed { link: ep.link });
                ep.remote
            }
            _ => return Ok(()),
        };
        if let Some(peer) = remote.and_then(|id| state.endpoints.get_mut(&id)) {
            if peer.channel_open {
                peer.channel_open = false;
                let _ = peer.events.send(LinkEvent::ChannelClosed { link: peer.link });
            }
        }
        Ok(())
    }
}
