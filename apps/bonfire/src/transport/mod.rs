//! Peer transport seam.
//!
//! The signaling orchestrator only talks to these traits. [`webrtc`] drives
//! real peer connections; [`mock`] is an in-process pair used by tests.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bonfire_proto::{IceCandidate, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mock;
pub mod webrtc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("timed out {0}")]
    Timeout(String),
    #[error("data channel is not open")]
    ChannelClosed,
    #[error("link is closed")]
    LinkClosed,
}

/// Session-local identifier of one peer link. Never reused within a session,
/// so events from a replaced link can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

pub enum LinkEvent {
    LocalCandidate {
        link: LinkId,
        candidate: IceCandidate,
    },
    /// A data channel was created locally (offerer) or accepted (answerer).
    Channel {
        link: LinkId,
        channel: Arc<dyn DataChannel>,
    },
    ChannelOpen {
        link: LinkId,
    },
    ChannelMessage {
        link: LinkId,
        text: String,
    },
    ChannelClosed {
        link: LinkId,
    },
    ConnectionState {
        link: LinkId,
        state: ConnectionState,
    },
}

impl LinkEvent {
    pub fn link(&self) -> LinkId {
        match self {
            LinkEvent::LocalCandidate { link, .. }
            | LinkEvent::Channel { link, .. }
            | LinkEvent::ChannelOpen { link }
            | LinkEvent::ChannelMessage { link, .. }
            | LinkEvent::ChannelClosed { link }
            | LinkEvent::ConnectionState { link, .. } => *link,
        }
    }
}

impl fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::LocalCandidate { link, candidate } => f
                .debug_struct("LocalCandidate")
                .field("link", link)
                .field("candidate", &candidate.candidate)
                .finish(),
            LinkEvent::Channel { link, channel } => f
                .debug_struct("Channel")
                .field("link", link)
                .field("label", &channel.label())
                .finish(),
            LinkEvent::ChannelOpen { link } => f.debug_struct("ChannelOpen").field("link", link).finish(),
            LinkEvent::ChannelMessage { link, text } => f
                .debug_struct("ChannelMessage")
                .field("link", link)
                .field("bytes", &text.len())
                .finish(),
            LinkEvent::ChannelClosed { link } => {
                f.debug_struct("ChannelClosed").field("link", link).finish()
            }
            LinkEvent::ConnectionState { link, state } => f
                .debug_struct("ConnectionState")
                .field("link", link)
                .field("state", state)
                .finish(),
        }
    }
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// An ordered text channel running over an established link.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// One negotiated (or negotiating) connection to a single remote peer.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Creates an answer to the applied remote offer and installs it locally.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Must only be called once a remote description has been applied.
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Tears the link down. Calling it again does nothing.
    async fn close(&self);
}

#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Builds a new link. Offerers create their data channel immediately;
    /// answerers announce theirs through [`LinkEvent::Channel`] once the
    /// remote side opens it. All events for the link go to `events`.
    async fn create_link(
        &self,
        link: LinkId,
        role: LinkRole,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
