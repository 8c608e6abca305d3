//! Caller-owned chat session.
//!
//! [`Session::join`] connects to the relay, joins the room and derives the
//! room key, then hands the rest of the session's life to a single actor task
//! that owns the signaling [`orchestrator`]. The returned [`Session`] talks to
//! that actor over a command channel; dropping it ends the session.

use std::sync::Arc;

use bonfire_proto::PeerId;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{ChatMode, SessionConfig};
use crate::crypto::{CryptoError, MessageKind, SessionKey};
use crate::error::SessionError;
use crate::registry::ChannelState;
use crate::signaling::{join_relay, RelayLink};
use crate::transport::{LinkEvent, TransportAdapter};

pub mod link;
pub(crate) mod orchestrator;

use orchestrator::{Orchestrator, SessionContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub kind: MessageKind,
    /// For reactions, the id of the message reacted to.
    pub id: String,
    pub from: Option<PeerId>,
    pub username: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Status(ConnectionStatus),
    Message(ChatMessage),
    PeerJoined {
        id: PeerId,
        username: Option<String>,
    },
    PeerLeft {
        id: PeerId,
    },
    RelayError {
        message: String,
    },
    Ended {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub id: PeerId,
    pub username: Option<String>,
    pub channel: Option<ChannelState>,
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

enum Command {
    SendText {
        text: String,
        reply: oneshot::Sender<Result<String, SessionError>>,
    },
    SendReaction {
        message_id: String,
        emoji: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Status {
        reply: oneshot::Sender<ConnectionStatus>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerStatus>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

pub struct Session {
    local_id: PeerId,
    room: String,
    mode: ChatMode,
    commands: mpsc::UnboundedSender<Command>,
}

impl Session {
    /// Joins the configured room and starts negotiating with its members.
    pub async fn join(
        config: SessionConfig,
        adapter: Arc<dyn TransportAdapter>,
    ) -> Result<(Session, SessionEvents), SessionError> {
        if config.passphrase.is_empty() {
            return Err(CryptoError::EmptyPassphrase.into());
        }

        let mut relay = join_relay(
            &config.relay_url,
            config.room.trim(),
            config.username.trim(),
            config.connect_timeout,
            config.join_timeout,
        )
        .await?;
        let room = relay.room().to_string();
        let local_id = relay.local_id().clone();

        let passphrase = config.passphrase.clone();
        let key_room = room.clone();
        let key = tokio::task::spawn_blocking(move || SessionKey::derive(&passphrase, &key_room))
            .await
            .map_err(|err| CryptoError::KeyDerivation(err.to_string()))??;

        let (events_tx, events) = mpsc::unbounded_channel();
        let (orchestrator, link_events) = Orchestrator::new(
            SessionContext {
                mode: config.mode,
                room: room.clone(),
                local_id: local_id.clone(),
                username: config.username.trim().to_string(),
                key,
            },
            adapter,
            relay.sender(),
            events_tx,
        );
        let existing = relay.take_peers();
        info!(
            target: "bonfire::signaling",
            %room,
            peer_id = %local_id,
            mode = ?config.mode,
            existing = existing.len(),
            "joined room"
        );

        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(orchestrator, existing, relay, command_rx, link_events));

        Ok((
            Session {
                local_id,
                room,
                mode: config.mode,
                commands,
            },
            events,
        ))
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn mode(&self) -> ChatMode {
        self.mode
    }

    /// Seals and sends a text message, returning its id.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<String, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::SendText {
            text: text.into(),
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn send_reaction(
        &self,
        message_id: impl Into<String>,
        emoji: impl Into<String>,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::SendReaction {
            message_id: message_id.into(),
            emoji: emoji.into(),
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn status(&self) -> ConnectionStatus {
        let (reply, rx) = oneshot::channel();
        if self.request(Command::Status { reply }).is_err() {
            return ConnectionStatus::Disconnected;
        }
        rx.await.unwrap_or(ConnectionStatus::Disconnected)
    }

    pub async fn peers(&self) -> Vec<PeerStatus> {
        let (reply, rx) = oneshot::channel();
        if self.request(Command::Peers { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Closes every link and then the relay socket. Calling it again, or
    /// after the session ended on its own, does nothing.
    pub async fn leave(&self) {
        let (reply, rx) = oneshot::channel();
        if self.request(Command::Leave { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    fn request(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }
}

async fn run(
    mut orchestrator: Orchestrator,
    existing: Vec<bonfire_proto::PeerSummary>,
    mut relay: RelayLink,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
) {
    orchestrator.start(existing).await;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::SendText { text, reply }) => {
                    let _ = reply.send(orchestrator.send_text(&text).await);
                }
                Some(Command::SendReaction { message_id, emoji, reply }) => {
                    let _ = reply.send(orchestrator.send_reaction(&message_id, &emoji).await);
                }
                Some(Command::Status { reply }) => {
                    let _ = reply.send(orchestrator.status());
                }
                Some(Command::Peers { reply }) => {
                    let _ = reply.send(orchestrator.peers());
                }
                Some(Command::Leave { reply }) => {
                    orchestrator.shutdown("left the room").await;
                    relay.close().await;
                    let _ = reply.send(());
                    break;
                }
                None => {
                    orchestrator.shutdown("session dropped").await;
                    break;
                }
            },
            inbound = relay.recv() => match inbound {
                Some(Ok(envelope)) => {
                    if let Err(err) = orchestrator.handle_envelope(envelope).await {
                        warn!(target: "bonfire::signaling", error = %err, "dropping relay envelope");
                    }
                }
                Some(Err(err)) => {
                    warn!(target: "bonfire::signaling", error = %err, "dropping malformed relay frame");
                }
                None => {
                    warn!(target: "bonfire::signaling", "relay connection lost");
                    orchestrator.shutdown("relay connection lost").await;
                    break;
                }
            },
            Some(event) = link_events.recv() => {
                orchestrator.handle_link_event(event).await;
            }
        }

        if orchestrator.is_ended() {
            break;
        }
    }

    relay.close().await;
    debug!(target: "bonfire::signaling", "session actor stopped");
}
