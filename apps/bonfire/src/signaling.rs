use std::time::Duration;

use bonfire_proto::{Envelope, PeerId, PeerSummary, ProtoError};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::SessionError;
use crate::transport::TransportError;

type Inbound = Result<Envelope, ProtoError>;

/// A joined relay connection. Reading and writing run on their own tasks so
/// the session actor only deals in envelopes.
pub struct RelayLink {
    local_id: PeerId,
    room: String,
    peers: Vec<PeerSummary>,
    outbound: mpsc::UnboundedSender<Envelope>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    close_tx: Option<oneshot::Sender<()>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RelayLink {
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// The room actually joined; the relay picks one when asked for a blank room.
    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn take_peers(&mut self) -> Vec<PeerSummary> {
        std::mem::take(&mut self.peers)
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<Envelope> {
        self.outbound.clone()
    }

    /// Next frame from the relay. `None` once the socket is gone.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    /// Sends a close frame and waits briefly for the writer to finish.
    pub async fn close(&mut self) {
        let Some(close_tx) = self.close_tx.take() else {
            return;
        };
        let _ = close_tx.send(());
        if timeout(Duration::from_secs(1), &mut self.writer).await.is_err() {
            self.writer.abort();
        }
        self.reader.abort();
        debug!(target: "bonfire::signaling", room = %self.room, "relay connection closed");
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn validate_url(raw: &str) -> Result<Url, SessionError> {
    let url = Url::parse(raw)
        .map_err(|err| TransportError::Setup(format!("invalid relay url {raw}: {err}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(TransportError::Setup(format!("relay url must be ws:// or wss://, got {other}://")).into()),
    }
}

/// Connects to the relay, joins `room` and waits for the acknowledgement.
pub async fn join_relay(
    relay_url: &str,
    room: &str,
    username: &str,
    connect_timeout: Duration,
    join_timeout: Duration,
) -> Result<RelayLink, SessionError> {
    let url = validate_url(relay_url)?;
    let (socket, _) = match timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(err)) => {
            return Err(TransportError::Connection(format!("relay connect failed: {err}")).into())
        }
        Err(_) => {
            return Err(TransportError::Timeout(format!("connecting to {url}")).into());
        }
    };
    debug!(target: "bonfire::signaling", url = %url, "relay websocket connected");
    let (mut ws_write, mut ws_read) = socket.split();

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
    let (inbound_tx, mut inbound) = mpsc::unbounded_channel::<Inbound>();
    let (close_tx, mut close_rx) = oneshot::channel::<()>();

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                envelope = outbound_rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    let text = match envelope.to_json() {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(target: "bonfire::signaling", error = %err, "failed to encode envelope");
                            continue;
                        }
                    };
                    trace!(target: "bonfire::signaling", kind = %envelope.kind(), len = text.len(), "relay frame out");
                    if ws_write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = &mut close_rx => break,
            }
        }
        let _ = ws_write.send(Message::Close(None)).await;
        let _ = ws_write.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(frame) = ws_read.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    trace!(target: "bonfire::signaling", len = text.len(), "relay frame in");
                    if inbound_tx.send(Envelope::from_json(&text)).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(target: "bonfire::signaling", error = %err, "relay socket error");
                    break;
                }
            }
        }
    });

    let join = Envelope::Join {
        room: room.to_string(),
        username: username.to_string(),
    };
    if outbound.send(join).is_err() {
        return Err(TransportError::Connection("relay writer stopped before join".into()).into());
    }

    let acknowledgement = timeout(join_timeout, async {
        loop {
            match inbound.recv().await {
                Some(Ok(Envelope::Joined { room, id, peers })) => return Ok((room, id, peers)),
                Some(Ok(Envelope::Error { message })) => return Err(SessionError::Rejected(message)),
                Some(Ok(other)) => {
                    debug!(target: "bonfire::signaling", kind = %other.kind(), "ignoring frame before join acknowledgement");
                }
                Some(Err(err)) => {
                    warn!(target: "bonfire::signaling", error = %err, "ignoring malformed relay frame");
                }
                None => {
                    return Err(TransportError::Connection("relay closed before join".into()).into())
                }
            }
        }
    })
    .await;

    let (room, local_id, peers) = match acknowledgement {
        Ok(Ok(joined)) => joined,
        Ok(Err(err)) => {
            reader.abort();
            writer.abort();
            return Err(err);
        }
        Err(_) => {
            reader.abort();
            writer.abort();
            return Err(TransportError::Timeout("waiting for join acknowledgement".into()).into());
        }
    };
    debug!(target: "bonfire::signaling", %room, peer_id = %local_id, existing = peers.len(), "joined room");

    Ok(RelayLink {
        local_id,
        room,
        peers,
        outbound,
        inbound,
        close_tx: Some(close_tx),
        reader,
        writer,
    })
}
