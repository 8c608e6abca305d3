use std::{net::SocketAddr, sync::Arc, time::Duration};

use bonfire_proto::{Envelope, PeerId};
use bonfire_relay::{serve, RelayConfig, RelayState};
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Relay {
    addr: SocketAddr,
    state: Arc<RelayState>,
    _shutdown: oneshot::Sender<()>,
}

async fn start_relay() -> Relay {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(RelayState::new(RelayConfig::default(), None));
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let serve_state = state.clone();
    tokio::spawn(async move {
        let _ = serve(listener, serve_state, async {
            let _ = shutdown_rx.await;
        })
        .await;
    });
    Relay {
        addr,
        state,
        _shutdown: shutdown_tx,
    }
}

async fn connect(relay: &Relay) -> Socket {
    let (socket, _) = connect_async(format!("ws://{}/ws", relay.addr))
        .await
        .unwrap();
    socket
}

async fn send(socket: &mut Socket, envelope: serde_json::Value) {
    socket
        .send(Message::Text(envelope.to_string()))
        .await
        .unwrap();
}

async fn recv(socket: &mut Socket) -> Envelope {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for relay frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return Envelope::from_json(&text).unwrap();
        }
    }
}

async fn join(socket: &mut Socket, room: &str, username: &str) -> PeerId {
    send(
        socket,
        serde_json::json!({"type": "join", "room": room, "username": username}),
    )
    .await;
    match recv(socket).await {
        Envelope::Joined { id, .. } => id,
        other => panic!("expected joined, got {other:?}"),
    }
}

#[test_timeout::timeout_test(20)]
async fn offer_reaches_only_its_target_with_sender_stamped() {
    let relay = start_relay().await;
    let mut alice = connect(&relay).await;
    let mut bob = connect(&relay).await;
    let mut carol = connect(&relay).await;

    let alice_id = join(&mut alice, "lobby", "alice").await;
    let bob_id = join(&mut bob, "lobby", "bob").await;
    assert!(matches!(recv(&mut alice).await, Envelope::NewPeer { id, .. } if id == bob_id));
    let carol_id = join(&mut carol, "lobby", "carol").await;
    assert!(matches!(recv(&mut alice).await, Envelope::NewPeer { id, .. } if id == carol_id));
    assert!(matches!(recv(&mut bob).await, Envelope::NewPeer { id, .. } if id == carol_id));

    send(
        &mut alice,
        serde_json::json!({
            "type": "offer",
            "room": "lobby",
            "target": bob_id.as_str(),
            "offer": {"type": "offer", "sdp": "v=0"}
        }),
    )
    .await;

    match recv(&mut bob).await {
        Envelope::Offer { from, offer, .. } => {
            assert_eq!(from, Some(alice_id.clone()));
            assert_eq!(offer.sdp, "v=0");
        }
        other => panic!("expected offer, got {other:?}"),
    }

    // Carol saw nothing; the next frame she gets is the one sent to everyone.
    send(
        &mut alice,
        serde_json::json!({
            "type": "candidate",
            "room": "lobby",
            "candidate": {"candidate": "candidate:1 1 udp 1 127.0.0.1 9 typ host"}
        }),
    )
    .await;
    assert!(matches!(recv(&mut carol).await, Envelope::Candidate { from, .. } if from == Some(alice_id.clone())));
    assert!(matches!(recv(&mut bob).await, Envelope::Candidate { .. }));
}

#[test_timeout::timeout_test(20)]
async fn malformed_frames_get_an_error_and_the_relay_keeps_serving() {
    let relay = start_relay().await;
    let mut alice = connect(&relay).await;
    let mut bob = connect(&relay).await;
    join(&mut alice, "lobby", "alice").await;
    let bob_id = join(&mut bob, "lobby", "bob").await;
    let _ = recv(&mut alice).await;

    alice
        .send(Message::Text("definitely not json".into()))
        .await
        .unwrap();
    assert!(matches!(recv(&mut alice).await, Envelope::Error { .. }));

    send(
        &mut alice,
        serde_json::json!({
            "type": "answer",
            "room": "lobby",
            "target": bob_id.as_str(),
            "answer": {"type": "answer", "sdp": "v=0"}
        }),
    )
    .await;
    assert!(matches!(recv(&mut bob).await, Envelope::Answer { .. }));
}

#[test_timeout::timeout_test(20)]
async fn disconnect_announces_departure_and_empty_rooms_vanish() {
    let relay = start_relay().await;
    let mut alice = connect(&relay).await;
    let mut bob = connect(&relay).await;
    join(&mut alice, "R", "alice").await;
    let bob_id = join(&mut bob, "R", "bob").await;
    let _ = recv(&mut alice).await;
    assert!(relay.state.registry.contains("R"));

    bob.close(None).await.unwrap();
    assert!(matches!(recv(&mut alice).await, Envelope::PeerLeft { id, .. } if id == bob_id));

    alice.close(None).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while relay.state.registry.contains("R") {
        assert!(tokio::time::Instant::now() < deadline, "room R was not removed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(relay.state.registry.room_count(), 0);
}
