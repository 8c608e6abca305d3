use std::sync::Arc;

use anyhow::{Context, Result};
use bonfire_client_core::config::{Cli, ClientConfig};
use bonfire_client_core::crypto::MessageKind;
use bonfire_client_core::transport::webrtc::WebRtcAdapter;
use bonfire_client_core::{ConnectionStatus, Session, SessionEvent};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Empty,
    Quit,
    Peers,
    React { id: &'a str, emoji: &'a str },
    Text(&'a str),
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    match line.split_once(char::is_whitespace) {
        _ if line == "/quit" => Input::Quit,
        _ if line == "/peers" => Input::Peers,
        Some(("/react", rest)) => match rest.trim().split_once(char::is_whitespace) {
            Some((id, emoji)) if !emoji.trim().is_empty() => Input::React {
                id,
                emoji: emoji.trim(),
            },
            _ => Input::Text(line),
        },
        _ => Input::Text(line),
    }
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .context("failed to initialise tracing subscriber")
}

/// Prints one session event. Returns true once the session is over.
fn render(event: SessionEvent) -> bool {
    match event {
        SessionEvent::Status(ConnectionStatus::Connecting) => println!("* connecting to peers"),
        SessionEvent::Status(ConnectionStatus::Connected) => println!("* connected"),
        SessionEvent::Status(ConnectionStatus::Disconnected) => println!("* disconnected"),
        SessionEvent::Message(message) => match message.kind {
            MessageKind::Text => println!("[{}] {}: {}", message.id, message.username, message.text),
            MessageKind::Reaction => {
                println!("* {} reacted {} to [{}]", message.username, message.text, message.id)
            }
        },
        SessionEvent::PeerJoined { id, username } => {
            println!("* {} joined ({id})", username.as_deref().unwrap_or("someone"))
        }
        SessionEvent::PeerLeft { id } => println!("* {id} left"),
        SessionEvent::RelayError { message } => eprintln!("relay error: {message}"),
        SessionEvent::Ended { reason } => {
            println!("* session ended: {reason}");
            return true;
        }
    }
    false
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing()?;

    let config = ClientConfig::try_from(Cli::parse())?;
    let username = config.session.username.clone();
    let adapter = Arc::new(WebRtcAdapter::new(config.webrtc.clone()));
    let (session, mut events) = Session::join(config.session, adapter)
        .await
        .context("failed to join room")?;

    println!(
        "joined room {} as {username} ({})",
        session.room(),
        session.local_id()
    );
    println!("type to chat; /react <id> <emoji>, /peers, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match parse_input(&line) {
                    Input::Empty => {}
                    Input::Quit => break,
                    Input::Peers => {
                        for peer in session.peers().await {
                            println!(
                                "  {} {} {:?}",
                                peer.id,
                                peer.username.as_deref().unwrap_or("?"),
                                peer.channel
                            );
                        }
                    }
                    Input::React { id, emoji } => {
                        if let Err(err) = session.send_reaction(id, emoji).await {
                            eprintln!("reaction not sent: {err}");
                        }
                    }
                    Input::Text(text) => match session.send_text(text).await {
                        Ok(id) => println!("[{id}] {username}: {text}"),
                        Err(err) => eprintln!("message not sent: {err}"),
                    },
                }
            }
            event = events.recv() => {
                match event {
                    Some(event) if render(event.clone()) => break,
                    Some(_) => {}
                    None => break,
                }
            }
        }
    }

    session.leave().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_recognised() {
        assert_eq!(parse_input("  "), Input::Empty);
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert_eq!(
            parse_input("/react abc:3 🔥"),
            Input::React {
                id: "abc:3",
                emoji: "🔥"
            }
        );
    }

    #[test]
    fn incomplete_react_is_sent_as_text() {
        assert_eq!(parse_input("/react abc:3"), Input::Text("/react abc:3"));
        assert_eq!(parse_input(" hello there "), Input::Text("hello there"));
    }
}
