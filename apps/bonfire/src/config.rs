use std::{fmt, time::Duration};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use url::Url;

use crate::transport::webrtc::WebRtcConfig;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8787/ws";

/// Room topology. Two-party rooms hold exactly one link; group rooms mesh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ChatMode {
    #[default]
    Group,
    #[value(name = "two-party", alias = "p2p")]
    TwoParty,
}

#[derive(Clone)]
pub struct SessionConfig {
    pub relay_url: String,
    /// Blank asks the relay to pick a room id.
    pub room: String,
    pub username: String,
    pub passphrase: String,
    pub mode: ChatMode,
    pub connect_timeout: Duration,
    pub join_timeout: Duration,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("relay_url", &self.relay_url)
            .field("room", &self.room)
            .field("username", &self.username)
            .field("passphrase", &"<redacted>")
            .field("mode", &self.mode)
            .field("connect_timeout", &self.connect_timeout)
            .field("join_timeout", &self.join_timeout)
            .finish()
    }
}

impl SessionConfig {
    pub fn new(
        relay_url: impl Into<String>,
        room: impl Into<String>,
        username: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            relay_url: relay_url.into(),
            room: room.into(),
            username: username.into(),
            passphrase: passphrase.into(),
            mode: ChatMode::default(),
            connect_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_mode(mut self, mode: ChatMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "bonfire",
    author,
    version,
    about = "End-to-end encrypted terminal chat over WebRTC data channels"
)]
pub struct Cli {
    /// Relay websocket endpoint.
    #[arg(long, env = "BONFIRE_RELAY_URL", default_value = DEFAULT_RELAY_URL)]
    pub relay_url: String,

    /// Room to join. Leave empty to have the relay generate one.
    #[arg(long, env = "BONFIRE_ROOM", default_value = "")]
    pub room: String,

    /// Display name shown to other peers.
    #[arg(long, env = "BONFIRE_USERNAME")]
    pub username: String,

    /// Shared room secret; every peer in the room must use the same one.
    #[arg(long, env = "BONFIRE_PASSPHRASE", hide_env_values = true)]
    pub passphrase: String,

    #[arg(long, env = "BONFIRE_MODE", value_enum, default_value_t = ChatMode::Group)]
    pub mode: ChatMode,

    /// Comma separated STUN/TURN urls, `user:credential@turn:host` for TURN.
    #[arg(long, env = "BONFIRE_ICE_SERVERS")]
    pub ice_servers: Option<String>,

    #[arg(long, env = "BONFIRE_CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    pub connect_timeout_secs: u64,

    #[arg(long, env = "BONFIRE_JOIN_TIMEOUT_SECS", default_value_t = 5)]
    pub join_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub session: SessionConfig,
    pub webrtc: WebRtcConfig,
}

impl TryFrom<Cli> for ClientConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let url = Url::parse(&cli.relay_url)
            .with_context(|| format!("invalid relay url: {}", cli.relay_url))?;
        anyhow::ensure!(
            matches!(url.scheme(), "ws" | "wss"),
            "relay url must use ws:// or wss://, got {}",
            url.scheme()
        );
        anyhow::ensure!(!cli.username.trim().is_empty(), "username must not be blank");
        anyhow::ensure!(!cli.passphrase.is_empty(), "passphrase must not be empty");
        anyhow::ensure!(cli.connect_timeout_secs > 0, "connect timeout must be positive");
        anyhow::ensure!(cli.join_timeout_secs > 0, "join timeout must be positive");

        let webrtc = match cli.ice_servers.as_deref() {
            Some(list) => WebRtcConfig::default().with_ice_servers(list),
            None => WebRtcConfig::default(),
        };

        let session = SessionConfig::new(cli.relay_url, cli.room, cli.username.trim(), cli.passphrase)
            .with_mode(cli.mode)
            .with_connect_timeout(Duration::from_secs(cli.connect_timeout_secs))
            .with_join_timeout(Duration::from_secs(cli.join_timeout_secs));

        Ok(ClientConfig { session, webrtc })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Cli {
        let mut args = vec!["bonfire", "--username", "alice", "--passphrase", "s3cret"];
        args.extend_from_slice(extra);
        Cli::parse_from(args)
    }

    #[test]
    fn defaults_fill_the_session() {
        let config = ClientConfig::try_from(parse(&[])).unwrap();
        assert_eq!(config.session.relay_url, DEFAULT_RELAY_URL);
        assert_eq!(config.session.mode, ChatMode::Group);
        assert_eq!(config.session.join_timeout, Duration::from_secs(5));
        assert_eq!(config.webrtc.channel_label, "chat");
    }

    #[test]
    fn two_party_mode_accepts_the_short_alias() {
        let config = ClientConfig::try_from(parse(&["--mode", "p2p"])).unwrap();
        assert_eq!(config.session.mode, ChatMode::TwoParty);
    }

    #[test]
    fn http_relay_url_is_refused() {
        let err = ClientConfig::try_from(parse(&["--relay-url", "http://relay"])).unwrap_err();
        assert!(err.to_string().contains("ws://"));
    }

    #[test]
    fn passphrase_never_shows_in_debug_output() {
        let config = SessionConfig::new("ws://x/ws", "r", "alice", "hunter2");
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
