use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use clap::Parser;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;
pub const DEFAULT_CONNECTION_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub max_frame_bytes: usize,
    pub connection_buffer: usize,
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            connection_buffer: DEFAULT_CONNECTION_BUFFER,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "bonfire-relay",
    author,
    version,
    about = "Room relay for bonfire peer-to-peer chat signaling"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "BONFIRE_RELAY_LISTEN_ADDR", default_value = "127.0.0.1:8787")]
    pub listen_addr: String,

    /// Largest accepted envelope, in bytes.
    #[arg(long, env = "BONFIRE_RELAY_MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,

    /// Outbound frames queued per connection before new ones are dropped.
    #[arg(long, env = "BONFIRE_RELAY_CONNECTION_BUFFER", default_value_t = DEFAULT_CONNECTION_BUFFER)]
    pub connection_buffer: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BONFIRE_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 1)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        anyhow::ensure!(cli.max_frame_bytes > 0, "max frame size must be positive");
        anyhow::ensure!(cli.connection_buffer > 0, "connection buffer must be positive");

        Ok(RelayConfig {
            listen_addr,
            max_frame_bytes: cli.max_frame_bytes,
            connection_buffer: cli.connection_buffer,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_into_config() {
        let cli = Cli::parse_from(["bonfire-relay"]);
        let config = RelayConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr.port(), 8787);
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    }

    #[test]
    fn invalid_listen_address_is_reported() {
        let cli = Cli::parse_from(["bonfire-relay", "--listen-addr", "not-an-addr"]);
        let err = RelayConfig::try_from(cli).unwrap_err();
        assert!(err.to_string().contains("not-an-addr"));
    }

    #[test]
    fn zero_buffer_is_refused() {
        let cli = Cli::parse_from(["bonfire-relay", "--connection-buffer", "0"]);
        assert!(RelayConfig::try_from(cli).is_err());
    }
}
