//! Client core for bonfire chat.
//!
//! A [`session::Session`] joins a room through the relay, negotiates one
//! peer link per remote member over a [`transport::TransportAdapter`], and
//! exchanges sealed text and reactions over the resulting data channels. The
//! relay only ever sees signaling; chat payloads travel peer to peer.

pub mod config;
pub mod crypto;
pub mod error;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::{ChatMode, SessionConfig};
pub use error::SessionError;
pub use session::{ChatMessage, ConnectionStatus, Session, SessionEvent, SessionEvents};
