use bonfire_proto::PeerId;
use thiserror::Error;

use crate::crypto::{CryptoError, DecryptionFailure};
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("negotiation with {peer} failed: {reason}")]
    Negotiation { peer: String, reason: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decryption(#[from] DecryptionFailure),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("relay rejected the request: {0}")]
    Rejected(String),
    #[error("no open channel to send on")]
    NoOpenChannel,
    #[error("session is closed")]
    Closed,
}

impl SessionError {
    pub(crate) fn negotiation(peer: Option<&PeerId>, reason: impl ToString) -> Self {
        SessionError::Negotiation {
            peer: peer.map_or_else(|| "pending peer".to_string(), |id| id.to_string()),
            reason: reason.to_string(),
        }
    }
}

impl From<bonfire_proto::ProtoError> for SessionError {
    fn from(err: bonfire_proto::ProtoError) -> Self {
        SessionError::Protocol(err.to_string())
    }
}
