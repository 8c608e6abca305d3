//! Sealing and opening of chat payloads.
//!
//! Every peer in a room derives the same [`SessionKey`] from the room
//! passphrase, which is shared out of band and never sent to the relay.
//! Payloads are sealed with ChaCha20-Poly1305 under a fresh random nonce, and
//! the message kind, room, id and username are bound in as associated data.

use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use bonfire_proto::SealedPayload;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

const SALT_LABEL: &[u8] = b"bonfire:salt:v1";
const HKDF_INFO_AEAD: &[u8] = b"bonfire:chat:aead:v1";
const AAD_VERSION: &[u8] = b"bonfire:chat:v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("passphrase must not be empty")]
    EmptyPassphrase,
    #[error("encryption failed")]
    Seal,
}

/// Authentication of an inbound payload failed. The payload must be dropped.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("decryption failed: {reason}")]
pub struct DecryptionFailure {
    reason: &'static str,
}

impl DecryptionFailure {
    fn new(reason: &'static str) -> Self {
        Self { reason }
    }

    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Reaction,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Reaction => "reaction",
        }
    }
}

/// Fields of a chat envelope that travel in the clear and are authenticated
/// alongside the ciphertext.
#[derive(Debug, Clone, Copy)]
pub struct MessageContext<'a> {
    pub kind: MessageKind,
    pub room: &'a str,
    pub id: &'a str,
    pub username: &'a str,
}

impl MessageContext<'_> {
    fn aad(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(64);
        aad.extend_from_slice(AAD_VERSION);
        for component in [self.kind.as_str(), self.room, self.id, self.username] {
            aad.push(0x1f);
            aad.extend_from_slice(component.as_bytes());
        }
        aad
    }
}

/// Symmetric key for one joined room. Lives only in memory.
#[derive(Clone)]
pub struct SessionKey {
    bytes: [u8; KEY_LEN],
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

impl SessionKey {
    /// Derives the room key: Argon2id over the passphrase, salted by the room
    /// name, then HKDF-SHA256 into the AEAD key. Identical inputs give the
    /// identical key on every peer.
    pub fn derive(passphrase: &str, room: &str) -> Result<Self, CryptoError> {
        if passphrase.is_empty() {
            return Err(CryptoError::EmptyPassphrase);
        }
        let salt = room_salt(room);
        let stretched = stretch_passphrase(passphrase, &salt)?;

        let hkdf = Hkdf::<Sha256>::new(Some(&salt), &stretched);
        let mut bytes = [0u8; KEY_LEN];
        hkdf.expand(HKDF_INFO_AEAD, &mut bytes)
            .map_err(|err| CryptoError::KeyDerivation(format!("hkdf expand failed: {err}")))?;
        Ok(Self { bytes })
    }

    /// A random key. Only peers holding the same bytes can talk.
    #[cfg(test)]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(&self.bytes.into())
    }

    pub fn seal(
        &self,
        context: &MessageContext<'_>,
        plaintext: &[u8],
    ) -> Result<SealedPayload, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let aad = context.aad();
        let ciphertext = self
            .cipher()
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Seal)?;

        Ok(SealedPayload {
            nonce: BASE64_STANDARD.encode(nonce_bytes),
            ciphertext: BASE64_STANDARD.encode(ciphertext),
        })
    }

    pub fn open(
        &self,
        context: &MessageContext<'_>,
        sealed: &SealedPayload,
    ) -> Result<Vec<u8>, DecryptionFailure> {
        let nonce_bytes = BASE64_STANDARD
            .decode(sealed.nonce.as_bytes())
            .map_err(|_| DecryptionFailure::new("invalid nonce encoding"))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(DecryptionFailure::new("unexpected nonce length"));
        }
        let ciphertext = BASE64_STANDARD
            .decode(sealed.ciphertext.as_bytes())
            .map_err(|_| DecryptionFailure::new("invalid ciphertext encoding"))?;
        let aad = context.aad();
        self.cipher()
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| DecryptionFailure::new("authentication failed"))
    }
}

fn room_salt(room: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SALT_LABEL);
    hasher.update(room.as_bytes());
    hasher.finalize().into()
}

fn stretch_passphrase(passphrase: &str, salt: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    // Kept cheap enough that joining a room stays interactive.
    let params = Params::new(32 * 1024, 1, 1, Some(KEY_LEN))
        .map_err(|err| CryptoError::KeyDerivation(format!("invalid argon2 params: {err}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut output = [0u8; KEY_LEN];
    argon
        .hash_password_into(passphrase.as_bytes(), salt, &mut output)
        .map_err(|err| CryptoError::KeyDerivation(format!("argon2 derive failed: {err}")))?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context<'a>(id: &'a str) -> MessageContext<'a> {
        MessageContext {
            kind: MessageKind::Text,
            room: "lobby",
            id,
            username: "alice",
        }
    }

    #[test]
    fn open_recovers_sealed_plaintext() {
        let key = SessionKey::generate();
        for message in ["", "hi", "unicode ✓ ok", &"x".repeat(4096)] {
            let sealed = key.seal(&context("m1"), message.as_bytes()).unwrap();
            assert_eq!(key.open(&context("m1"), &sealed).unwrap(), message.as_bytes());
        }
    }

    #[test]
    fn wrong_key_is_rejected() {
        let sealed = SessionKey::generate()
            .seal(&context("m1"), b"secret")
            .unwrap();
        let err = SessionKey::generate()
            .open(&context("m1"), &sealed)
            .unwrap_err();
        assert_eq!(err.reason(), "authentication failed");
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = SessionKey::generate();
        let mut sealed = key.seal(&context("m1"), b"secret").unwrap();
        let mut raw = BASE64_STANDARD.decode(&sealed.ciphertext).unwrap();
        raw[0] ^= 0x01;
        sealed.ciphertext = BASE64_STANDARD.encode(raw);
        assert!(key.open(&context("m1"), &sealed).is_err());
    }

    #[test]
    fn swapped_nonce_is_rejected() {
        let key = SessionKey::generate();
        let first = key.seal(&context("m1"), b"one").unwrap();
        let mut second = key.seal(&context("m1"), b"two").unwrap();
        second.nonce = first.nonce.clone();
        assert!(key.open(&context("m1"), &second).is_err());
    }

    #[test]
    fn relabelled_envelope_is_rejected() {
        let key = SessionKey::generate();
        let sealed = key.seal(&context("m1"), b"secret").unwrap();
        assert!(key.open(&context("m2"), &sealed).is_err());
        let spoofed = MessageContext {
            username: "mallory",
            ..context("m1")
        };
        assert!(key.open(&spoofed, &sealed).is_err());
        let as_reaction = MessageContext {
            kind: MessageKind::Reaction,
            ..context("m1")
        };
        assert!(key.open(&as_reaction, &sealed).is_err());
    }

    #[test]
    fn malformed_encodings_fail_cleanly() {
        let key = SessionKey::generate();
        let bad_nonce = SealedPayload {
            nonce: "!!".into(),
            ciphertext: String::new(),
        };
        assert_eq!(
            key.open(&context("m1"), &bad_nonce).unwrap_err().reason(),
            "invalid nonce encoding"
        );
        let short_nonce = SealedPayload {
            nonce: BASE64_STANDARD.encode([0u8; 4]),
            ciphertext: String::new(),
        };
        assert_eq!(
            key.open(&context("m1"), &short_nonce).unwrap_err().reason(),
            "unexpected nonce length"
        );
    }

    #[test]
    fn every_seal_uses_a_fresh_nonce() {
        let key = SessionKey::generate();
        let a = key.seal(&context("m1"), b"same").unwrap();
        let b = key.seal(&context("m1"), b"same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn peers_derive_the_same_room_key() {
        let alice = SessionKey::derive("correct horse", "lobby").unwrap();
        let bob = SessionKey::derive("correct horse", "lobby").unwrap();
        let sealed = alice.seal(&context("m1"), b"hello bob").unwrap();
        assert_eq!(bob.open(&context("m1"), &sealed).unwrap(), b"hello bob");

        let elsewhere = SessionKey::derive("correct horse", "attic").unwrap();
        assert!(elsewhere.open(&context("m1"), &sealed).is_err());
    }

    #[test]
    fn empty_passphrase_is_refused() {
        assert!(matches!(
            SessionKey::derive("", "lobby"),
            Err(CryptoError::EmptyPassphrase)
        ));
    }
}
