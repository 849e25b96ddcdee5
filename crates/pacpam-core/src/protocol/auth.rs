//! Shared-secret authentication handshake
//!
//! Each side sends the hex SHA-256 digest of the shared secret. A peer is
//! authenticated when its digest matches the local one.

use sha2::{Digest, Sha256};

use super::wire::AuthMessage;
use crate::types::Timestamp;

/// Hex SHA-256 digest of a secret (the empty secret is allowed)
pub fn hash_secret(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(digest)
}

/// Compare two digests; empty digests never match
pub fn verify_digest(expected: &str, received: &str) -> bool {
    if expected.is_empty() || received.is_empty() || expected.len() != received.len() {
        return false;
    }
    expected
        .bytes()
        .zip(received.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Local credentials presented during the handshake
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    digest: String,
    name: String,
}

impl Credentials {
    pub fn new(secret: &str, name: impl Into<String>) -> Self {
        Self {
            digest: hash_secret(secret),
            name: name.into(),
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build the auth frame body sent on entering the handshake
    pub fn message(&self, now: Timestamp) -> AuthMessage {
        AuthMessage {
            hash: self.digest.clone(),
            name: self.name.clone(),
            timestamp: now.as_millis(),
        }
    }

    pub fn verify(&self, message: &AuthMessage) -> bool {
        verify_digest(&self.digest, &message.hash)
    }
}

impl core::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Credentials")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            hash_secret(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(hash_secret("secret").len(), 64);
    }

    #[test]
    fn test_verify() {
        let alice = Credentials::new("pw", "alice");
        let bob = Credentials::new("pw", "bob");
        let eve = Credentials::new("other", "eve");
        assert!(alice.verify(&bob.message(Timestamp::new(1))));
        assert!(!alice.verify(&eve.message(Timestamp::new(1))));
        assert!(!verify_digest("", ""));
        assert!(!verify_digest("abcd", "abc"));
    }
}
