//! Cryptographic primitives of the transfer protocol
//!
//! # Security Model
//!
//! ## Identity
//! Every participant owns exactly one long-lived RSA keypair ([`KeyStore`]).
//! The public half is published next to its SHA-256 hash; there is no PKI,
//! no rotation and no revocation. The hash is the only trust anchor.
//!
//! ## Key discovery
//! [`KeyResolver`] fetches a remote participant's key bundle and refuses
//! the key unless `sha256(key bytes)` equals the declared hash. Nothing is
//! encrypted before this check has passed.
//!
//! ## Payload encryption
//! [`HybridCipher`] encrypts each payload under a fresh AES-256-GCM key and
//! nonce, and wraps the key with RSA-OAEP for the recipient. The sender and
//! receiver organization identifiers are bound as associated data, so an
//! envelope made for one pair of organizations never decrypts for another.
//! Every decryption failure is reported as the same [`DecryptionError`].

mod cipher;
mod keys;
mod resolver;
mod stream;

pub use cipher::{CipherError, DecryptionError, HybridCipher, KEY_SIZE, NONCE_SIZE};
pub use keys::{sha256_hex, KeyError, KeyPair, KeyStore, PrivateKey, PublicKey, PublishedKeyBundle};
pub use resolver::{KeyResolver, ResolveError, KEY_BUNDLE_NAME, KEY_CONTENT_TYPE};
pub use stream::CHUNK_SIZE;

/// Whether a stream error was raised by a failed decryption
pub fn is_decryption_error(e: &std::io::Error) -> bool {
    e.get_ref()
        .map(|inner| inner.is::<DecryptionError>())
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod test_keys {
    use std::sync::OnceLock;

    use super::KeyPair;

    /// Key generation is slow, every test binary shares two pairs
    const TEST_BITS: usize = 2048;

    pub fn recipient() -> &'static KeyPair {
        static PAIR: OnceLock<KeyPair> = OnceLock::new();
        PAIR.get_or_init(|| KeyPair::generate(TEST_BITS).unwrap())
    }

    pub fn sender() -> &'static KeyPair {
        static PAIR: OnceLock<KeyPair> = OnceLock::new();
        PAIR.get_or_init(|| KeyPair::generate(TEST_BITS).unwrap())
    }
}
