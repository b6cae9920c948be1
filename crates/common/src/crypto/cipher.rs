//! Hybrid envelope encryption
//!
//! # Envelope format
//!
//! Whole-buffer envelope (version 1):
//!
//! ```text
//! ┌─────────┬──────────────┬─────────────┬───────────┬─────────────────┐
//! │ Version │ Wrapped len  │ Wrapped key │ Nonce     │ Ciphertext+tag  │
//! │ 1 byte  │ 2 bytes (BE) │ N bytes     │ 12 bytes  │ remaining       │
//! └─────────┴──────────────┴─────────────┴───────────┴─────────────────┘
//! ```
//!
//! Streamed envelope (version 2) shares the header up to the wrapped key,
//! followed by a 7 byte STREAM nonce prefix and a sequence of frames:
//!
//! ```text
//! ┌─────────┬──────────────┬──────────────────┐
//! │ Flag    │ Length       │ Ciphertext+tag   │   flag 0 = more frames follow
//! │ 1 byte  │ 4 bytes (BE) │ `Length` bytes   │   flag 1 = last frame
//! └─────────┴──────────────┴──────────────────┘
//! ```
//!
//! The wrapped key is the per-envelope AES-256 key encrypted with
//! RSA-OAEP (SHA-256) under the recipient's public key. Sender and receiver
//! identifiers are never stored in the envelope; they are fed to the AEAD
//! as associated data, each prefixed with its length as an 8 byte BE integer.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use bytes::{BufMut, Bytes, BytesMut};
use rand_core::OsRng;
use rsa::Oaep;
use sha2::Sha256;

use super::keys::{PrivateKey, PublicKey};
use super::stream::{DecryptStream, EncryptStream};
use crate::store::ByteStream;

pub(crate) const BUFFER_VERSION: u8 = 1;
pub(crate) const STREAM_VERSION: u8 = 2;
/// Size of the AES-256 key in bytes
pub const KEY_SIZE: usize = 32;
/// Size of the AES-GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;
/// Size of the STREAM nonce prefix in bytes
pub(crate) const STREAM_NONCE_SIZE: usize = 7;
/// Size of the AES-GCM tag in bytes
pub(crate) const TAG_SIZE: usize = 16;

/// The single, opaque decryption failure. Wrong key, tampered bytes and
/// mismatched identifiers all end up here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("decryption failed")]
pub struct DecryptionError;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("cipher error: {0}")]
    Default(#[from] anyhow::Error),
}

/// Stateless hybrid cipher: RSA-OAEP wrapped AES-256-GCM keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct HybridCipher;

impl HybridCipher {
    /// Encrypt `plaintext` for the holder of `public`, bound to the
    /// `(sender, receiver)` pair. Every call uses a fresh key and nonce.
    pub fn encrypt(
        public: &PublicKey,
        plaintext: &[u8],
        sender: &str,
        receiver: &str,
    ) -> Result<Bytes, CipherError> {
        let key = random_bytes::<KEY_SIZE>()?;
        let nonce = random_bytes::<NONCE_SIZE>()?;
        let aad = associated_data(sender, receiver);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| anyhow::anyhow!("encrypt error"))?;

        let mut envelope = header(BUFFER_VERSION, &wrap_key(public, &key)?);
        envelope.reserve(NONCE_SIZE + ciphertext.len());
        envelope.put_slice(&nonce);
        envelope.put_slice(&ciphertext);
        Ok(envelope.freeze())
    }

    /// Decrypt an envelope produced by [`HybridCipher::encrypt`]. The
    /// identifiers are the ones claimed by the transfer's business
    /// metadata and must equal those used at encryption.
    pub fn decrypt(
        private: &PrivateKey,
        envelope: &[u8],
        sender: &str,
        receiver: &str,
    ) -> Result<Bytes, DecryptionError> {
        let (version, wrapped, rest) = split_header(envelope).ok_or(DecryptionError)?;
        if version != BUFFER_VERSION || rest.len() < NONCE_SIZE + TAG_SIZE {
            return Err(DecryptionError);
        }
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

        let cipher = unwrap_cipher(private, wrapped)?;
        let aad = associated_data(sender, receiver);
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| DecryptionError)?;
        Ok(Bytes::from(plaintext))
    }

    /// Streaming counterpart of [`HybridCipher::encrypt`]. The input is read
    /// lazily as the returned stream is polled and dropped once exhausted or
    /// on the first error.
    pub fn encrypt_stream(
        public: &PublicKey,
        input: ByteStream,
        sender: &str,
        receiver: &str,
    ) -> Result<ByteStream, CipherError> {
        let key = random_bytes::<KEY_SIZE>()?;
        let nonce = random_bytes::<STREAM_NONCE_SIZE>()?;

        let mut preamble = header(STREAM_VERSION, &wrap_key(public, &key)?);
        preamble.put_slice(&nonce);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let state = EncryptStream::new(
            input,
            cipher,
            &nonce,
            associated_data(sender, receiver),
            preamble.freeze(),
        );
        Ok(state.into_stream())
    }

    /// Streaming counterpart of [`HybridCipher::decrypt`]. Failures surface
    /// as `io::ErrorKind::InvalidData` items wrapping [`DecryptionError`],
    /// see [`is_decryption_error`](super::is_decryption_error).
    pub fn decrypt_stream(
        private: &PrivateKey,
        input: ByteStream,
        sender: &str,
        receiver: &str,
    ) -> ByteStream {
        DecryptStream::new(input, private.clone(), associated_data(sender, receiver)).into_stream()
    }
}

/// `len(sender) ‖ sender ‖ len(receiver) ‖ receiver`, lengths as u64 BE
pub(crate) fn associated_data(sender: &str, receiver: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(16 + sender.len() + receiver.len());
    for id in [sender, receiver] {
        aad.extend_from_slice(&(id.len() as u64).to_be_bytes());
        aad.extend_from_slice(id.as_bytes());
    }
    aad
}

fn random_bytes<const N: usize>() -> Result<[u8; N], CipherError> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf).map_err(|e| anyhow::anyhow!("rng error: {}", e))?;
    Ok(buf)
}

fn wrap_key(public: &PublicKey, key: &[u8; KEY_SIZE]) -> Result<Vec<u8>, CipherError> {
    let wrapped = public
        .inner()
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key)
        .map_err(|e| anyhow::anyhow!("key wrap error: {}", e))?;
    Ok(wrapped)
}

pub(crate) fn unwrap_cipher(
    private: &PrivateKey,
    wrapped: &[u8],
) -> Result<Aes256Gcm, DecryptionError> {
    let key = private
        .inner()
        .decrypt(Oaep::new::<Sha256>(), wrapped)
        .map_err(|_| DecryptionError)?;
    if key.len() != KEY_SIZE {
        return Err(DecryptionError);
    }
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)))
}

fn header(version: u8, wrapped: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(3 + wrapped.len());
    buf.put_u8(version);
    buf.put_u16(wrapped.len() as u16);
    buf.put_slice(wrapped);
    buf
}

/// Split `version ‖ wrapped key ‖ rest`, `None` if too short
pub(crate) fn split_header(buf: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    if buf.len() < 3 {
        return None;
    }
    let version = buf[0];
    let wrapped_len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    let body = &buf[3..];
    if body.len() < wrapped_len {
        return None;
    }
    let (wrapped, rest) = body.split_at(wrapped_len);
    Some((version, wrapped, rest))
}
