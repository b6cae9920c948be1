use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use rand_core::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::config::KeyConfig;

const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";
const PUBLIC_KEY_TAG: &str = "PUBLIC KEY";

/// Errors that can occur while loading, generating or encoding keys
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("failed to read key file {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to write key file {0}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("only one of the key files exists: {0}")]
    Incomplete(PathBuf),
    #[error("private key does not match public key")]
    Mismatch,
}

/// Hex encoded SHA-256 digest
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// RSA public key of a participant.
///
/// Its canonical byte form is the DER encoded SubjectPublicKeyInfo, which
/// is what gets published and hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey(RsaPublicKey);

impl PublicKey {
    pub fn from_der(der: &[u8]) -> Result<Self, KeyError> {
        let key = RsaPublicKey::from_public_key_der(der)
            .map_err(|e| anyhow::anyhow!("invalid public key DER: {}", e))?;
        Ok(Self(key))
    }

    pub fn to_der(&self) -> Result<Bytes, KeyError> {
        let doc = self
            .0
            .to_public_key_der()
            .map_err(|e| anyhow::anyhow!("public key encode error: {}", e))?;
        Ok(Bytes::copy_from_slice(doc.as_bytes()))
    }

    pub fn from_pem(pem_str: &str) -> Result<Self, KeyError> {
        let pem = pem::parse(pem_str).map_err(|e| anyhow::anyhow!("failed to parse PEM: {}", e))?;
        if pem.tag() != PUBLIC_KEY_TAG {
            return Err(anyhow::anyhow!("invalid PEM tag, expected {}", PUBLIC_KEY_TAG).into());
        }
        Self::from_der(pem.contents())
    }

    pub fn to_pem(&self) -> Result<String, KeyError> {
        let pem = pem::Pem::new(PUBLIC_KEY_TAG, self.to_der()?.to_vec());
        Ok(pem::encode(&pem))
    }

    /// Hex SHA-256 over the DER bytes
    pub fn fingerprint(&self) -> Result<String, KeyError> {
        Ok(sha256_hex(&self.to_der()?))
    }

    /// Modulus size in bytes, also the length of every wrapped key
    pub fn size(&self) -> usize {
        self.0.size()
    }

    pub(crate) fn inner(&self) -> &RsaPublicKey {
        &self.0
    }
}

/// RSA private key of the local participant. Never leaves the process.
#[derive(Clone)]
pub struct PrivateKey(RsaPrivateKey);

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey({} bits)", self.0.size() * 8)
    }
}

impl PrivateKey {
    pub fn generate(bits: usize) -> Result<Self, KeyError> {
        let key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| anyhow::anyhow!("key generation failed: {}", e))?;
        Ok(Self(key))
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.to_public_key())
    }

    /// Encode as an unencrypted PKCS#8 PEM
    pub fn to_pem(&self) -> Result<String, KeyError> {
        let der = self
            .0
            .to_pkcs8_der()
            .map_err(|e| anyhow::anyhow!("private key encode error: {}", e))?;
        let pem = pem::Pem::new(PRIVATE_KEY_TAG, der.as_bytes().to_vec());
        Ok(pem::encode(&pem))
    }

    pub fn from_pem(pem_str: &str) -> Result<Self, KeyError> {
        let pem = pem::parse(pem_str).map_err(|e| anyhow::anyhow!("failed to parse PEM: {}", e))?;
        if pem.tag() != PRIVATE_KEY_TAG {
            return Err(anyhow::anyhow!("invalid PEM tag, expected {}", PRIVATE_KEY_TAG).into());
        }
        let key = RsaPrivateKey::from_pkcs8_der(pem.contents())
            .map_err(|e| anyhow::anyhow!("invalid private key DER: {}", e))?;
        Ok(Self(key))
    }

    pub(crate) fn inner(&self) -> &RsaPrivateKey {
        &self.0
    }
}

/// The local participant's keypair
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

impl KeyPair {
    pub fn generate(bits: usize) -> Result<Self, KeyError> {
        let private = PrivateKey::generate(bits)?;
        Ok(Self::from_private(private))
    }

    pub fn from_private(private: PrivateKey) -> Self {
        Self {
            public: private.public(),
            private,
        }
    }
}

/// Public key material as published for discovery: the key bytes and
/// the hash they must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedKeyBundle {
    /// DER encoded SubjectPublicKeyInfo
    pub public_key_bytes: Bytes,
    /// Hex SHA-256 of `public_key_bytes`
    pub sha256: String,
}

/// Owns the local keypair for the lifetime of the process.
///
/// The pair is loaded from the configured PEM files on first use, or
/// generated and written there if neither file exists yet. After that it
/// is read-only and shared across all transfers.
#[derive(Debug)]
pub struct KeyStore {
    private_key_path: PathBuf,
    public_key_path: PathBuf,
    modulus_bits: usize,
    pair: OnceLock<Arc<KeyPair>>,
}

impl KeyStore {
    pub fn new(config: &KeyConfig) -> Self {
        Self {
            private_key_path: config.private_key_path.clone(),
            public_key_path: config.public_key_path.clone(),
            modulus_bits: config.modulus_bits,
            pair: OnceLock::new(),
        }
    }

    /// A store around an already loaded pair, nothing is read from disk
    pub fn from_pair(pair: KeyPair) -> Self {
        let store = Self {
            private_key_path: PathBuf::new(),
            public_key_path: PathBuf::new(),
            modulus_bits: pair.public.size() * 8,
            pair: OnceLock::new(),
        };
        let _ = store.pair.set(Arc::new(pair));
        store
    }

    /// Load or lazily generate the local keypair
    pub fn local_key_pair(&self) -> Result<Arc<KeyPair>, KeyError> {
        if let Some(pair) = self.pair.get() {
            return Ok(pair.clone());
        }

        let pair = Arc::new(self.load_or_generate()?);
        // another caller may have won the race, theirs is kept
        let _ = self.pair.set(pair);
        self.pair
            .get()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("key pair not initialized").into())
    }

    /// Key bytes and their hash, for remote discovery
    pub fn publish(&self) -> Result<PublishedKeyBundle, KeyError> {
        let pair = self.local_key_pair()?;
        let public_key_bytes = pair.public.to_der()?;
        let sha256 = sha256_hex(&public_key_bytes);
        Ok(PublishedKeyBundle {
            public_key_bytes,
            sha256,
        })
    }

    fn load_or_generate(&self) -> Result<KeyPair, KeyError> {
        let private_exists = self.private_key_path.exists();
        let public_exists = self.public_key_path.exists();

        match (private_exists, public_exists) {
            (true, true) => self.load(),
            (false, false) => self.generate(),
            (true, false) => Err(KeyError::Incomplete(self.private_key_path.clone())),
            (false, true) => Err(KeyError::Incomplete(self.public_key_path.clone())),
        }
    }

    fn load(&self) -> Result<KeyPair, KeyError> {
        let private = PrivateKey::from_pem(&read(&self.private_key_path)?)?;
        let public = PublicKey::from_pem(&read(&self.public_key_path)?)?;
        if private.public() != public {
            return Err(KeyError::Mismatch);
        }
        tracing::info!(
            path = %self.private_key_path.display(),
            bits = public.size() * 8,
            "loaded local key pair"
        );
        Ok(KeyPair { public, private })
    }

    fn generate(&self) -> Result<KeyPair, KeyError> {
        tracing::info!(
            bits = self.modulus_bits,
            path = %self.private_key_path.display(),
            "generating local key pair"
        );
        let pair = KeyPair::generate(self.modulus_bits)?;
        write(&self.private_key_path, &pair.private.to_pem()?)?;
        write(&self.public_key_path, &pair.public.to_pem()?)?;
        Ok(pair)
    }
}

fn read(path: &Path) -> Result<String, KeyError> {
    fs::read_to_string(path).map_err(|e| KeyError::Read(path.to_path_buf(), e))
}

fn write(path: &Path, contents: &str) -> Result<(), KeyError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| KeyError::Write(path.to_path_buf(), e))?;
    }
    fs::write(path, contents).map_err(|e| KeyError::Write(path.to_path_buf(), e))
}
