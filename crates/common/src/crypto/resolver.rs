use uuid::Uuid;

use super::keys::{sha256_hex, KeyError, KeyStore, PublicKey, PublishedKeyBundle};
use crate::anomaly::{pick_first, AnomalyKind};
use crate::store::{AttachmentRef, Binary, Bundle, BundleEntry, Document, DocumentStore, StoreError};

/// Name the key bundle is published under
pub const KEY_BUNDLE_NAME: &str = "public-key";
/// Content type of the published key binary (DER SubjectPublicKeyInfo)
pub const KEY_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("failed to fetch key bundle: {0}")]
    Store(#[from] StoreError),
    #[error("key bundle contains no descriptor")]
    MissingDescriptor,
    #[error("key bundle contains no key binary")]
    MissingBinary,
    #[error("key descriptor declares no hash")]
    MissingHash,
    #[error("key integrity check failed: declared {declared}, computed {computed}")]
    Integrity { declared: String, computed: String },
    #[error("published key is invalid: {0}")]
    InvalidKey(#[from] KeyError),
}

impl PublishedKeyBundle {
    /// Split into a hash-bearing descriptor and a key binary
    pub fn to_bundle(&self, owner: &str) -> Bundle {
        let binary_id = Uuid::new_v4().to_string();

        let mut descriptor = Document::new(KEY_BUNDLE_NAME, owner);
        descriptor.attachments.push(AttachmentRef {
            location: format!("urn:uuid:{}", binary_id),
            mime_type: KEY_CONTENT_TYPE.to_string(),
            hash: Some(self.sha256.clone()),
        });

        let mut binary = Binary::new(KEY_CONTENT_TYPE, self.public_key_bytes.clone());
        binary.id = Some(binary_id);

        Bundle {
            entries: vec![BundleEntry::Descriptor(descriptor), BundleEntry::Binary(binary)],
        }
    }

    /// Extract the first descriptor's hash and the first binary's bytes.
    /// Extra descriptors or binaries are logged and ignored.
    pub fn from_bundle(bundle: &Bundle, key: &str) -> Result<Self, ResolveError> {
        let (descriptor, _) = pick_first(bundle.descriptors(), AnomalyKind::KeyDescriptor, key);
        let descriptor = descriptor.ok_or(ResolveError::MissingDescriptor)?;

        let (binary, _) = pick_first(bundle.binaries(), AnomalyKind::KeyBinary, key);
        let binary = binary.ok_or(ResolveError::MissingBinary)?;

        let sha256 = descriptor
            .attachments
            .iter()
            .find_map(|a| a.hash.clone())
            .ok_or(ResolveError::MissingHash)?;

        Ok(Self {
            public_key_bytes: binary.data.clone(),
            sha256,
        })
    }

    /// Recompute the hash over the key bytes and decode the key if it matches
    pub fn verify(&self) -> Result<PublicKey, ResolveError> {
        let computed = sha256_hex(&self.public_key_bytes);
        if !computed.eq_ignore_ascii_case(self.sha256.trim()) {
            return Err(ResolveError::Integrity {
                declared: self.sha256.clone(),
                computed,
            });
        }
        Ok(PublicKey::from_der(&self.public_key_bytes)?)
    }
}

impl KeyStore {
    /// Publish the local public key and its hash to `store` for discovery
    pub async fn publish_to(
        &self,
        store: &dyn DocumentStore,
        owner: &str,
    ) -> Result<PublishedKeyBundle, ResolveError> {
        let published = self.publish()?;
        store
            .publish_bundle(KEY_BUNDLE_NAME, published.to_bundle(owner))
            .await?;
        tracing::info!(owner, sha256 = %published.sha256, "published public key bundle");
        Ok(published)
    }
}

/// Fetches and authenticates a remote participant's public key.
#[derive(Debug, Clone)]
pub struct KeyResolver {
    bundle_name: String,
}

impl Default for KeyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyResolver {
    pub fn new() -> Self {
        Self {
            bundle_name: KEY_BUNDLE_NAME.to_string(),
        }
    }

    pub fn with_bundle_name(bundle_name: impl Into<String>) -> Self {
        Self {
            bundle_name: bundle_name.into(),
        }
    }

    /// Fetch the remote key bundle and return the key only if its bytes
    /// hash to the declared value.
    pub async fn resolve(&self, remote: &dyn DocumentStore) -> Result<PublicKey, ResolveError> {
        let bundle = remote.read_bundle(&self.bundle_name).await?;
        let published = PublishedKeyBundle::from_bundle(&bundle, &self.bundle_name)?;

        match published.verify() {
            Ok(key) => {
                tracing::debug!(sha256 = %published.sha256, "resolved remote public key");
                Ok(key)
            }
            Err(e) => {
                tracing::warn!("rejecting remote public key: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;
    use crate::crypto::test_keys;
    use crate::store::MemoryDocumentStore;

    fn published() -> PublishedKeyBundle {
        KeyStore::from_pair(test_keys::recipient().clone())
            .publish()
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_then_resolve() {
        let remote = MemoryDocumentStore::new();
        let store = KeyStore::from_pair(test_keys::recipient().clone());
        store.publish_to(&remote, "DMS1").await.unwrap();

        let key = KeyResolver::new().resolve(&remote).await.unwrap();
        assert_eq!(key, test_keys::recipient().public);
    }

    #[tokio::test]
    async fn test_tampered_key_rejected() {
        let remote = MemoryDocumentStore::new();
        let mut bundle = published();
        // swap in a different key after the hash was computed
        bundle.public_key_bytes = test_keys::sender().public.to_der().unwrap();
        remote
            .publish_bundle(KEY_BUNDLE_NAME, bundle.to_bundle("DMS1"))
            .await
            .unwrap();

        let result = KeyResolver::new().resolve(&remote).await;
        assert!(matches!(result, Err(ResolveError::Integrity { .. })));
    }

    #[tokio::test]
    async fn test_missing_bundle() {
        let remote = MemoryDocumentStore::new();
        let result = KeyResolver::new().resolve(&remote).await;
        assert!(matches!(result, Err(ResolveError::Store(StoreError::NotFound(_)))));
    }

    #[test]
    fn test_first_of_many_is_used() {
        let good = published();
        let mut bundle = good.to_bundle("DMS1");
        let mut other = PublishedKeyBundle {
            public_key_bytes: Bytes::from_static(b"other"),
            sha256: sha256_hex(b"other"),
        }
        .to_bundle("DMS1");
        bundle.entries.append(&mut other.entries);

        let parsed = PublishedKeyBundle::from_bundle(&bundle, KEY_BUNDLE_NAME).unwrap();
        assert_eq!(parsed, good);
        assert!(parsed.verify().is_ok());
    }

    #[test]
    fn test_incomplete_bundles() {
        let full = published().to_bundle("DMS1");

        let only_descriptor = Bundle {
            entries: vec![full.entries[0].clone()],
        };
        assert!(matches!(
            PublishedKeyBundle::from_bundle(&only_descriptor, "k"),
            Err(ResolveError::MissingBinary)
        ));

        let only_binary = Bundle {
            entries: vec![full.entries[1].clone()],
        };
        assert!(matches!(
            PublishedKeyBundle::from_bundle(&only_binary, "k"),
            Err(ResolveError::MissingDescriptor)
        ));

        let mut no_hash = full.clone();
        if let BundleEntry::Descriptor(d) = &mut no_hash.entries[0] {
            d.attachments[0].hash = None;
        }
        assert!(matches!(
            PublishedKeyBundle::from_bundle(&no_hash, "k"),
            Err(ResolveError::MissingHash)
        ));
    }

    #[test]
    fn test_hash_matching_garbage_is_invalid_key() {
        let bundle = PublishedKeyBundle {
            public_key_bytes: Bytes::from_static(b"not a key"),
            sha256: sha256_hex(b"not a key"),
        };
        assert!(matches!(bundle.verify(), Err(ResolveError::InvalidKey(_))));
    }
}
