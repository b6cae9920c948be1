/**
 * First-of-many selection and the anomaly
 *  records it reports.
 */
pub mod anomaly;
/**
 * Participant configuration: identity, keys,
 *  retries, streaming and store locations.
 */
pub mod config;
/**
 * Cryptographic types and operations.
 *  - RSA key pairs, loaded or generated once
 *  - Remote key discovery with hash verification
 *  - Hybrid RSA-OAEP / AES-GCM envelopes, buffered and streamed
 */
pub mod crypto;
/**
 * Error taxonomy shared by both pipelines and its
 *  mapping onto transfer status codes.
 */
pub mod error;
/**
 * Upsert of received data sets into the
 *  destination store.
 */
pub mod ingest;
/**
 * Transfer packages: building, parsing,
 *  wire encoding and content validation.
 */
pub mod package;
/**
 * Sender and receiver state machines.
 */
pub mod pipeline;
/**
 * Task messages exchanged between participants
 *  and the messenger they travel over.
 */
pub mod protocol;
/**
 * Status codes, per-transfer trackers
 *  and notifications.
 */
pub mod status;
/**
 * Document store abstraction with in-memory,
 *  HTTP and retrying implementations.
 */
pub mod store;

pub mod prelude {
    pub use crate::config::{KeyConfig, PackageMode, RetryPolicy, TransferConfig};
    pub use crate::crypto::{HybridCipher, KeyPair, KeyResolver, KeyStore, PublicKey};
    pub use crate::error::TransferError;
    pub use crate::ingest::Ingestor;
    pub use crate::package::{Resource, TransferPackage};
    pub use crate::pipeline::{Receiver, Sender, StepEvent};
    pub use crate::protocol::{MessageKind, Messenger, TaskMessage};
    pub use crate::status::{DataSetStatus, Notifier, StatusCode};
    pub use crate::store::{DocumentStore, HttpDocumentStore, MemoryDocumentStore};
}
