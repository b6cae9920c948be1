use std::io;

use crate::config::ConfigError;
use crate::crypto::{is_decryption_error, CipherError, DecryptionError, KeyError, ResolveError};
use crate::ingest::IngestError;
use crate::package::{validation_error, PackageError, ValidationError};
use crate::protocol::{MessageError, TransportError};
use crate::status::StatusCode;
use crate::store::StoreError;

/// Every way a transfer step can fail
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("key load error: {0}")]
    KeyLoad(#[from] KeyError),
    #[error("key integrity error: {0}")]
    KeyIntegrity(ResolveError),
    #[error("encryption error: {0}")]
    Encryption(#[from] CipherError),
    #[error("{0}")]
    Decryption(#[from] DecryptionError),
    #[error("malformed package: {0}")]
    MalformedPackage(#[from] PackageError),
    #[error("malformed message: {0}")]
    Message(#[from] MessageError),
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("storage error: {0}")]
    Storage(StoreError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl TransferError {
    /// Status code of a failure to reach or be accepted by the recipient:
    /// `not-allowed` for 403 answers, `not-reachable` otherwise. Only
    /// recipient-facing calls produce [`TransferError::Transport`], local
    /// store failures have no code.
    pub fn transport_code(&self) -> Option<StatusCode> {
        match self {
            TransferError::Transport(e) => Some(e.status_code()),
            _ => None,
        }
    }

    /// Opaque text for operators
    pub fn diagnostic(&self) -> String {
        self.to_string()
    }
}

impl From<ResolveError> for TransferError {
    fn from(e: ResolveError) -> Self {
        TransferError::KeyIntegrity(e)
    }
}

/// Stream failures carry their cause inside the `io::Error`
impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        if is_decryption_error(&e) {
            return TransferError::Decryption(DecryptionError);
        }
        if let Some(validation) = validation_error(&e) {
            return TransferError::Validation(validation);
        }
        TransferError::Storage(StoreError::Io(e))
    }
}

impl From<StoreError> for TransferError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(e) => e.into(),
            e => TransferError::Storage(e),
        }
    }
}

impl From<IngestError> for TransferError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Store(e) => e.into(),
            IngestError::Package(e) => e.into(),
            IngestError::NotLocal(location) => TransferError::MalformedPackage(
                PackageError::Shape(format!("attachment {} is not inline", location)),
            ),
        }
    }
}
