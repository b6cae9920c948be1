//! Document store collaborator
//!
//! Every participant talks to a document-oriented store: descriptors
//! (metadata records pointing at attachments) and binaries (opaque bytes
//! with a content type). The protocol only depends on the operation
//! contracts of [`DocumentStore`]; [`MemoryDocumentStore`] backs tests and
//! embedding, [`HttpDocumentStore`] talks to a remote store, and
//! [`RetryingStore`] applies a fixed retry policy around either.

mod http;
mod memory;
mod retry;

use std::fmt;
use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use http::HttpDocumentStore;
pub use memory::MemoryDocumentStore;
pub use retry::{with_retry, RetryingStore};

/// Location prefix of descriptor records
pub const DOCUMENT_PREFIX: &str = "DocumentReference";
/// Location prefix of binary records
pub const BINARY_PREFIX: &str = "Binary";

/// A boxed stream of byte chunks, used for every stream-mode read and write
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("access forbidden: {0}")]
    Forbidden(String),
    #[error("unexpected store response {0}: {1}")]
    Status(u16, String),
    #[error("store unreachable: {0}")]
    Transport(String),
    #[error("invalid record location: {0}")]
    InvalidLocation(String),
    #[error("malformed store response: {0}")]
    Malformed(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_forbidden(&self) -> bool {
        matches!(self, StoreError::Forbidden(_))
    }

    /// Whether another attempt of the same call could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transport(_) => true,
            StoreError::Status(code, _) => *code >= 500 || *code == 429,
            _ => false,
        }
    }
}

/// Lifecycle of a descriptor record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentStatus {
    /// Created but its attachments are not yet complete
    Preliminary,
    /// Attachments are complete
    Final,
}

/// Reference from a descriptor to one attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    /// Relative (`Binary/<id>`) or absolute location of the bytes
    pub location: String,
    /// MIME type of the content the location resolves to
    pub mime_type: String,
    /// Lowercase hex SHA-256 of the referenced bytes, when declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// A descriptor record, uniquely keyed by `(project_identifier, author)`
/// at the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Assigned by the store on create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub project_identifier: String,
    /// Identifier of the authoring organization
    pub author: String,
    pub status: DocumentStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    /// Organization allowed to read this record besides the author
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readable_by: Option<String>,
    pub attachments: Vec<AttachmentRef>,
}

impl Document {
    pub fn new(project_identifier: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: None,
            project_identifier: project_identifier.into(),
            author: author.into(),
            status: DocumentStatus::Final,
            created: OffsetDateTime::now_utc(),
            readable_by: None,
            attachments: Vec::new(),
        }
    }

    /// Relative location of this record, once it has an id
    pub fn location(&self) -> Option<String> {
        self.id.as_ref().map(|id| document_location(id))
    }
}

/// A binary record
#[derive(Clone, PartialEq, Eq)]
pub struct Binary {
    /// Assigned by the store on create
    pub id: Option<String>,
    pub content_type: String,
    pub readable_by: Option<String>,
    pub data: Bytes,
}

impl Binary {
    pub fn new(content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            id: None,
            content_type: content_type.into(),
            readable_by: None,
            data: data.into(),
        }
    }
}

impl fmt::Debug for Binary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binary")
            .field("id", &self.id)
            .field("content_type", &self.content_type)
            .field("readable_by", &self.readable_by)
            .field("len", &self.data.len())
            .finish()
    }
}

/// One entry of a published bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleEntry {
    Descriptor(Document),
    Binary(Binary),
}

/// A named group of records fetched together, used for key publication
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bundle {
    pub entries: Vec<BundleEntry>,
}

impl Bundle {
    pub fn descriptors(&self) -> Vec<&Document> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                BundleEntry::Descriptor(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    pub fn binaries(&self) -> Vec<&Binary> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                BundleEntry::Binary(b) => Some(b),
                _ => None,
            })
            .collect()
    }
}

/// Content of one attachment, either fully buffered or streamed
pub enum Body {
    Full(Bytes),
    Stream(ByteStream),
}

impl Body {
    /// Buffer the whole body
    pub async fn collect(self) -> io::Result<Bytes> {
        match self {
            Body::Full(bytes) => Ok(bytes),
            Body::Stream(stream) => {
                let chunks: Vec<Bytes> = stream.try_collect().await?;
                Ok(Bytes::from(chunks.concat()))
            }
        }
    }

    /// View the body as a stream
    pub fn into_stream(self) -> ByteStream {
        match self {
            Body::Full(bytes) => futures::stream::once(async move { Ok(bytes) }).boxed(),
            Body::Stream(stream) => stream,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Full(bytes) => write!(f, "Body::Full({} bytes)", bytes.len()),
            Body::Stream(_) => write!(f, "Body::Stream"),
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync + fmt::Debug + 'static {
    /// Read a descriptor by id
    async fn read_document(&self, id: &str) -> Result<Document, StoreError>;

    /// Search descriptors by project identifier and, optionally, author.
    ///
    /// # Returns
    /// Matches in a stable order (oldest first).
    async fn search_documents(
        &self,
        project_identifier: &str,
        author: Option<&str>,
    ) -> Result<Vec<Document>, StoreError>;

    /// Create a descriptor, returning it with its assigned id
    async fn create_document(&self, document: Document) -> Result<Document, StoreError>;

    /// Replace an existing descriptor in place. The id must be set.
    async fn update_document(&self, document: Document) -> Result<Document, StoreError>;

    /// Permanently delete a descriptor
    async fn delete_document(&self, id: &str) -> Result<(), StoreError>;

    /// Store a binary, returning its assigned id
    async fn create_binary(&self, binary: Binary) -> Result<String, StoreError>;

    /// Store a binary from a stream without buffering it first.
    ///
    /// The stream is consumed or dropped before this returns.
    async fn create_binary_stream(
        &self,
        content_type: &str,
        readable_by: Option<&str>,
        body: ByteStream,
    ) -> Result<String, StoreError>;

    async fn read_binary(&self, id: &str) -> Result<Binary, StoreError>;

    /// Open a binary as a stream, returning its content type and body
    async fn read_binary_stream(&self, id: &str) -> Result<(String, ByteStream), StoreError>;

    /// Permanently delete a binary
    async fn delete_binary(&self, id: &str) -> Result<(), StoreError>;

    /// Fetch a published bundle by name
    async fn read_bundle(&self, name: &str) -> Result<Bundle, StoreError>;

    /// Publish (or replace) a bundle under a name
    async fn publish_bundle(&self, name: &str, bundle: Bundle) -> Result<(), StoreError>;
}

pub fn document_location(id: &str) -> String {
    format!("{}/{}", DOCUMENT_PREFIX, id)
}

pub fn binary_location(id: &str) -> String {
    format!("{}/{}", BINARY_PREFIX, id)
}

/// Extract the record id from a location of the given type.
///
/// Accepts relative locations (`Binary/<id>`) and absolute URLs whose
/// path ends in `<prefix>/<id>`. Absolute URLs must start with `base`
/// when one is given.
pub fn parse_location(
    location: &str,
    prefix: &str,
    base: Option<&url::Url>,
) -> Result<String, StoreError> {
    let invalid = || StoreError::InvalidLocation(location.to_string());

    let path = if location.contains("://") {
        let url = url::Url::parse(location).map_err(|_| invalid())?;
        if let Some(base) = base {
            if !url.as_str().starts_with(base.as_str().trim_end_matches('/')) {
                return Err(invalid());
            }
        }
        url.path().to_string()
    } else {
        location.to_string()
    };

    let mut segments = path.trim_matches('/').rsplit('/');
    let id = segments.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
    let kind = segments.next().ok_or_else(invalid)?;
    if kind != prefix {
        return Err(invalid());
    }
    Ok(id.to_string())
}
