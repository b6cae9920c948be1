//! Idempotent ingestion of received data sets
//!
//! A received data set is keyed by `(project identifier, sending
//! organization)`. Ingesting the same key again replaces the attachments of
//! the existing descriptor in place instead of creating a second one.
//!
//! The upsert is not transactional: attachments are stored first and the
//! descriptor is created or updated afterwards. An interruption in between
//! leaves stored binaries that no descriptor references. Attachments of a
//! replaced descriptor are likewise left in the store.

use std::sync::Arc;

use crate::anomaly::{pick_first, AnomalyKind, MergeAnomaly};
use crate::package::{AttachmentContent, PackageError, TransferPackage};
use crate::store::{binary_location, AttachmentRef, Binary, Body, Document, DocumentStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid package: {0}")]
    Package(#[from] PackageError),
    #[error("attachment {0} is not available locally")]
    NotLocal(String),
}

/// One decrypted attachment ready to be stored
#[derive(Debug)]
pub struct IncomingAttachment {
    pub mime_type: String,
    pub body: Body,
}

/// Result of a successful ingest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Id of the descriptor now holding the data set
    pub document_id: String,
    /// Whether a new descriptor was created
    pub created: bool,
    /// Set when more than one descriptor matched the key
    pub anomaly: Option<MergeAnomaly>,
}

#[derive(Debug, Clone)]
pub struct Ingestor {
    store: Arc<dyn DocumentStore>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Upsert a decrypted package whose attachments are all inline
    pub async fn ingest(
        &self,
        package: TransferPackage,
        sending_org: &str,
    ) -> Result<IngestOutcome, IngestError> {
        let (project_identifier, _, attachments) = package.parse()?;
        let attachments = attachments
            .into_iter()
            .map(|a| match a.content {
                AttachmentContent::Inline(data) => Ok(IncomingAttachment {
                    mime_type: a.mime_type,
                    body: Body::Full(data),
                }),
                AttachmentContent::Remote(location) => Err(IngestError::NotLocal(location)),
            })
            .collect::<Result<Vec<_>, IngestError>>()?;

        self.ingest_attachments(&project_identifier, sending_org, attachments)
            .await
    }

    /// Upsert attachments, buffered or streamed, under the business key
    /// `(project_identifier, sending_org)`
    pub async fn ingest_attachments(
        &self,
        project_identifier: &str,
        sending_org: &str,
        attachments: Vec<IncomingAttachment>,
    ) -> Result<IngestOutcome, IngestError> {
        if attachments.is_empty() {
            return Err(PackageError::Empty.into());
        }

        let matches = self
            .store
            .search_documents(project_identifier, Some(sending_org))
            .await?;
        let key = format!("{}|{}", project_identifier, sending_org);
        let (existing, anomaly) = pick_first(matches, AnomalyKind::StoredDocument, &key);

        let mut refs = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let id = match attachment.body {
                Body::Full(data) => {
                    self.store
                        .create_binary(Binary::new(attachment.mime_type.clone(), data))
                        .await?
                }
                Body::Stream(stream) => {
                    self.store
                        .create_binary_stream(&attachment.mime_type, None, stream)
                        .await?
                }
            };
            refs.push(AttachmentRef {
                location: binary_location(&id),
                mime_type: attachment.mime_type,
                hash: None,
            });
        }

        let (document, created) = match existing {
            Some(mut document) => {
                document.attachments = refs;
                (self.store.update_document(document).await?, false)
            }
            None => {
                let mut document = Document::new(project_identifier, sending_org);
                document.attachments = refs;
                (self.store.create_document(document).await?, true)
            }
        };

        let document_id = document
            .id
            .ok_or_else(|| StoreError::Malformed("stored document has no id".into()))?;
        tracing::info!(
            project = project_identifier,
            author = sending_org,
            document = %document_id,
            created,
            "ingested data set"
        );

        Ok(IngestOutcome {
            document_id,
            created,
            anomaly,
        })
    }
}
