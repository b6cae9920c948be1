//! Transfer packages
//!
//! A [`TransferPackage`] is one logical data set on its way from the sender
//! to the receiver: the project it belongs to, the authoring organization
//! and an ordered list of attachments. Attachments carry their declared
//! MIME type and either inline bytes or a reference to a remote location.

mod json;
pub mod mime;
mod wire;

use bytes::Bytes;
use time::OffsetDateTime;
use uuid::Uuid;

pub use mime::{validate, validate_stream, validation_error, ValidationError};
pub use wire::PackageShape;

/// MIME type given to structured (non-binary) resources
pub const STRUCTURED_MIME_TYPE: &str = "application/fhir+json";
/// MIME type of a serialized package stored as a single binary
pub const PACKAGE_MIME_TYPE: &str = "application/vnd.transfer-package+json";

#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("package has no attachments")]
    Empty,
    #[error("package is missing its {0}")]
    MissingField(&'static str),
    #[error("attachment {0} has no resolvable content")]
    Unresolvable(Uuid),
    #[error("attachment {0} declares an invalid MIME type: {1}")]
    InvalidMimeType(Uuid, String),
    #[error("unexpected package shape: {0}")]
    Shape(String),
    #[error("malformed package encoding: {0}")]
    Encoding(String),
}

/// Input to [`TransferPackage::build`]
#[derive(Debug, Clone)]
pub enum Resource {
    /// A structured record, serialized as JSON
    Structured(serde_json::Value),
    /// Raw bytes with a caller-declared content type
    Binary { content_type: String, data: Bytes },
    /// Content that stays at a remote location until it is streamed
    Remote {
        content_type: String,
        location: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentContent {
    Inline(Bytes),
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: Uuid,
    pub mime_type: String,
    pub content: AttachmentContent,
}

impl Attachment {
    pub fn inline(mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mime_type: mime_type.into(),
            content: AttachmentContent::Inline(data.into()),
        }
    }

    pub fn remote(mime_type: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mime_type: mime_type.into(),
            content: AttachmentContent::Remote(location.into()),
        }
    }

    pub fn inline_data(&self) -> Option<&Bytes> {
        match &self.content {
            AttachmentContent::Inline(data) => Some(data),
            AttachmentContent::Remote(_) => None,
        }
    }

    fn is_resolvable(&self) -> bool {
        match &self.content {
            AttachmentContent::Inline(_) => true,
            AttachmentContent::Remote(location) => !location.trim().is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPackage {
    pub id: Uuid,
    /// Master identifier of the data set
    pub project_identifier: String,
    /// Identifier of the authoring organization
    pub author: String,
    pub created: OffsetDateTime,
    pub attachments: Vec<Attachment>,
}

impl TransferPackage {
    /// Assemble a package, giving it and every attachment a fresh identifier
    pub fn build(
        project_identifier: &str,
        author: &str,
        resources: Vec<Resource>,
    ) -> Result<Self, PackageError> {
        if resources.is_empty() {
            return Err(PackageError::Empty);
        }

        let attachments = resources
            .into_iter()
            .map(|resource| {
                let attachment = match resource {
                    Resource::Structured(value) => {
                        let data = serde_json::to_vec(&value)
                            .map_err(|e| PackageError::Encoding(e.to_string()))?;
                        Attachment::inline(STRUCTURED_MIME_TYPE, data)
                    }
                    Resource::Binary { content_type, data } => {
                        Attachment::inline(content_type, data)
                    }
                    Resource::Remote {
                        content_type,
                        location,
                    } => Attachment::remote(content_type, location),
                };
                check_mime_type(&attachment)?;
                Ok(attachment)
            })
            .collect::<Result<Vec<_>, PackageError>>()?;

        let package = Self {
            id: Uuid::new_v4(),
            project_identifier: project_identifier.to_string(),
            author: author.to_string(),
            created: OffsetDateTime::now_utc(),
            attachments,
        };
        package.check()?;
        Ok(package)
    }

    /// Split into `(project identifier, author, attachments)` after
    /// checking every attachment can be resolved
    pub fn parse(self) -> Result<(String, String, Vec<Attachment>), PackageError> {
        self.check()?;
        Ok((self.project_identifier, self.author, self.attachments))
    }

    fn check(&self) -> Result<(), PackageError> {
        if self.project_identifier.trim().is_empty() {
            return Err(PackageError::MissingField("project identifier"));
        }
        if self.author.trim().is_empty() {
            return Err(PackageError::MissingField("author"));
        }
        if self.attachments.is_empty() {
            return Err(PackageError::Empty);
        }
        for attachment in &self.attachments {
            if !attachment.is_resolvable() {
                return Err(PackageError::Unresolvable(attachment.id));
            }
            check_mime_type(attachment)?;
        }
        Ok(())
    }

    /// Whether every attachment carries its bytes inline
    pub fn is_inline(&self) -> bool {
        self.attachments.iter().all(|a| a.inline_data().is_some())
    }
}

fn check_mime_type(attachment: &Attachment) -> Result<(), PackageError> {
    attachment
        .mime_type
        .parse::<::mime::Mime>()
        .map(|_| ())
        .map_err(|_| PackageError::InvalidMimeType(attachment.id, attachment.mime_type.clone()))
}
