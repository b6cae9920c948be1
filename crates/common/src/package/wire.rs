//! Serialized form of a [`TransferPackage`]
//!
//! A package travels as a JSON document with a flat list of entries: one
//! `DocumentReference` descriptor plus zero or more `Binary` payloads.
//!
//! ```json
//! { "entries": [
//!     { "resourceType": "DocumentReference", "id": "…", "masterIdentifier": "PROJ-7",
//!       "author": "DIC1", "date": "2024-05-01T10:00:00Z",
//!       "content": [ { "id": "…", "contentType": "application/fhir+json",
//!                      "url": "urn:uuid:…" } ] },
//!     { "resourceType": "Binary", "id": "…", "contentType": "application/fhir+json",
//!       "data": "<base64>" }
//! ] }
//! ```
//!
//! An attachment is resolved from inline `data`, from a `urn:uuid:` url
//! naming a payload entry, or kept as a remote reference for any other url.

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{Attachment, AttachmentContent, PackageError, TransferPackage};

const URN_PREFIX: &str = "urn:uuid:";

/// Expected entry layout of a serialized package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageShape {
    /// Exactly one descriptor and one payload entry
    Single,
    /// One descriptor and any number of payload entries
    Multi,
}

impl PackageShape {
    /// The shape used to serialize `count` attachments
    pub fn for_attachments(count: usize) -> Self {
        if count == 1 {
            PackageShape::Single
        } else {
            PackageShape::Multi
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WirePackage {
    entries: Vec<WireEntry>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "resourceType")]
enum WireEntry {
    #[serde(rename = "DocumentReference", rename_all = "camelCase")]
    Descriptor {
        id: Uuid,
        master_identifier: String,
        author: String,
        #[serde(with = "time::serde::rfc3339")]
        date: OffsetDateTime,
        content: Vec<WireAttachment>,
    },
    #[serde(rename = "Binary", rename_all = "camelCase")]
    Payload {
        id: Uuid,
        content_type: String,
        data: String,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAttachment {
    id: Uuid,
    content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
}

fn encode_data(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn decode_data(data: &str) -> Result<Bytes, PackageError> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map(Bytes::from)
        .map_err(|e| PackageError::Encoding(format!("invalid base64: {}", e)))
}

impl TransferPackage {
    /// Serialize into the wire form of the given shape
    pub fn encode(&self, shape: PackageShape) -> Result<Bytes, PackageError> {
        self.check()?;

        let mut payloads = Vec::new();
        let content = match shape {
            PackageShape::Single => {
                let [attachment] = self.attachments.as_slice() else {
                    return Err(PackageError::Shape(format!(
                        "single-attachment package has {} attachments",
                        self.attachments.len()
                    )));
                };
                let data = attachment.inline_data().ok_or_else(|| {
                    PackageError::Shape("single-attachment package needs inline content".into())
                })?;
                payloads.push(WireEntry::Payload {
                    id: attachment.id,
                    content_type: attachment.mime_type.clone(),
                    data: encode_data(data),
                });
                vec![WireAttachment {
                    id: attachment.id,
                    content_type: attachment.mime_type.clone(),
                    data: None,
                    url: Some(format!("{}{}", URN_PREFIX, attachment.id)),
                }]
            }
            PackageShape::Multi => self
                .attachments
                .iter()
                .map(|a| {
                    let (data, url) = match &a.content {
                        AttachmentContent::Inline(data) => (Some(encode_data(data)), None),
                        AttachmentContent::Remote(location) => (None, Some(location.clone())),
                    };
                    WireAttachment {
                        id: a.id,
                        content_type: a.mime_type.clone(),
                        data,
                        url,
                    }
                })
                .collect(),
        };

        let mut entries = vec![WireEntry::Descriptor {
            id: self.id,
            master_identifier: self.project_identifier.clone(),
            author: self.author.clone(),
            date: self.created,
            content,
        }];
        entries.append(&mut payloads);

        let bytes = serde_json::to_vec(&WirePackage { entries })
            .map_err(|e| PackageError::Encoding(e.to_string()))?;
        Ok(Bytes::from(bytes))
    }

    /// Parse the wire form, enforcing the expected shape. A `Multi`
    /// expectation also accepts single-attachment packages.
    pub fn decode(bytes: &[u8], shape: PackageShape) -> Result<Self, PackageError> {
        let wire: WirePackage =
            serde_json::from_slice(bytes).map_err(|e| PackageError::Encoding(e.to_string()))?;

        let mut descriptors = Vec::new();
        let mut payloads = Vec::new();
        for entry in wire.entries {
            match entry {
                WireEntry::Descriptor {
                    id,
                    master_identifier,
                    author,
                    date,
                    content,
                } => descriptors.push((id, master_identifier, author, date, content)),
                WireEntry::Payload {
                    id,
                    content_type,
                    data,
                } => payloads.push((id, content_type, data)),
            }
        }

        if descriptors.len() != 1 {
            return Err(PackageError::Shape(format!(
                "expected exactly one descriptor, found {}",
                descriptors.len()
            )));
        }
        if shape == PackageShape::Single && payloads.len() != 1 {
            return Err(PackageError::Shape(format!(
                "expected exactly one payload entry, found {}",
                payloads.len()
            )));
        }

        let Some((id, project_identifier, author, created, content)) = descriptors.pop() else {
            return Err(PackageError::Shape("missing descriptor".into()));
        };
        if shape == PackageShape::Single && content.len() != 1 {
            return Err(PackageError::Shape(format!(
                "expected exactly one attachment, found {}",
                content.len()
            )));
        }

        let attachments = content
            .into_iter()
            .map(|a| {
                let content = match (a.data, a.url) {
                    (Some(data), _) => AttachmentContent::Inline(decode_data(&data)?),
                    (None, Some(url)) => match url.strip_prefix(URN_PREFIX) {
                        Some(reference) => {
                            let payload = payloads
                                .iter()
                                .find(|(pid, _, _)| pid.to_string() == reference)
                                .ok_or(PackageError::Unresolvable(a.id))?;
                            AttachmentContent::Inline(decode_data(&payload.2)?)
                        }
                        None => AttachmentContent::Remote(url),
                    },
                    (None, None) => return Err(PackageError::Unresolvable(a.id)),
                };
                Ok(Attachment {
                    id: a.id,
                    mime_type: a.content_type,
                    content,
                })
            })
            .collect::<Result<Vec<_>, PackageError>>()?;

        let package = Self {
            id,
            project_identifier,
            author,
            created,
            attachments,
        };
        package.check()?;
        Ok(package)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::package::Resource;

    fn fhir_package() -> TransferPackage {
        TransferPackage::build(
            "PROJ-7",
            "DIC1",
            vec![Resource::Structured(
                serde_json::json!({"resourceType": "Bundle", "type": "batch"}),
            )],
        )
        .unwrap()
    }

    #[test]
    fn test_single_shape() {
        let package = fhir_package();
        let bytes = package.encode(PackageShape::Single).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let entries = value["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["resourceType"], "DocumentReference");
        assert_eq!(entries[0]["masterIdentifier"], "PROJ-7");
        assert_eq!(entries[1]["resourceType"], "Binary");

        let decoded = TransferPackage::decode(&bytes, PackageShape::Single).unwrap();
        assert_eq!(decoded.project_identifier, "PROJ-7");
        assert_eq!(decoded.attachments, package.attachments);
        // multi accepts the single form too
        assert!(TransferPackage::decode(&bytes, PackageShape::Multi).is_ok());
    }

    #[test]
    fn test_multi_shape_with_remote() {
        let package = TransferPackage::build(
            "PROJ-7",
            "DIC1",
            vec![
                Resource::Binary {
                    content_type: "text/plain".into(),
                    data: Bytes::from_static(b"one"),
                },
                Resource::Remote {
                    content_type: "application/pdf".into(),
                    location: "https://dic.example.org/fhir/Binary/9".into(),
                },
            ],
        )
        .unwrap();

        assert!(package.encode(PackageShape::Single).is_err());
        let bytes = package.encode(PackageShape::Multi).unwrap();
        let decoded = TransferPackage::decode(&bytes, PackageShape::Multi).unwrap();
        assert_eq!(decoded.attachments, package.attachments);
        assert_eq!(decoded.author, "DIC1");
    }

    #[test]
    fn test_single_rejects_extra_entries() {
        let bytes = fhir_package().encode(PackageShape::Single).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let extra = value["entries"][1].clone();
        value["entries"].as_array_mut().unwrap().push(extra);
        let bytes = serde_json::to_vec(&value).unwrap();

        assert!(matches!(
            TransferPackage::decode(&bytes, PackageShape::Single),
            Err(PackageError::Shape(_))
        ));
        assert!(TransferPackage::decode(&bytes, PackageShape::Multi).is_ok());
    }

    #[test]
    fn test_rejects_missing_or_duplicate_descriptor() {
        let bytes = fhir_package().encode(PackageShape::Single).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        let descriptor = value["entries"][0].clone();
        value["entries"].as_array_mut().unwrap().push(descriptor);
        let doubled = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            TransferPackage::decode(&doubled, PackageShape::Multi),
            Err(PackageError::Shape(_))
        ));

        value["entries"].as_array_mut().unwrap().retain(|e| e["resourceType"] == "Binary");
        let headless = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            TransferPackage::decode(&headless, PackageShape::Multi),
            Err(PackageError::Shape(_))
        ));
    }

    #[test]
    fn test_dangling_reference_is_unresolvable() {
        let bytes = fhir_package().encode(PackageShape::Single).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        value["entries"][0]["content"][0]["url"] =
            serde_json::Value::String(format!("{}{}", URN_PREFIX, Uuid::new_v4()));
        let bytes = serde_json::to_vec(&value).unwrap();

        assert!(matches!(
            TransferPackage::decode(&bytes, PackageShape::Multi),
            Err(PackageError::Unresolvable(_))
        ));
    }

    #[test]
    fn test_attachment_without_content() {
        let bytes = fhir_package().encode(PackageShape::Multi).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        value["entries"][0]["content"][0]
            .as_object_mut()
            .unwrap()
            .remove("data");
        let bytes = serde_json::to_vec(&value).unwrap();

        assert!(matches!(
            TransferPackage::decode(&bytes, PackageShape::Multi),
            Err(PackageError::Unresolvable(_))
        ));
    }

    #[test]
    fn test_garbage() {
        assert!(matches!(
            TransferPackage::decode(b"{\"nope\":1}", PackageShape::Multi),
            Err(PackageError::Encoding(_))
        ));
    }
}
