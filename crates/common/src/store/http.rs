use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{
    Binary, Bundle, BundleEntry, ByteStream, Document, DocumentStore, StoreError, BINARY_PREFIX,
    DOCUMENT_PREFIX,
};

/// Header carrying the organization a binary is readable by
const READABLE_BY_HEADER: &str = "x-readable-by";
const BUNDLE_PREFIX: &str = "Bundle";

/// Document store reached over HTTP.
///
/// Records live under `{base}/DocumentReference/{id}`, `{base}/Binary/{id}`
/// and `{base}/Bundle/{name}`. Descriptors and bundles travel as JSON,
/// binaries as raw bodies with their content type.
#[derive(Debug, Clone)]
pub struct HttpDocumentStore {
    base: Url,
    client: Client,
}

#[derive(Deserialize)]
struct CreatedResponse {
    id: String,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum WireEntry {
    Descriptor(Document),
    #[serde(rename_all = "camelCase")]
    Binary {
        id: Option<String>,
        content_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        readable_by: Option<String>,
        /// Base64 encoded content
        data: String,
    },
}

#[derive(Serialize, Deserialize)]
struct WireBundle {
    entries: Vec<WireEntry>,
}

impl From<Bundle> for WireBundle {
    fn from(bundle: Bundle) -> Self {
        let entries = bundle
            .entries
            .into_iter()
            .map(|entry| match entry {
                BundleEntry::Descriptor(d) => WireEntry::Descriptor(d),
                BundleEntry::Binary(b) => WireEntry::Binary {
                    id: b.id,
                    content_type: b.content_type,
                    readable_by: b.readable_by,
                    data: base64::engine::general_purpose::STANDARD.encode(&b.data),
                },
            })
            .collect();
        Self { entries }
    }
}

impl TryFrom<WireBundle> for Bundle {
    type Error = StoreError;

    fn try_from(wire: WireBundle) -> Result<Self, Self::Error> {
        let entries = wire
            .entries
            .into_iter()
            .map(|entry| match entry {
                WireEntry::Descriptor(d) => Ok(BundleEntry::Descriptor(d)),
                WireEntry::Binary {
                    id,
                    content_type,
                    readable_by,
                    data,
                } => {
                    let data = base64::engine::general_purpose::STANDARD
                        .decode(data)
                        .map_err(|e| StoreError::Malformed(format!("binary data: {}", e)))?;
                    Ok(BundleEntry::Binary(Binary {
                        id,
                        content_type,
                        readable_by,
                        data: Bytes::from(data),
                    }))
                }
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(Bundle { entries })
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => status_error(status, e.to_string()),
            None if e.is_decode() => StoreError::Malformed(e.to_string()),
            None => StoreError::Transport(e.to_string()),
        }
    }
}

fn status_error(status: StatusCode, body: String) -> StoreError {
    match status {
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => StoreError::Forbidden(body),
        StatusCode::NOT_FOUND => StoreError::NotFound(body),
        status => StoreError::Status(status.as_u16(), body),
    }
}

impl HttpDocumentStore {
    pub fn new(base: &Url) -> Result<Self, StoreError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert("Accept", HeaderValue::from_static("application/json"));
        let client = Client::builder().default_headers(default_headers).build()?;

        Ok(Self {
            base: base.clone(),
            client,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidLocation(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let response = request.send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(status_error(status, body))
        }
    }

    fn content_type(response: &Response) -> String {
        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string()
    }

    fn with_readable_by(request: RequestBuilder, readable_by: Option<&str>) -> RequestBuilder {
        match readable_by {
            Some(org) => request.header(READABLE_BY_HEADER, org),
            None => request,
        }
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn read_document(&self, id: &str) -> Result<Document, StoreError> {
        let url = self.url(&[DOCUMENT_PREFIX, id])?;
        let response = self.send(self.client.get(url)).await?;
        Ok(response.json().await?)
    }

    async fn search_documents(
        &self,
        project_identifier: &str,
        author: Option<&str>,
    ) -> Result<Vec<Document>, StoreError> {
        let mut url = self.url(&[DOCUMENT_PREFIX])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("project", project_identifier);
            if let Some(author) = author {
                query.append_pair("author", author);
            }
        }
        let response = self.send(self.client.get(url)).await?;
        Ok(response.json().await?)
    }

    async fn create_document(&self, document: Document) -> Result<Document, StoreError> {
        let url = self.url(&[DOCUMENT_PREFIX])?;
        let response = self.send(self.client.post(url).json(&document)).await?;
        Ok(response.json().await?)
    }

    async fn update_document(&self, document: Document) -> Result<Document, StoreError> {
        let id = document
            .id
            .clone()
            .ok_or_else(|| StoreError::Internal("cannot update a document without id".into()))?;
        let url = self.url(&[DOCUMENT_PREFIX, &id])?;
        let response = self.send(self.client.put(url).json(&document)).await?;
        Ok(response.json().await?)
    }

    async fn delete_document(&self, id: &str) -> Result<(), StoreError> {
        let url = self.url(&[DOCUMENT_PREFIX, id])?;
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn create_binary(&self, binary: Binary) -> Result<String, StoreError> {
        let url = self.url(&[BINARY_PREFIX])?;
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, binary.content_type)
            .body(binary.data);
        let request = Self::with_readable_by(request, binary.readable_by.as_deref());
        let created: CreatedResponse = self.send(request).await?.json().await?;
        Ok(created.id)
    }

    async fn create_binary_stream(
        &self,
        content_type: &str,
        readable_by: Option<&str>,
        body: ByteStream,
    ) -> Result<String, StoreError> {
        let url = self.url(&[BINARY_PREFIX])?;
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, content_type)
            .body(reqwest::Body::wrap_stream(body));
        let request = Self::with_readable_by(request, readable_by);
        let created: CreatedResponse = self.send(request).await?.json().await?;
        Ok(created.id)
    }

    async fn read_binary(&self, id: &str) -> Result<Binary, StoreError> {
        let url = self.url(&[BINARY_PREFIX, id])?;
        let response = self
            .send(self.client.get(url).header("Accept", "*/*"))
            .await?;
        let content_type = Self::content_type(&response);
        let data = response.bytes().await?;
        Ok(Binary {
            id: Some(id.to_string()),
            content_type,
            readable_by: None,
            data,
        })
    }

    async fn read_binary_stream(&self, id: &str) -> Result<(String, ByteStream), StoreError> {
        let url = self.url(&[BINARY_PREFIX, id])?;
        let response = self
            .send(self.client.get(url).header("Accept", "*/*"))
            .await?;
        let content_type = Self::content_type(&response);
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            .boxed();
        Ok((content_type, stream))
    }

    async fn delete_binary(&self, id: &str) -> Result<(), StoreError> {
        let url = self.url(&[BINARY_PREFIX, id])?;
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn read_bundle(&self, name: &str) -> Result<Bundle, StoreError> {
        let url = self.url(&[BUNDLE_PREFIX, name])?;
        let wire: WireBundle = self.send(self.client.get(url)).await?.json().await?;
        wire.try_into()
    }

    async fn publish_bundle(&self, name: &str, bundle: Bundle) -> Result<(), StoreError> {
        let url = self.url(&[BUNDLE_PREFIX, name])?;
        let wire = WireBundle::from(bundle);
        self.send(self.client.put(url).json(&wire)).await?;
        Ok(())
    }
}
