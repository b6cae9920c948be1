use std::future::Future;

use async_trait::async_trait;

use super::{Binary, Bundle, ByteStream, Document, DocumentStore, StoreError};
use crate::config::RetryPolicy;

/// Run `call` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up. The last error is returned as-is.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut call: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && is_retryable(&e) => {
                tracing::warn!(
                    operation,
                    attempt,
                    attempts,
                    "call failed, retrying in {:?}: {}",
                    policy.interval,
                    e
                );
                tokio::time::sleep(policy.interval).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 1 {
                    tracing::warn!(operation, attempt, "giving up after {} attempts: {}", attempt, e);
                }
                return Err(e);
            }
        }
    }
}

/// Applies a [`RetryPolicy`] to every call of the wrapped store.
///
/// Calls that consume a stream are tried once, a body cannot be replayed.
#[derive(Debug, Clone)]
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: DocumentStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn retry<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        with_retry(&self.policy, operation, StoreError::is_retryable, call).await
    }
}

#[async_trait]
impl<S: DocumentStore> DocumentStore for RetryingStore<S> {
    async fn read_document(&self, id: &str) -> Result<Document, StoreError> {
        self.retry("read_document", || self.inner.read_document(id))
            .await
    }

    async fn search_documents(
        &self,
        project_identifier: &str,
        author: Option<&str>,
    ) -> Result<Vec<Document>, StoreError> {
        self.retry("search_documents", || {
            self.inner.search_documents(project_identifier, author)
        })
        .await
    }

    async fn create_document(&self, document: Document) -> Result<Document, StoreError> {
        self.retry("create_document", || {
            self.inner.create_document(document.clone())
        })
        .await
    }

    async fn update_document(&self, document: Document) -> Result<Document, StoreError> {
        self.retry("update_document", || {
            self.inner.update_document(document.clone())
        })
        .await
    }

    async fn delete_document(&self, id: &str) -> Result<(), StoreError> {
        self.retry("delete_document", || self.inner.delete_document(id))
            .await
    }

    async fn create_binary(&self, binary: Binary) -> Result<String, StoreError> {
        self.retry("create_binary", || self.inner.create_binary(binary.clone()))
            .await
    }

    async fn create_binary_stream(
        &self,
        content_type: &str,
        readable_by: Option<&str>,
        body: ByteStream,
    ) -> Result<String, StoreError> {
        self.inner
            .create_binary_stream(content_type, readable_by, body)
            .await
    }

    async fn read_binary(&self, id: &str) -> Result<Binary, StoreError> {
        self.retry("read_binary", || self.inner.read_binary(id)).await
    }

    async fn read_binary_stream(&self, id: &str) -> Result<(String, ByteStream), StoreError> {
        self.retry("read_binary_stream", || self.inner.read_binary_stream(id))
            .await
    }

    async fn delete_binary(&self, id: &str) -> Result<(), StoreError> {
        self.retry("delete_binary", || self.inner.delete_binary(id))
            .await
    }

    async fn read_bundle(&self, name: &str) -> Result<Bundle, StoreError> {
        self.retry("read_bundle", || self.inner.read_bundle(name)).await
    }

    async fn publish_bundle(&self, name: &str, bundle: Bundle) -> Result<(), StoreError> {
        self.retry("publish_bundle", || {
            self.inner.publish_bundle(name, bundle.clone())
        })
        .await
    }
}
