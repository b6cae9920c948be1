use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use uuid::Uuid;

use super::{Binary, Bundle, ByteStream, Document, DocumentStore, StoreError};

/// Chunk size used when serving binaries as streams
const STREAM_CHUNK_SIZE: usize = 16 * 1024;

/// In-memory document store
#[derive(Debug, Clone)]
pub struct MemoryDocumentStore {
    inner: Arc<RwLock<MemoryDocumentStoreInner>>,
    open_streams: Arc<AtomicUsize>,
}

#[derive(Debug, Default)]
struct MemoryDocumentStoreInner {
    /// Descriptors in creation order
    documents: Vec<Document>,
    binaries: HashMap<String, Binary>,
    bundles: HashMap<String, Bundle>,
    /// Number of upcoming calls that fail with a transport error
    injected_failures: usize,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryDocumentStoreInner::default())),
            open_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make the next `count` calls fail as if the store were unreachable
    pub fn inject_failures(&self, count: usize) {
        if let Ok(mut inner) = self.inner.write() {
            inner.injected_failures = count;
        }
    }

    /// Number of binary read streams handed out and not yet dropped
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    pub fn document_count(&self) -> usize {
        self.inner.read().map(|i| i.documents.len()).unwrap_or(0)
    }

    pub fn binary_count(&self) -> usize {
        self.inner.read().map(|i| i.binaries.len()).unwrap_or(0)
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, MemoryDocumentStoreInner>, StoreError> {
        self.inner
            .read()
            .map_err(|e| StoreError::Internal(format!("failed to acquire read lock: {}", e)))
    }

    /// Acquire the write lock, consuming one injected failure if any are pending
    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, MemoryDocumentStoreInner>, StoreError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Internal(format!("failed to acquire write lock: {}", e)))?;
        if inner.injected_failures > 0 {
            inner.injected_failures -= 1;
            return Err(StoreError::Transport("injected failure".to_string()));
        }
        Ok(inner)
    }

    /// Reads also go through the write lock so injected failures apply to them
    fn checked_read(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, MemoryDocumentStoreInner>, StoreError> {
        self.write()
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn read_document(&self, id: &str) -> Result<Document, StoreError> {
        let inner = self.checked_read()?;
        inner
            .documents
            .iter()
            .find(|d| d.id.as_deref() == Some(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(super::document_location(id)))
    }

    async fn search_documents(
        &self,
        project_identifier: &str,
        author: Option<&str>,
    ) -> Result<Vec<Document>, StoreError> {
        let inner = self.checked_read()?;
        Ok(inner
            .documents
            .iter()
            .filter(|d| d.project_identifier == project_identifier)
            .filter(|d| author.map(|a| d.author == a).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn create_document(&self, mut document: Document) -> Result<Document, StoreError> {
        let mut inner = self.write()?;
        document.id = Some(Uuid::new_v4().to_string());
        inner.documents.push(document.clone());
        Ok(document)
    }

    async fn update_document(&self, document: Document) -> Result<Document, StoreError> {
        let id = document
            .id
            .clone()
            .ok_or_else(|| StoreError::Internal("cannot update a document without id".into()))?;
        let mut inner = self.write()?;
        let slot = inner
            .documents
            .iter_mut()
            .find(|d| d.id.as_deref() == Some(id.as_str()))
            .ok_or_else(|| StoreError::NotFound(super::document_location(&id)))?;
        *slot = document.clone();
        Ok(document)
    }

    async fn delete_document(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let before = inner.documents.len();
        inner.documents.retain(|d| d.id.as_deref() != Some(id));
        if inner.documents.len() == before {
            return Err(StoreError::NotFound(super::document_location(id)));
        }
        Ok(())
    }

    async fn create_binary(&self, mut binary: Binary) -> Result<String, StoreError> {
        let mut inner = self.write()?;
        let id = Uuid::new_v4().to_string();
        binary.id = Some(id.clone());
        inner.binaries.insert(id.clone(), binary);
        Ok(id)
    }

    async fn create_binary_stream(
        &self,
        content_type: &str,
        readable_by: Option<&str>,
        body: ByteStream,
    ) -> Result<String, StoreError> {
        let chunks: Vec<Bytes> = body.try_collect().await?;
        let mut binary = Binary::new(content_type, Bytes::from(chunks.concat()));
        binary.readable_by = readable_by.map(str::to_string);
        self.create_binary(binary).await
    }

    async fn read_binary(&self, id: &str) -> Result<Binary, StoreError> {
        let inner = self.checked_read()?;
        inner
            .binaries
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(super::binary_location(id)))
    }

    async fn read_binary_stream(&self, id: &str) -> Result<(String, ByteStream), StoreError> {
        let binary = self.read_binary(id).await?;
        let data = binary.data;
        let chunks: Vec<std::io::Result<Bytes>> = (0..data.len())
            .step_by(STREAM_CHUNK_SIZE)
            .map(|start| Ok(data.slice(start..(start + STREAM_CHUNK_SIZE).min(data.len()))))
            .collect();
        let stream = TrackedStream::new(futures::stream::iter(chunks), self.open_streams.clone());
        Ok((binary.content_type, stream.boxed()))
    }

    async fn delete_binary(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        inner
            .binaries
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(super::binary_location(id)))
    }

    async fn read_bundle(&self, name: &str) -> Result<Bundle, StoreError> {
        let inner = self.read()?;
        inner
            .bundles
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("Bundle/{}", name)))
    }

    async fn publish_bundle(&self, name: &str, bundle: Bundle) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        inner.bundles.insert(name.to_string(), bundle);
        Ok(())
    }
}

/// Counts itself in `open` from creation until drop
struct TrackedStream<S> {
    inner: S,
    open: Arc<AtomicUsize>,
}

impl<S> TrackedStream<S> {
    fn new(inner: S, open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self { inner, open }
    }
}

impl<S: Stream + Unpin> Stream for TrackedStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<S> Drop for TrackedStream<S> {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}
