use clap::Args;
use url::Url;

use common::crypto::ResolveError;
use common::store::{HttpDocumentStore, RetryingStore, StoreError};

use crate::state::{AppState, StateError};

/// Publish the local public key and its hash for partners to resolve
#[derive(Args, Debug, Clone)]
pub struct Publish {
    /// Document store to publish to (defaults to the configured destination store)
    #[arg(long)]
    pub store: Option<Url>,
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publish failed: {0}")]
    StateFailed(#[from] StateError),
    #[error("no store given and no destination store configured")]
    NoStore,
    #[error("publish failed: {0}")]
    Store(#[from] StoreError),
    #[error("publish failed: {0}")]
    Resolve(#[from] ResolveError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Publish {
    type Error = PublishError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;
        let url = self
            .store
            .clone()
            .or_else(|| state.config.stores.destination.clone())
            .ok_or(PublishError::NoStore)?;

        let store = RetryingStore::new(HttpDocumentStore::new(&url)?, state.config.retry);
        let owner = &state.config.local_organization;
        let published = state.key_store().publish_to(&store, owner).await?;

        Ok(format!(
            "Published public key of {} to {}\n - sha256: {}",
            owner, url, published.sha256
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::op::{Op, OpContext};

    #[tokio::test]
    async fn test_publish_without_store() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("state");
        AppState::init(Some(dir.clone()), "DMS1", 2048).unwrap();

        let result = Publish { store: None }
            .execute(&OpContext::new(Some(dir)))
            .await;
        assert!(matches!(result, Err(PublishError::NoStore)));
    }
}
