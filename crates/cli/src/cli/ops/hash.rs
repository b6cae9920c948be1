use clap::Args;

use crate::state::{AppState, StateError};

/// Print the hash partners verify the published public key against
#[derive(Args, Debug, Clone)]
pub struct Hash;

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("hash failed: {0}")]
    StateFailed(#[from] StateError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Hash {
    type Error = HashError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;
        let published = state.key_store().publish().map_err(StateError::from)?;
        Ok(published.sha256)
    }
}
