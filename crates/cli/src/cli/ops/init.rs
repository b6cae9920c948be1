use clap::Args;

use crate::state::{AppState, StateError};

#[derive(Args, Debug, Clone)]
pub struct Init {
    /// Identifier of the local organization
    #[arg(long)]
    pub organization: String,

    /// RSA modulus size of the generated key pair
    #[arg(long, default_value_t = 4096)]
    pub modulus_bits: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("init failed: {0}")]
    StateFailed(#[from] StateError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Init {
    type Error = InitError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::init(ctx.config_path.clone(), &self.organization, self.modulus_bits)?;
        let published = state.key_store().publish().map_err(StateError::from)?;

        Ok(format!(
            "Initialized transfer directory at: {}\n\
             - Organization: {}\n\
             - Config: {}\n\
             - Private key: {}\n\
             - Public key: {}\n\
             - Public key sha256: {}",
            state.dir.display(),
            state.config.local_organization,
            state.config_path.display(),
            state.config.keys.private_key_path.display(),
            state.config.keys.public_key_path.display(),
            published.sha256
        ))
    }
}
