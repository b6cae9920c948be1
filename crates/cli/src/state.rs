use std::fs;
use std::path::PathBuf;

use common::config::{ConfigError, KeyConfig, TransferConfig};
use common::crypto::{KeyError, KeyStore};

pub const APP_NAME: &str = "transfer";
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("no home directory found")]
    NoHomeDirectory,
    #[error("state directory already initialized")]
    AlreadyInitialized,
    #[error("state directory not initialized, run `transfer init` first")]
    NotInitialized,
    #[error("missing file: {0}")]
    MissingFile(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
}

/// The local participant: its state directory and loaded configuration
#[derive(Debug, Clone)]
pub struct AppState {
    /// Path to the state directory (~/.transfer)
    pub dir: PathBuf,
    pub config_path: PathBuf,
    pub config: TransferConfig,
}

impl AppState {
    /// Get the state directory path (custom or default ~/.transfer)
    pub fn dir(custom_path: Option<PathBuf>) -> Result<PathBuf, StateError> {
        if let Some(path) = custom_path {
            return Ok(path);
        }
        let home = dirs::home_dir().ok_or(StateError::NoHomeDirectory)?;
        Ok(home.join(format!(".{}", APP_NAME)))
    }

    /// Create the state directory, its config and the local key pair
    pub fn init(
        custom_path: Option<PathBuf>,
        organization: &str,
        modulus_bits: usize,
    ) -> Result<Self, StateError> {
        let dir = Self::dir(custom_path)?;
        if dir.exists() {
            return Err(StateError::AlreadyInitialized);
        }
        fs::create_dir_all(&dir)?;

        let mut keys = KeyConfig::in_dir(&dir);
        keys.modulus_bits = modulus_bits;
        let config = TransferConfig::new(organization, keys);
        // round-trip so an invalid config is rejected before anything is generated
        let config = TransferConfig::from_toml(&config.to_toml()?)?;

        let config_path = dir.join(CONFIG_FILE_NAME);
        fs::write(&config_path, config.to_toml()?)?;

        KeyStore::new(&config.keys).local_key_pair()?;

        Ok(Self {
            dir,
            config_path,
            config,
        })
    }

    /// Load existing state from the state directory
    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, StateError> {
        let dir = Self::dir(custom_path)?;
        if !dir.exists() {
            return Err(StateError::NotInitialized);
        }

        let config_path = dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            return Err(StateError::MissingFile(CONFIG_FILE_NAME.to_string()));
        }
        let config = TransferConfig::load(&config_path)?;

        for path in [&config.keys.private_key_path, &config.keys.public_key_path] {
            if !path.exists() {
                return Err(StateError::MissingFile(path.display().to_string()));
            }
        }

        Ok(Self {
            dir,
            config_path,
            config,
        })
    }

    pub fn key_store(&self) -> KeyStore {
        KeyStore::new(&self.config.keys)
    }
}
