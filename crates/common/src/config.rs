use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How a transfer package travels through the intermediary store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageMode {
    /// The whole package is serialized and encrypted as one binary
    Bundle,
    /// Every attachment is encrypted and stored as its own binary
    #[default]
    Attachments,
}

/// Fixed retry policy applied by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of tries, including the first one
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    /// Pause between tries
    #[serde(default = "default_retry_interval", with = "duration_secs")]
    pub interval: Duration,
}

fn default_retry_attempts() -> u32 {
    6
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            interval: default_retry_interval(),
        }
    }
}

impl RetryPolicy {
    /// A single try, no retries
    pub fn none() -> Self {
        Self {
            attempts: 1,
            interval: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfig {
    /// PKCS#8 PEM file of the local private key
    pub private_key_path: PathBuf,
    /// SPKI PEM file of the local public key
    pub public_key_path: PathBuf,
    /// RSA modulus size used when a keypair has to be generated
    #[serde(default = "default_modulus_bits")]
    pub modulus_bits: usize,
}

fn default_modulus_bits() -> usize {
    4096
}

impl KeyConfig {
    /// Key files named `private.pem` / `public.pem` inside `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            private_key_path: dir.join("private.pem"),
            public_key_path: dir.join("public.pem"),
            modulus_bits: default_modulus_bits(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Read attachments from the source store as streams
    #[serde(default)]
    pub read_source_binaries: bool,
    /// Read encrypted binaries from the intermediary store as streams
    #[serde(default)]
    pub read_transfer_binaries: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store holding the data to send
    #[serde(default)]
    pub source: Option<Url>,
    /// Store the encrypted transfer data is staged in
    #[serde(default)]
    pub intermediary: Option<Url>,
    /// Store received data sets are ingested into
    #[serde(default)]
    pub destination: Option<Url>,
}

/// Every tunable of a participant, passed at construction time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Identifier of the local organization, used as AAD and business key
    pub local_organization: String,
    pub keys: KeyConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub mode: PackageMode,
    #[serde(default)]
    pub stores: StoreConfig,
}

impl TransferConfig {
    pub fn new(local_organization: impl Into<String>, keys: KeyConfig) -> Self {
        Self {
            local_organization: local_organization.into(),
            keys,
            retry: RetryPolicy::default(),
            stream: StreamConfig::default(),
            mode: PackageMode::default(),
            stores: StoreConfig::default(),
        }
    }

    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml(&s)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.local_organization.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "local_organization must not be empty".into(),
            ));
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::Invalid("retry.attempts must be at least 1".into()));
        }
        if self.keys.modulus_bits < 2048 {
            return Err(ConfigError::Invalid(format!(
                "keys.modulus_bits must be at least 2048, got {}",
                self.keys.modulus_bits
            )));
        }
        Ok(())
    }
}

/// Durations as whole seconds in TOML
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
