//! Key providers: where encryption key material comes from.

use async_trait::async_trait;
use thiserror::Error;

use super::CryptoError;

mod file;
mod vault;

pub use file::FileProvider;
pub use vault::VaultProvider;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no {0} configured")]
    NotConfigured(&'static str),

    #[error("unable to read key {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Key(#[from] CryptoError),

    #[error("key request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected key service response: {0}")]
    Response(String),
}

/// Yields public/private key bytes on demand.
///
/// Providers are read-only after construction and shared across sinks;
/// callers never inspect the concrete variant.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn public_key(&self) -> Result<Vec<u8>, ProviderError>;

    async fn private_key(&self) -> Result<Vec<u8>, ProviderError>;
}

/// The provider used when no key material is configured; both lookups
/// fail explicitly instead of being silently skipped.
pub struct NullProvider;

#[async_trait]
impl KeyProvider for NullProvider {
    async fn public_key(&self) -> Result<Vec<u8>, ProviderError> {
        Err(ProviderError::NotConfigured("public key"))
    }

    async fn private_key(&self) -> Result<Vec<u8>, ProviderError> {
        Err(ProviderError::NotConfigured("private key"))
    }
}
