//! File-backed key provider.

use std::path::PathBuf;

use async_trait::async_trait;

use super::{KeyProvider, ProviderError};
use crate::crypto::{parse_private_key, parse_public_key};

/// Reads PEM key material from disk, validating it on every fetch.
pub struct FileProvider {
    public_key_path: Option<PathBuf>,
    private_key_path: Option<PathBuf>,
}

impl FileProvider {
    pub fn new(public_key_path: Option<PathBuf>, private_key_path: Option<PathBuf>) -> Self {
        FileProvider {
            public_key_path,
            private_key_path,
        }
    }

    fn read(path: &PathBuf) -> Result<Vec<u8>, ProviderError> {
        std::fs::read(path).map_err(|source| ProviderError::Read {
            path: path.display().to_string(),
            source,
        })
    }
}

#[async_trait]
impl KeyProvider for FileProvider {
    async fn public_key(&self) -> Result<Vec<u8>, ProviderError> {
        let path = self
            .public_key_path
            .as_ref()
            .ok_or(ProviderError::NotConfigured("public key"))?;
        let bytes = Self::read(path)?;
        parse_public_key(&bytes)?;
        Ok(bytes)
    }

    async fn private_key(&self) -> Result<Vec<u8>, ProviderError> {
        let path = self
            .private_key_path
            .as_ref()
            .ok_or(ProviderError::NotConfigured("private key"))?;
        let bytes = Self::read(path)?;
        parse_private_key(&bytes)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoError, test_keys};

    #[tokio::test]
    async fn returns_valid_pem_bytes() {
        let td = tempfile::tempdir().unwrap();
        let (public, private) = test_keys::generate_pem_pair();
        let pub_path = td.path().join("key.pub");
        let priv_path = td.path().join("key.pem");
        std::fs::write(&pub_path, &public).unwrap();
        std::fs::write(&priv_path, &private).unwrap();

        let provider = FileProvider::new(Some(pub_path), Some(priv_path));
        assert_eq!(provider.public_key().await.unwrap(), public);
        assert_eq!(provider.private_key().await.unwrap(), private);
    }

    #[tokio::test]
    async fn unconfigured_side_fails() {
        let provider = FileProvider::new(None, None);
        assert!(matches!(
            provider.public_key().await,
            Err(ProviderError::NotConfigured(_))
        ));
        assert!(matches!(
            provider.private_key().await,
            Err(ProviderError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn non_key_content_is_rejected() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("key.pub");
        std::fs::write(&path, b"certainly not pem").unwrap();

        let provider = FileProvider::new(Some(path), None);
        assert!(matches!(
            provider.public_key().await,
            Err(ProviderError::Key(CryptoError::NotPublicKey))
        ));
    }

    #[tokio::test]
    async fn missing_file_names_the_path() {
        let provider = FileProvider::new(Some(PathBuf::from("/definitely/missing.pem")), None);
        let err = provider.public_key().await.unwrap_err();
        assert!(err.to_string().contains("/definitely/missing.pem"));
    }
}
