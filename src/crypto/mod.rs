//! Layer encryption: streaming cipher, key wrapping, layer adapters and
//! key providers.
//!
//! Layers are encrypted with a per-layer AES-256-CTR key authenticated by
//! an HMAC-SHA256 over the ciphertext. The symmetric key material is
//! wrapped to the recipient's RSA public key as a compact JWE and stored
//! in the standard OCI encryption annotations on the layer descriptor.

use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;
use thiserror::Error;

pub mod cipher;
pub mod decrypted;
pub mod encrypted;
pub mod jwe;
pub mod providers;

pub use decrypted::DecryptedLayer;
pub use encrypted::EncryptedLayer;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("supplied bytes are not a valid public key")]
    NotPublicKey,

    #[error("supplied bytes are not a valid private key")]
    NotPrivateKey,

    #[error("malformed key envelope: {0}")]
    MalformedEnvelope(String),

    #[error(transparent)]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("malformed cipher options: {0}")]
    Options(#[from] serde_json::Error),
}

/// Parse a PEM public key, accepting both SubjectPublicKeyInfo and PKCS#1
/// encodings.
pub fn parse_public_key(pem: &[u8]) -> Result<PKey<Public>, CryptoError> {
    PKey::public_key_from_pem(pem)
        .or_else(|_| Rsa::public_key_from_pem_pkcs1(pem).and_then(PKey::from_rsa))
        .map_err(|_| CryptoError::NotPublicKey)
}

/// Parse a PEM private key (PKCS#8 or PKCS#1).
pub fn parse_private_key(pem: &[u8]) -> Result<PKey<Private>, CryptoError> {
    PKey::private_key_from_pem(pem).map_err(|_| CryptoError::NotPrivateKey)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_keys_parse_to_their_own_kind() {
        let (public, private) = test_keys::generate_pem_pair();

        assert!(parse_public_key(&public).is_ok());
        assert!(parse_private_key(&private).is_ok());
    }

    #[test]
    fn wrong_key_kind_is_rejected() {
        let (public, private) = test_keys::generate_pem_pair();

        assert!(matches!(
            parse_public_key(&private),
            Err(CryptoError::NotPublicKey)
        ));
        assert!(matches!(
            parse_private_key(&public),
            Err(CryptoError::NotPrivateKey)
        ));
    }

    #[test]
    fn garbage_is_not_a_key() {
        assert!(parse_public_key(b"not a key").is_err());
        assert!(parse_private_key(b"not a key").is_err());
    }
}
