//! Compact JWE wrapping of per-layer key material.
//!
//! The envelope is the five-segment compact serialization with
//! `alg: RSA-OAEP` (key wrap) and `enc: A256GCM` (content encryption),
//! which is what OCI-encryption-aware consumers expect to find under the
//! `org.opencontainers.image.enc.keys.jwe` annotation.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Padding;
use openssl::symm::Cipher;
use rand::RngCore;
use serde_json::json;

use super::CryptoError;

const CEK_LEN: usize = 32;
const GCM_IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;

/// Wrap `payload` to the recipient's RSA public key.
pub fn wrap(public_key: &PKey<Public>, payload: &[u8]) -> Result<String, CryptoError> {
    let protected = URL_SAFE_NO_PAD.encode(
        serde_json::to_vec(&json!({"alg": "RSA-OAEP", "enc": "A256GCM"}))?,
    );

    let mut cek = [0u8; CEK_LEN];
    let mut iv = [0u8; GCM_IV_LEN];
    rand::rng().fill_bytes(&mut cek);
    rand::rng().fill_bytes(&mut iv);

    let rsa = public_key.rsa().map_err(|_| CryptoError::NotPublicKey)?;
    let mut wrapped = vec![0u8; rsa.size() as usize];
    let wrapped_len = rsa.public_encrypt(&cek, &mut wrapped, Padding::PKCS1_OAEP)?;
    wrapped.truncate(wrapped_len);

    let mut tag = [0u8; GCM_TAG_LEN];
    let ciphertext = openssl::symm::encrypt_aead(
        Cipher::aes_256_gcm(),
        &cek,
        Some(&iv),
        protected.as_bytes(),
        payload,
        &mut tag,
    )?;

    Ok(format!(
        "{}.{}.{}.{}.{}",
        protected,
        URL_SAFE_NO_PAD.encode(wrapped),
        URL_SAFE_NO_PAD.encode(iv),
        URL_SAFE_NO_PAD.encode(ciphertext),
        URL_SAFE_NO_PAD.encode(tag),
    ))
}

/// Unwrap a compact JWE with the recipient's RSA private key.
pub fn unwrap(private_key: &PKey<Private>, token: &str) -> Result<Vec<u8>, CryptoError> {
    let segments: Vec<&str> = token.split('.').collect();
    let [protected, wrapped, iv, ciphertext, tag] = segments.as_slice() else {
        return Err(CryptoError::MalformedEnvelope(format!(
            "expected 5 JWE segments, found {}",
            segments.len()
        )));
    };

    let decode = |segment: &str| {
        URL_SAFE_NO_PAD
            .decode(segment)
            .map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))
    };
    let wrapped = decode(wrapped)?;
    let iv = decode(iv)?;
    let ciphertext = decode(ciphertext)?;
    let tag = decode(tag)?;

    let rsa = private_key.rsa().map_err(|_| CryptoError::NotPrivateKey)?;
    let mut cek = vec![0u8; rsa.size() as usize];
    let cek_len = rsa.private_decrypt(&wrapped, &mut cek, Padding::PKCS1_OAEP)?;
    cek.truncate(cek_len);

    let payload = openssl::symm::decrypt_aead(
        Cipher::aes_256_gcm(),
        &cek,
        Some(&iv),
        protected.as_bytes(),
        &ciphertext,
        &tag,
    )?;

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;

    use super::*;

    fn keypair() -> (PKey<Public>, PKey<Private>) {
        let rsa = Rsa::generate(2048).unwrap();
        let public =
            PKey::public_key_from_pem(&rsa.public_key_to_pem().unwrap()).unwrap();
        let private = PKey::from_rsa(rsa).unwrap();
        (public, private)
    }

    #[test]
    fn wrap_then_unwrap_round_trips() {
        let (public, private) = keypair();
        let token = wrap(&public, b"{\"symkey\":\"abc\"}").unwrap();
        assert_eq!(token.split('.').count(), 5);

        let payload = unwrap(&private, &token).unwrap();
        assert_eq!(payload, b"{\"symkey\":\"abc\"}");
    }

    #[test]
    fn unwrap_with_the_wrong_key_fails() {
        let (public, _) = keypair();
        let (_, other_private) = keypair();

        let token = wrap(&public, b"secret").unwrap();
        assert!(unwrap(&other_private, &token).is_err());
    }

    #[test]
    fn truncated_token_is_malformed() {
        let (_, private) = keypair();
        assert!(matches!(
            unwrap(&private, "only.three.segments"),
            Err(CryptoError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_the_tag_check() {
        let (public, private) = keypair();
        let token = wrap(&public, b"secret").unwrap();

        let mut segments: Vec<String> = token.split('.').map(String::from).collect();
        let mut ct = URL_SAFE_NO_PAD.decode(&segments[3]).unwrap();
        ct[0] ^= 0xff;
        segments[3] = URL_SAFE_NO_PAD.encode(ct);

        assert!(unwrap(&private, &segments.join(".")).is_err());
    }
}
