//! The streaming layer cipher: AES-256-CTR with an HMAC-SHA256 over the
//! ciphertext.
//!
//! Encryption generates a fresh key and IV per layer. The HMAC is only
//! known once the stream has been fully consumed; the encrypting reader
//! publishes it (with the key material) through a shared cell the layer
//! adapter's finalizer picks up. Decryption verifies the HMAC at EOF and
//! fails the read when the ciphertext does not authenticate.

use std::io::Read;
use std::sync::{Arc, Mutex};

use hmac::{Hmac, Mac};
use openssl::symm::{Cipher, Crypter, Mode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::CryptoError;
use crate::image::LayerStream;

type HmacSha256 = Hmac<Sha256>;

/// Cipher identifier recorded in the public options annotation.
pub const LAYER_CIPHER: &str = "AES_256_CTR_HMAC_SHA256";

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const CHUNK: usize = 64 * 1024;

/// Key material wrapped to the recipient inside the JWE annotation.
#[derive(Debug, Serialize, Deserialize)]
pub struct PrivateOptions {
    /// base64 AES-256 key.
    pub symkey: String,
    /// base64 CTR initialization vector.
    pub iv: String,
    /// Digest of the plaintext (compressed) layer bytes, for verification
    /// after decryption.
    pub digest: String,
}

/// Cleartext cipher description stored base64-encoded in the pubopts
/// annotation.
#[derive(Debug, Serialize, Deserialize)]
pub struct PublicOptions {
    pub cipher: String,
    /// base64 HMAC-SHA256 over the ciphertext.
    pub hmac: String,
}

/// Post-consumption cipher metadata, published once the stream drains.
#[derive(Debug, Clone)]
pub struct CipherMeta {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
    pub hmac: Vec<u8>,
}

/// Shared cell the encrypting reader fills at EOF.
pub type MetaCell = Arc<Mutex<Option<CipherMeta>>>;

pub fn new_meta_cell() -> MetaCell {
    Arc::new(Mutex::new(None))
}

/// Encrypts an inner stream with a freshly generated key and IV,
/// accumulating the ciphertext HMAC as it goes. The metadata cell is
/// filled when the inner stream reaches EOF.
pub struct EncryptingReader {
    inner: LayerStream,
    crypter: Crypter,
    mac: Option<HmacSha256>,
    key: Vec<u8>,
    iv: Vec<u8>,
    meta: MetaCell,
    pending: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl EncryptingReader {
    pub fn new(inner: LayerStream, meta: MetaCell) -> Result<Self, CryptoError> {
        let mut key = vec![0u8; KEY_LEN];
        let mut iv = vec![0u8; IV_LEN];
        rand::rng().fill_bytes(&mut key);
        rand::rng().fill_bytes(&mut iv);

        let crypter = Crypter::new(Cipher::aes_256_ctr(), Mode::Encrypt, &key, Some(&iv))?;
        let mac = HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");

        Ok(EncryptingReader {
            inner,
            crypter,
            mac: Some(mac),
            key,
            iv,
            meta,
            pending: Vec::new(),
            pos: 0,
            eof: false,
        })
    }

    fn publish_meta(&mut self) {
        if let Some(mac) = self.mac.take() {
            *self.meta.lock().unwrap() = Some(CipherMeta {
                key: self.key.clone(),
                iv: self.iv.clone(),
                hmac: mac.finalize().into_bytes().to_vec(),
            });
        }
    }
}

impl Read for EncryptingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.pos < self.pending.len() {
                let n = (self.pending.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }

            let mut chunk = vec![0u8; CHUNK];
            let n = self.inner.read(&mut chunk)?;
            if n == 0 {
                let mut tail = vec![0u8; Cipher::aes_256_ctr().block_size()];
                let written = self
                    .crypter
                    .finalize(&mut tail)
                    .map_err(std::io::Error::other)?;
                tail.truncate(written);
                if !tail.is_empty() {
                    if let Some(mac) = self.mac.as_mut() {
                        mac.update(&tail);
                    }
                }
                self.pending = tail;
                self.pos = 0;
                self.eof = true;
                self.publish_meta();
                continue;
            }

            let mut ciphertext = vec![0u8; n + Cipher::aes_256_ctr().block_size()];
            let written = self
                .crypter
                .update(&chunk[..n], &mut ciphertext)
                .map_err(std::io::Error::other)?;
            ciphertext.truncate(written);
            if let Some(mac) = self.mac.as_mut() {
                mac.update(&ciphertext);
            }
            self.pending = ciphertext;
            self.pos = 0;
        }
    }
}

/// Decrypts a ciphertext stream, verifying the HMAC at EOF. An HMAC
/// mismatch (wrong key material or corrupted blob) fails the final read.
pub struct DecryptingReader {
    inner: LayerStream,
    crypter: Crypter,
    mac: Option<HmacSha256>,
    expected_hmac: Vec<u8>,
    pending: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl DecryptingReader {
    pub fn new(
        inner: LayerStream,
        key: &[u8],
        iv: &[u8],
        expected_hmac: Vec<u8>,
    ) -> Result<Self, CryptoError> {
        let crypter = Crypter::new(Cipher::aes_256_ctr(), Mode::Decrypt, key, Some(iv))?;
        let mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");

        Ok(DecryptingReader {
            inner,
            crypter,
            mac: Some(mac),
            expected_hmac,
            pending: Vec::new(),
            pos: 0,
            eof: false,
        })
    }
}

impl Read for DecryptingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.pos < self.pending.len() {
                let n = (self.pending.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }

            let mut chunk = vec![0u8; CHUNK];
            let n = self.inner.read(&mut chunk)?;
            if n == 0 {
                let mut tail = vec![0u8; Cipher::aes_256_ctr().block_size()];
                let written = self
                    .crypter
                    .finalize(&mut tail)
                    .map_err(std::io::Error::other)?;
                tail.truncate(written);
                self.pending = tail;
                self.pos = 0;
                self.eof = true;

                if let Some(mac) = self.mac.take() {
                    mac.verify_slice(&self.expected_hmac).map_err(|_| {
                        std::io::Error::other("layer ciphertext failed authentication")
                    })?;
                }
                continue;
            }

            if let Some(mac) = self.mac.as_mut() {
                mac.update(&chunk[..n]);
            }
            let mut plaintext = vec![0u8; n + Cipher::aes_256_ctr().block_size()];
            let written = self
                .crypter
                .update(&chunk[..n], &mut plaintext)
                .map_err(std::io::Error::other)?;
            plaintext.truncate(written);
            self.pending = plaintext;
            self.pos = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn encrypt_all(plaintext: &[u8]) -> (Vec<u8>, CipherMeta) {
        let meta = new_meta_cell();
        let mut enc = EncryptingReader::new(
            Box::new(Cursor::new(plaintext.to_vec())),
            meta.clone(),
        )
        .unwrap();
        let mut ciphertext = Vec::new();
        enc.read_to_end(&mut ciphertext).unwrap();
        let meta = meta.lock().unwrap().clone().unwrap();
        (ciphertext, meta)
    }

    #[test]
    fn ciphertext_differs_and_round_trips() {
        let (ciphertext, meta) = encrypt_all(b"template");
        assert_ne!(ciphertext, b"template");
        assert_eq!(ciphertext.len(), b"template".len());

        let mut dec = DecryptingReader::new(
            Box::new(Cursor::new(ciphertext)),
            &meta.key,
            &meta.iv,
            meta.hmac,
        )
        .unwrap();
        let mut plaintext = Vec::new();
        dec.read_to_end(&mut plaintext).unwrap();
        assert_eq!(plaintext, b"template");
    }

    #[test]
    fn meta_is_only_published_at_eof() {
        let meta = new_meta_cell();
        let mut enc = EncryptingReader::new(
            Box::new(Cursor::new(vec![1u8; 4096])),
            meta.clone(),
        )
        .unwrap();

        let mut buf = [0u8; 8];
        enc.read(&mut buf).unwrap();
        assert!(meta.lock().unwrap().is_none());

        std::io::copy(&mut enc, &mut std::io::sink()).unwrap();
        assert!(meta.lock().unwrap().is_some());
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let (mut ciphertext, meta) = encrypt_all(b"some layer content");
        ciphertext[0] ^= 0xff;

        let mut dec = DecryptingReader::new(
            Box::new(Cursor::new(ciphertext)),
            &meta.key,
            &meta.iv,
            meta.hmac,
        )
        .unwrap();
        let err = dec.read_to_end(&mut Vec::new()).unwrap_err();
        assert!(err.to_string().contains("authentication"));
    }

    #[test]
    fn large_streams_survive_chunking() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (ciphertext, meta) = encrypt_all(&payload);

        let mut dec = DecryptingReader::new(
            Box::new(Cursor::new(ciphertext)),
            &meta.key,
            &meta.iv,
            meta.hmac,
        )
        .unwrap();
        let mut plaintext = Vec::new();
        dec.read_to_end(&mut plaintext).unwrap();
        assert_eq!(plaintext, payload);
    }
}
