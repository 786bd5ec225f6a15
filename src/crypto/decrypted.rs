//! The decrypting layer adapter.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::warn;

use super::cipher::{DecryptingReader, PrivateOptions, PublicOptions};
use super::{CryptoError, jwe, parse_private_key};
use crate::image::measured::DiffIdReader;
use crate::image::{Layer, LayerError, LayerStream, MeasuredReader};
use crate::types::{ANNOTATION_ENC_KEYS_JWE, ANNOTATION_ENC_PUBOPTS, ENCRYPTED_SUFFIX};

#[derive(Default, Debug)]
struct AdapterState {
    diff_id: Option<String>,
    digest: Option<String>,
    size: Option<i64>,
    started: bool,
    done: bool,
}

/// Wraps an encrypted layer so that its compressed stream is decrypted in
/// flight.
///
/// Key material is recovered from the layer's encryption annotations at
/// construction time: the JWE is unwrapped with the private key and the
/// public options supply the expected ciphertext HMAC. The media type
/// loses its `+enc` suffix; digest and size describe the decrypted
/// (still gzip-compressed) bytes and the diff ID is recomputed from the
/// inflated plaintext while the stream drains.
pub struct DecryptedLayer {
    inner: Arc<dyn Layer>,
    key: Vec<u8>,
    iv: Vec<u8>,
    expected_hmac: Vec<u8>,
    plaintext_digest: String,
    state: Arc<Mutex<AdapterState>>,
}

impl std::fmt::Debug for DecryptedLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptedLayer")
            .field("plaintext_digest", &self.plaintext_digest)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl DecryptedLayer {
    /// Fails with [`CryptoError::NotPrivateKey`] when the supplied bytes
    /// do not parse as a PEM private key, and with
    /// [`CryptoError::MalformedEnvelope`] when the annotations are missing
    /// or undecodable.
    pub fn new(
        inner: Arc<dyn Layer>,
        private_key_pem: &[u8],
        annotations: &BTreeMap<String, String>,
    ) -> Result<Self, CryptoError> {
        let private_key = parse_private_key(private_key_pem)?;

        let token = annotations.get(ANNOTATION_ENC_KEYS_JWE).ok_or_else(|| {
            CryptoError::MalformedEnvelope("missing key-wrap annotation".to_string())
        })?;
        let private_opts: PrivateOptions = serde_json::from_slice(&jwe::unwrap(&private_key, token)?)?;

        let pubopts = annotations.get(ANNOTATION_ENC_PUBOPTS).ok_or_else(|| {
            CryptoError::MalformedEnvelope("missing public options annotation".to_string())
        })?;
        let pubopts = BASE64
            .decode(pubopts)
            .map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))?;
        let public_opts: PublicOptions = serde_json::from_slice(&pubopts)?;

        let decode = |value: &str| {
            BASE64
                .decode(value)
                .map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))
        };

        Ok(DecryptedLayer {
            inner,
            key: decode(&private_opts.symkey)?,
            iv: decode(&private_opts.iv)?,
            expected_hmac: decode(&public_opts.hmac)?,
            plaintext_digest: private_opts.digest,
            state: Arc::new(Mutex::new(AdapterState::default())),
        })
    }
}

impl Layer for DecryptedLayer {
    fn media_type(&self) -> Result<String, LayerError> {
        let media_type = self.inner.media_type()?;
        Ok(media_type
            .strip_suffix(ENCRYPTED_SUFFIX)
            .unwrap_or(&media_type)
            .to_string())
    }

    fn diff_id(&self) -> Result<String, LayerError> {
        self.state
            .lock()
            .unwrap()
            .diff_id
            .clone()
            .ok_or(LayerError::NotComputed)
    }

    fn digest(&self) -> Result<String, LayerError> {
        self.state
            .lock()
            .unwrap()
            .digest
            .clone()
            .ok_or(LayerError::NotComputed)
    }

    fn size(&self) -> Result<i64, LayerError> {
        self.state.lock().unwrap().size.ok_or(LayerError::NotComputed)
    }

    fn compressed(&self) -> Result<LayerStream, LayerError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.done {
                return Ok(Box::new(std::io::empty()));
            }
            if state.started {
                return Err(LayerError::Consumed);
            }
            state.started = true;
        }

        let ciphertext = self.inner.compressed()?;
        let decrypting = DecryptingReader::new(
            ciphertext,
            &self.key,
            &self.iv,
            self.expected_hmac.clone(),
        )?;

        let state = self.state.clone();
        let sniffing = DiffIdReader::new(
            Box::new(decrypting),
            Box::new(move |digest| {
                state.lock().unwrap().diff_id = Some(format!("sha256:{digest}"));
            }),
        );

        let state = self.state.clone();
        let expected = self.plaintext_digest.clone();
        let measured = MeasuredReader::new(
            Box::new(sniffing),
            Box::new(move |digest, count| {
                let digest = format!("sha256:{digest}");
                if digest != expected {
                    warn!(
                        expected = %expected,
                        found = %digest,
                        "decrypted layer digest does not match the recorded plaintext digest"
                    );
                }
                let mut st = state.lock().unwrap();
                st.digest = Some(digest);
                st.size = Some(count as i64);
                st.done = true;
            }),
        );

        Ok(Box::new(measured))
    }

    fn uncompressed(&self) -> Result<LayerStream, LayerError> {
        Err(LayerError::Unavailable(
            "uncompressed stream is not available for decrypting layers",
        ))
    }
}
