//! The encrypting layer adapter.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use openssl::pkey::{PKey, Public};

use super::cipher::{self, EncryptingReader, LAYER_CIPHER, MetaCell, PrivateOptions, PublicOptions};
use super::{CryptoError, jwe, parse_public_key};
use crate::image::{Layer, LayerError, LayerStream, MeasuredReader};
use crate::types::{ANNOTATION_ENC_KEYS_JWE, ANNOTATION_ENC_PUBOPTS, ENCRYPTED_SUFFIX};

#[derive(Default, Debug)]
struct AdapterState {
    digest: Option<String>,
    size: Option<i64>,
    annotations: Option<BTreeMap<String, String>>,
    started: bool,
    done: bool,
}

/// Wraps a layer so that its compressed stream is encrypted in flight.
///
/// The ciphertext digest, size and the OCI encryption annotations are
/// deferred until the stream has been fully consumed; the diff ID of the
/// inner layer is preserved so the content can be verified after a later
/// decryption. Once consumed, a second `compressed()` call yields an
/// empty stream (the sink may revisit layers while rewriting the
/// manifest) and nothing is re-encrypted.
pub struct EncryptedLayer {
    inner: Arc<dyn Layer>,
    public_key: PKey<Public>,
    meta: MetaCell,
    state: Arc<Mutex<AdapterState>>,
}

impl std::fmt::Debug for EncryptedLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedLayer")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl EncryptedLayer {
    /// Fails with [`CryptoError::NotPublicKey`] when the supplied bytes do
    /// not parse as a PEM public key.
    pub fn new(inner: Arc<dyn Layer>, public_key_pem: &[u8]) -> Result<Self, CryptoError> {
        let public_key = parse_public_key(public_key_pem)?;
        Ok(EncryptedLayer {
            inner,
            public_key,
            meta: cipher::new_meta_cell(),
            state: Arc::new(Mutex::new(AdapterState::default())),
        })
    }

    fn build_annotations(&self) -> Result<BTreeMap<String, String>, LayerError> {
        let meta = self
            .meta
            .lock()
            .unwrap()
            .clone()
            .ok_or(LayerError::NotComputed)?;

        let private_opts = PrivateOptions {
            symkey: BASE64.encode(&meta.key),
            iv: BASE64.encode(&meta.iv),
            digest: self.inner.digest()?,
        };
        let wrapped = jwe::wrap(
            &self.public_key,
            &serde_json::to_vec(&private_opts).map_err(CryptoError::from)?,
        )?;

        let public_opts = PublicOptions {
            cipher: LAYER_CIPHER.to_string(),
            hmac: BASE64.encode(&meta.hmac),
        };
        let pubopts =
            BASE64.encode(serde_json::to_vec(&public_opts).map_err(CryptoError::from)?);

        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_ENC_KEYS_JWE.to_string(), wrapped);
        annotations.insert(ANNOTATION_ENC_PUBOPTS.to_string(), pubopts);
        Ok(annotations)
    }
}

impl Layer for EncryptedLayer {
    fn media_type(&self) -> Result<String, LayerError> {
        Ok(format!("{}{}", self.inner.media_type()?, ENCRYPTED_SUFFIX))
    }

    fn diff_id(&self) -> Result<String, LayerError> {
        self.inner.diff_id()
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

    fn annotations(&self) -> Result<BTreeMap<String, String>, LayerError> {
        {
            let state = self.state.lock().unwrap();
            if !state.done {
                return Err(LayerError::NotComputed);
            }
            if let Some(annotations) = &state.annotations {
                return Ok(annotations.clone());
            }
        }

        let annotations = self.build_annotations()?;
        self.state.lock().unwrap().annotations = Some(annotations.clone());
        Ok(annotations)
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

        let inner_stream = self.inner.compressed()?;
        let encrypting = EncryptingReader::new(inner_stream, self.meta.clone())?;

        let state = self.state.clone();
        let measured = MeasuredReader::new(
            Box::new(encrypting),
            Box::new(move |digest, count| {
                let mut st = state.lock().unwrap();
                st.digest = Some(format!("sha256:{digest}"));
                st.size = Some(count as i64);
                st.done = true;
            }),
        );

        Ok(Box::new(measured))
    }

    fn uncompressed(&self) -> Result<LayerStream, LayerError> {
        Err(LayerError::Unavailable(
            "uncompressed content is not available for encrypted layers",
        ))
    }
}
