//! Pulling images back out of a registry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};
use flate2::read::GzDecoder;
use oci_client::client::{Client, ClientConfig};
use oci_client::manifest::{OciDescriptor, OciManifest};
use oci_client::secrets::RegistryAuth;
use oci_client::Reference;
use sha2::{Digest, Sha256};
use std::io::Read;
use tracing::{debug, info};

use crate::image::{Image, Layer, LayerError, LayerStream};
use crate::types::ENCRYPTED_SUFFIX;

/// A layer whose bytes were fetched from a registry.
///
/// Unlike streaming layers, the descriptor is known up front and the
/// compressed stream can be replayed. The diff ID is recovered lazily by
/// inflating the held bytes (unavailable while the layer is encrypted).
pub struct RemoteLayer {
    descriptor: OciDescriptor,
    bytes: Arc<Vec<u8>>,
    diff_id: Mutex<Option<String>>,
}

impl RemoteLayer {
    pub fn new(descriptor: OciDescriptor, bytes: Vec<u8>) -> Self {
        RemoteLayer {
            descriptor,
            bytes: Arc::new(bytes),
            diff_id: Mutex::new(None),
        }
    }
}

impl Layer for RemoteLayer {
    fn media_type(&self) -> Result<String, LayerError> {
        Ok(self.descriptor.media_type.clone())
    }

    fn diff_id(&self) -> Result<String, LayerError> {
        if self.descriptor.media_type.ends_with(ENCRYPTED_SUFFIX) {
            return Err(LayerError::Unavailable(
                "diff id of an encrypted layer is only known after decryption",
            ));
        }

        let mut cached = self.diff_id.lock().unwrap();
        if let Some(diff_id) = cached.as_ref() {
            return Ok(diff_id.clone());
        }

        let mut decoder = GzDecoder::new(&self.bytes[..]);
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = decoder.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let diff_id = format!("sha256:{}", hex::encode(hasher.finalize()));
        *cached = Some(diff_id.clone());
        Ok(diff_id)
    }

    fn digest(&self) -> Result<String, LayerError> {
        Ok(self.descriptor.digest.clone())
    }

    fn size(&self) -> Result<i64, LayerError> {
        Ok(self.descriptor.size)
    }

    fn annotations(&self) -> Result<BTreeMap<String, String>, LayerError> {
        Ok(self.descriptor.annotations.clone().unwrap_or_default())
    }

    fn compressed(&self) -> Result<LayerStream, LayerError> {
        let bytes = self.bytes.clone();
        Ok(Box::new(SharedBytesReader { bytes, pos: 0 }))
    }

    fn uncompressed(&self) -> Result<LayerStream, LayerError> {
        let stream = self.compressed()?;
        Ok(Box::new(GzDecoder::new(stream)))
    }
}

struct SharedBytesReader {
    bytes: Arc<Vec<u8>>,
    pos: usize,
}

impl Read for SharedBytesReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = &self.bytes[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// Pulls images from a remote OCI registry.
pub struct RegistryReader {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryReader {
    pub fn new(username: Option<&str>, password: Option<&str>, insecure: bool) -> Self {
        let auth = match (username, password) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                RegistryAuth::Basic(user.to_string(), pass.to_string())
            }
            _ => RegistryAuth::Anonymous,
        };

        RegistryReader {
            client: Client::new(ClientConfig {
                accept_invalid_certificates: insecure,
                ..Default::default()
            }),
            auth,
        }
    }

    /// Pull the manifest, config and every layer blob for `image_ref`.
    pub async fn pull(&self, image_ref: &str) -> anyhow::Result<Image> {
        let reference: Reference = image_ref
            .parse()
            .with_context(|| format!("invalid reference: {image_ref}"))?;

        info!(reference = %reference, "pulling image");
        let (manifest, manifest_digest) = self
            .client
            .pull_manifest(&reference, &self.auth)
            .await
            .with_context(|| format!("failed to pull manifest for {image_ref}"))?;
        let OciManifest::Image(manifest) = manifest else {
            bail!("{image_ref} resolves to a manifest list, expected an image manifest");
        };
        debug!(digest = %manifest_digest, layers = manifest.layers.len(), "pulled manifest");

        let mut config = Vec::new();
        self.client
            .pull_blob(&reference, &manifest.config, &mut config)
            .await
            .context("failed to pull image config")?;

        let mut layers: Vec<Arc<dyn Layer>> = Vec::with_capacity(manifest.layers.len());
        for descriptor in &manifest.layers {
            let mut bytes = Vec::new();
            self.client
                .pull_blob(&reference, descriptor, &mut bytes)
                .await
                .with_context(|| format!("failed to pull layer {}", descriptor.digest))?;

            verify_blob(descriptor, &bytes)?;
            info!(
                digest = %descriptor.digest,
                size = bytes.len(),
                media_type = %descriptor.media_type,
                "pulled layer"
            );
            layers.push(Arc::new(RemoteLayer::new(descriptor.clone(), bytes)));
        }

        Ok(Image::from_source(layers, manifest, config))
    }
}

fn verify_blob(descriptor: &OciDescriptor, bytes: &[u8]) -> anyhow::Result<()> {
    if descriptor.size >= 0 && bytes.len() as i64 != descriptor.size {
        bail!(
            "layer size mismatch for {}: expected {}, got {}",
            descriptor.digest,
            descriptor.size,
            bytes.len()
        );
    }
    let computed = format!("sha256:{}", hex::encode(Sha256::digest(bytes)));
    if computed != descriptor.digest {
        bail!(
            "layer digest mismatch: expected {}, got {computed}",
            descriptor.digest
        );
    }
    Ok(())
}
