//! Writing images into an Ollama-compatible store.
//!
//! Ollama keeps a Docker schema-2 manifest under
//! `manifests/<registry>/<workspace>/<image>/<tag>` and content-addressed
//! blobs under `blobs/sha256-<hex>`. Blobs are stored uncompressed, and
//! the sampler parameters layer is rewritten from kapsule's
//! string-list map into Ollama's typed JSON object before its digest is
//! committed.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::Compression;
use flate2::read::GzDecoder;
use oci_client::manifest::{
    IMAGE_DOCKER_CONFIG_MEDIA_TYPE, IMAGE_MANIFEST_MEDIA_TYPE, OciDescriptor, OciImageManifest,
};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::encryption::decrypt_image;
use super::{ImageWriter, WriteError};
use crate::crypto::providers::KeyProvider;
use crate::image::{Image, Layer, StreamLayer};
use crate::types::ollama::{OllamaConfig, convert_parameters};
use crate::types::{
    CanonicalRef, MEDIA_TYPE_LICENCE, MEDIA_TYPE_MODEL, MEDIA_TYPE_PARAMETERS,
    MEDIA_TYPE_TEMPLATE, OLLAMA_MEDIA_TYPE_LICENCE, OLLAMA_MEDIA_TYPE_MODEL,
    OLLAMA_MEDIA_TYPE_PARAMETERS, OLLAMA_MEDIA_TYPE_TEMPLATE,
};

/// Writes images under an Ollama store root.
pub struct OllamaWriter {
    root: PathBuf,
    key_provider: Arc<dyn KeyProvider>,
}

impl OllamaWriter {
    pub fn new(root: impl Into<PathBuf>, key_provider: Arc<dyn KeyProvider>) -> Self {
        OllamaWriter {
            root: root.into(),
            key_provider,
        }
    }
}

#[async_trait]
impl ImageWriter for OllamaWriter {
    async fn write(
        &self,
        image: Image,
        image_ref: &str,
        decrypt: bool,
        _unzip: bool,
    ) -> Result<()> {
        // Blobs in this layout are always stored uncompressed, so the
        // unzip flag is meaningless here and ignored.
        let reference = CanonicalRef::parse(image_ref);
        let manifest_dir = self
            .root
            .join("manifests")
            .join(reference.registry())
            .join(reference.workspace())
            .join(reference.image());
        let blobs_dir = self.root.join("blobs");

        std::fs::create_dir_all(&manifest_dir)
            .with_context(|| format!("unable to create {}", manifest_dir.display()))?;
        std::fs::create_dir_all(&blobs_dir)
            .with_context(|| format!("unable to create {}", blobs_dir.display()))?;

        let image = if decrypt {
            info!("decrypting layers using private key");
            let key = self.key_provider.private_key().await?;
            decrypt_image(&image, &key)?
        } else {
            image
        };

        let mut descriptors = Vec::with_capacity(image.layers().len());
        let mut diff_ids = Vec::with_capacity(image.layers().len());
        for layer in image.layers() {
            // The parameters layer changes format on the way in; it is
            // substituted before any digest is committed.
            let layer: Arc<dyn Layer> = if layer.media_type()? == MEDIA_TYPE_PARAMETERS {
                info!("converting parameters layer to ollama format");
                let converted = convert_parameters(layer.compressed()?)
                    .context("unable to convert parameters layer")?;
                Arc::new(StreamLayer::from_bytes(
                    converted,
                    OLLAMA_MEDIA_TYPE_PARAMETERS,
                    Compression::default(),
                ))
            } else {
                layer.clone()
            };

            let descriptor = write_layer_blob(&blobs_dir, &layer)?;
            info!(
                digest = %descriptor.digest,
                size = descriptor.size,
                media_type = %descriptor.media_type,
                "layer blob written"
            );
            diff_ids.push(layer.diff_id()?);
            descriptors.push(descriptor);
        }

        let config = OllamaConfig::new(diff_ids);
        let config_bytes = config.to_bytes()?;
        let config_digest = config.digest()?;
        std::fs::write(blobs_dir.join(blob_file_name(&config_digest)), &config_bytes)?;
        debug!(digest = %config_digest, "config blob written");

        let manifest = OciImageManifest {
            schema_version: 2,
            media_type: Some(IMAGE_MANIFEST_MEDIA_TYPE.to_string()),
            config: OciDescriptor {
                media_type: IMAGE_DOCKER_CONFIG_MEDIA_TYPE.to_string(),
                digest: config_digest,
                size: config_bytes.len() as i64,
                urls: None,
                annotations: None,
            },
            layers: descriptors,
            subject: None,
            artifact_type: None,
            annotations: None,
        };

        let manifest_path = manifest_dir.join(reference.tag());
        let file = File::create(&manifest_path)
            .with_context(|| format!("unable to create {}", manifest_path.display()))?;
        serde_json::to_writer(file, &manifest).context("unable to encode manifest")?;
        info!(reference = %reference, path = %manifest_path.display(), "image written");

        Ok(())
    }

    async fn write_encrypted(&self, _image: Image, _image_ref: &str) -> Result<()> {
        // Ollama consumers read plaintext blobs; there is no encrypted
        // variant of this layout.
        Err(WriteError::InvalidCombination(
            "encryption is not supported for the ollama layout",
        )
        .into())
    }
}

/// Gunzip a layer's stream into the blob store, hashing as it is
/// written; the blob takes the digest of its uncompressed content.
fn write_layer_blob(blobs_dir: &Path, layer: &Arc<dyn Layer>) -> Result<OciDescriptor> {
    let stream = layer.compressed()?;
    let mut decoder = GzDecoder::new(stream);

    let mut temp = NamedTempFile::new_in(blobs_dir)?;
    let mut hasher = Sha256::new();
    let mut size: u64 = 0;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = decoder.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        temp.write_all(&buf[..n])?;
        size += n as u64;
    }

    let digest = format!("sha256:{}", hex::encode(hasher.finalize()));
    temp.persist(blobs_dir.join(blob_file_name(&digest)))
        .map_err(|e| anyhow::anyhow!("unable to rename blob {digest}: {e}"))?;

    Ok(OciDescriptor {
        media_type: translate_media_type(&layer.media_type()?),
        digest,
        size: size as i64,
        urls: None,
        annotations: None,
    })
}

fn blob_file_name(digest: &str) -> String {
    digest.replacen(':', "-", 1)
}

fn translate_media_type(media_type: &str) -> String {
    match media_type {
        MEDIA_TYPE_MODEL => OLLAMA_MEDIA_TYPE_MODEL.to_string(),
        MEDIA_TYPE_TEMPLATE => OLLAMA_MEDIA_TYPE_TEMPLATE.to_string(),
        MEDIA_TYPE_PARAMETERS => OLLAMA_MEDIA_TYPE_PARAMETERS.to_string(),
        MEDIA_TYPE_LICENCE => OLLAMA_MEDIA_TYPE_LICENCE.to_string(),
        other => other.to_string(),
    }
}
