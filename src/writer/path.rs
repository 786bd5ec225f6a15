//! Writing images into an OCI image-layout directory.
//!
//! The layout is the standard `oci-layout` marker, `index.json` and
//! content-addressed `blobs/sha256/` tree. Blobs are written through a
//! temp file and renamed once the digest is known, which is how the
//! deferred-descriptor contract of streaming layers is satisfied.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use oci_client::manifest::{ImageIndexEntry, OciImageIndex, OciImageManifest};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::encryption::{append_annotations, decrypt_image, encrypt_image};
use super::{ImageWriter, WriteError};
use crate::crypto::providers::KeyProvider;
use crate::image::Image;

const BLOB_DIR: &str = "blobs/sha256";
const LAYOUT_MARKER: &str = "oci-layout";
const LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_FILE: &str = "index.json";
const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Writes images into an OCI image-layout directory rooted at `root`.
pub struct PathWriter {
    root: PathBuf,
    key_provider: Arc<dyn KeyProvider>,
}

impl PathWriter {
    pub fn new(root: impl Into<PathBuf>, key_provider: Arc<dyn KeyProvider>) -> Self {
        PathWriter {
            root: root.into(),
            key_provider,
        }
    }

    /// `unzip` cannot be combined with encryption: blobs are addressed by
    /// ciphertext digest and an unzipped blob could never be decrypted.
    /// Callers check this before dispatching to `write_encrypted`.
    pub fn reject_unzip_with_encryption(unzip: bool) -> Result<(), WriteError> {
        if unzip {
            return Err(WriteError::InvalidCombination(
                "unzip is not supported when encrypting the image",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ImageWriter for PathWriter {
    async fn write(
        &self,
        image: Image,
        image_ref: &str,
        decrypt: bool,
        unzip: bool,
    ) -> Result<()> {
        let layout = Layout::ensure(&self.root)?;

        let image = if decrypt {
            info!("decrypting layers using private key");
            let key = self.key_provider.private_key().await?;
            decrypt_image(&image, &key)?
        } else {
            image
        };

        let (digest, _) = append_image(&layout, &image, image_ref)?;
        info!(manifest = %digest, path = %self.root.display(), "image written");

        if unzip {
            info!("unzipping layer blobs");
            unzip_layers(&layout, &image)?;
        }

        Ok(())
    }

    async fn write_encrypted(&self, image: Image, image_ref: &str) -> Result<()> {
        let layout = Layout::ensure(&self.root)?;

        info!("encrypting layers using public key");
        let key = self.key_provider.public_key().await?;
        let encrypted = encrypt_image(&image, &key)?;

        // Phase 1: drain the layers; digests and annotations materialize.
        let (interim_digest, _) = append_image(&layout, &encrypted, image_ref)?;
        debug!(manifest = %interim_digest, "interim manifest written");

        // Phase 2: re-commit the manifest carrying the encryption
        // annotations, replacing the interim index entry.
        let annotated = append_annotations(&encrypted)?;
        let manifest = annotated.manifest()?;
        let bytes = serde_json::to_vec(&manifest)?;
        let (digest, size) = layout.write_blob_bytes(&bytes)?;
        layout.update_index(
            manifest_entry(&digest, size, Some(image_ref)),
            Some(&interim_digest),
            Some(image_ref),
        )?;
        if digest != interim_digest {
            layout.remove_blob(&interim_digest)?;
        }
        info!(manifest = %digest, "encrypted image written");

        Ok(())
    }
}

/// An opened OCI layout directory.
struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Open the layout at `root`, scaffolding the marker, blob tree and
    /// an empty index when missing.
    fn ensure(root: &Path) -> Result<Layout> {
        std::fs::create_dir_all(root.join(BLOB_DIR))
            .with_context(|| format!("unable to create {}", root.join(BLOB_DIR).display()))?;

        let marker = root.join(LAYOUT_MARKER);
        if !marker.exists() {
            std::fs::write(&marker, LAYOUT_CONTENT)?;
        }

        let index = root.join(INDEX_FILE);
        if !index.exists() {
            let empty = OciImageIndex {
                schema_version: 2,
                media_type: Some(INDEX_MEDIA_TYPE.to_string()),
                manifests: Vec::new(),
                artifact_type: None,
                annotations: None,
            };
            std::fs::write(&index, serde_json::to_vec(&empty)?)?;
        }

        Ok(Layout {
            root: root.to_path_buf(),
        })
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = digest
            .strip_prefix("sha256:")
            .filter(|h| h.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| WriteError::Manifest(format!("unsupported digest {digest}")))?;
        Ok(self.root.join(BLOB_DIR).join(hex))
    }

    fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).map(|p| p.exists()).unwrap_or(false)
    }

    fn open_blob(&self, digest: &str) -> Result<File> {
        let path = self.blob_path(digest)?;
        File::open(&path).with_context(|| format!("unable to open blob {digest}"))
    }

    fn remove_blob(&self, digest: &str) -> Result<()> {
        let path = self.blob_path(digest)?;
        std::fs::remove_file(&path).with_context(|| format!("unable to remove blob {digest}"))
    }

    /// Stream a reader into the blob store, returning `(digest, size)`.
    /// Content-addressed: an already-present blob is left untouched.
    fn write_blob_stream(&self, reader: &mut dyn Read) -> Result<(String, i64)> {
        let mut temp = NamedTempFile::new_in(self.root.join(BLOB_DIR))?;
        let mut hasher = Sha256::new();
        let mut count: u64 = 0;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            temp.write_all(&buf[..n])?;
            count += n as u64;
        }

        let digest = format!("sha256:{}", hex::encode(hasher.finalize()));
        let path = self.blob_path(&digest)?;
        if !path.exists() {
            temp.persist(&path)
                .map_err(|e| anyhow::anyhow!("unable to persist blob {digest}: {e}"))?;
        }
        Ok((digest, count as i64))
    }

    fn write_blob_bytes(&self, bytes: &[u8]) -> Result<(String, i64)> {
        self.write_blob_stream(&mut std::io::Cursor::new(bytes))
    }

    fn read_index(&self) -> Result<OciImageIndex> {
        let file = File::open(self.root.join(INDEX_FILE)).context("unable to open index.json")?;
        serde_json::from_reader(BufReader::new(file)).context("unable to parse index.json")
    }

    /// Add a manifest entry to the index, dropping any entry with the
    /// replaced digest and any previous entry tagged with the same ref.
    fn update_index(
        &self,
        entry: ImageIndexEntry,
        replace_digest: Option<&str>,
        replace_ref: Option<&str>,
    ) -> Result<()> {
        let mut index = self.read_index()?;
        if let Some(previous) = replace_digest {
            index.manifests.retain(|m| m.digest != previous);
        }
        if let Some(tag) = replace_ref {
            index.manifests.retain(|m| {
                m.annotations
                    .as_ref()
                    .and_then(|a| a.get(REF_NAME_ANNOTATION))
                    .map(String::as_str)
                    != Some(tag)
            });
        }
        index.manifests.push(entry);
        std::fs::write(self.root.join(INDEX_FILE), serde_json::to_vec(&index)?)?;
        Ok(())
    }
}

fn manifest_entry(digest: &str, size: i64, image_ref: Option<&str>) -> ImageIndexEntry {
    ImageIndexEntry {
        media_type: MANIFEST_MEDIA_TYPE.to_string(),
        digest: digest.to_string(),
        size,
        platform: None,
        annotations: image_ref.map(|r| {
            let mut annotations = BTreeMap::new();
            annotations.insert(REF_NAME_ANNOTATION.to_string(), r.to_string());
            annotations
        }),
    }
}

/// Drain every layer into the blob store, then commit config, manifest
/// and index entry. Returns the manifest digest and size.
fn append_image(layout: &Layout, image: &Image, image_ref: &str) -> Result<(String, i64)> {
    for layer in image.layers() {
        // Layers drained by an earlier phase are already stored.
        if let Ok(digest) = layer.digest() {
            if layout.has_blob(&digest) {
                debug!(%digest, "blob already present, skipping");
                continue;
            }
        }
        let mut stream = layer.compressed()?;
        let (digest, size) = layout.write_blob_stream(&mut stream)?;
        debug!(%digest, size, "layer blob written");
    }

    let config = image.config_bytes()?;
    let (config_digest, _) = layout.write_blob_bytes(&config)?;
    debug!(digest = %config_digest, "config blob written");

    let manifest: OciImageManifest = image.manifest()?;
    let bytes = serde_json::to_vec(&manifest)?;
    let (digest, size) = layout.write_blob_bytes(&bytes)?;
    layout.update_index(
        manifest_entry(&digest, size, Some(image_ref)),
        None,
        Some(image_ref),
    )?;

    Ok((digest, size))
}

/// Replace each written layer blob with its gunzipped content, keeping
/// the blob under the digest it was addressed by when written.
fn unzip_layers(layout: &Layout, image: &Image) -> Result<()> {
    for layer in image.layers() {
        let digest = layer.digest()?;
        let blob = layout.open_blob(&digest)?;

        let mut temp = NamedTempFile::new_in(layout.root.join(BLOB_DIR))?;
        let mut decoder = GzDecoder::new(BufReader::new(blob));
        std::io::copy(&mut decoder, &mut temp)
            .with_context(|| format!("unable to unzip blob {digest}"))?;

        layout.remove_blob(&digest)?;
        temp.persist(layout.blob_path(&digest)?)
            .map_err(|e| anyhow::anyhow!("unable to replace blob {digest}: {e}"))?;
        debug!(%digest, "blob unzipped");
    }
    Ok(())
}
