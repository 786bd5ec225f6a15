//! The in-memory image model: layers with deferred descriptors and the
//! image container the sinks drain.
//!
//! Layers here are *streaming*: their digest, size and annotations are not
//! knowable until the compressed stream has been fully consumed. Accessors
//! return [`LayerError::NotComputed`] inside that window and sinks are
//! written to tolerate it (drain first, describe after).

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use oci_client::manifest::{
    IMAGE_CONFIG_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE, OciDescriptor, OciImageManifest,
};
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::types::{ImageConfig, sha256_digest};

pub mod measured;
pub mod stream;

pub use measured::MeasuredReader;
pub use stream::StreamLayer;

/// A readable byte stream produced by a layer.
pub type LayerStream = Box<dyn Read + Send>;

#[derive(Debug, Error)]
pub enum LayerError {
    /// A deferred descriptor was queried before the layer stream was fully
    /// consumed.
    #[error("descriptor is not computed until the layer stream has been fully consumed")]
    NotComputed,

    /// The layer stream was requested while a previous stream is still
    /// being consumed.
    #[error("layer stream is already being consumed")]
    Consumed,

    #[error("{0}")]
    Unavailable(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// A single OCI image layer.
///
/// `diff_id` is the digest of the uncompressed content; `digest` and
/// `size` describe the on-wire (compressed, possibly encrypted) bytes.
/// Both are in `sha256:<hex>` form.
pub trait Layer: Send + Sync {
    fn media_type(&self) -> Result<String, LayerError>;

    fn diff_id(&self) -> Result<String, LayerError>;

    fn digest(&self) -> Result<String, LayerError>;

    fn size(&self) -> Result<i64, LayerError>;

    fn annotations(&self) -> Result<BTreeMap<String, String>, LayerError> {
        Ok(BTreeMap::new())
    }

    /// The on-wire byte stream. For streaming layers this may only be
    /// taken once; after full consumption a second call yields an empty
    /// stream.
    fn compressed(&self) -> Result<LayerStream, LayerError>;

    /// The uncompressed byte stream, where the layer can provide one.
    fn uncompressed(&self) -> Result<LayerStream, LayerError>;
}

/// An ordered set of layers plus the manifest state needed for writing.
///
/// Images pulled from a registry carry their source manifest (used for
/// annotation lookup during decryption and for pass-through writes) and
/// config blob. `append_annotations` installs a manifest override which
/// takes precedence during the second phase of an encrypted write.
#[derive(Clone)]
pub struct Image {
    layers: Vec<Arc<dyn Layer>>,
    source_manifest: Option<OciImageManifest>,
    source_config: Option<Vec<u8>>,
    manifest_override: Option<OciImageManifest>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("layers", &self.layers.len())
            .field("source_manifest", &self.source_manifest)
            .field("source_config", &self.source_config.as_ref().map(|c| c.len()))
            .field("manifest_override", &self.manifest_override)
            .finish()
    }
}

impl Image {
    pub fn empty() -> Self {
        Image {
            layers: Vec::new(),
            source_manifest: None,
            source_config: None,
            manifest_override: None,
        }
    }

    /// An image reconstructed from a pulled manifest and config.
    pub fn from_source(
        layers: Vec<Arc<dyn Layer>>,
        manifest: OciImageManifest,
        config: Vec<u8>,
    ) -> Self {
        Image {
            layers,
            source_manifest: Some(manifest),
            source_config: Some(config),
            manifest_override: None,
        }
    }

    pub fn append_layer(&mut self, layer: Arc<dyn Layer>) {
        self.layers.push(layer);
    }

    pub fn layers(&self) -> &[Arc<dyn Layer>] {
        &self.layers
    }

    pub fn source_manifest(&self) -> Option<&OciImageManifest> {
        self.source_manifest.as_ref()
    }

    /// Replace the manifest used for subsequent writes.
    pub fn with_manifest(mut self, manifest: OciImageManifest) -> Self {
        self.manifest_override = Some(manifest);
        self
    }

    /// The serialized image config blob. Synthesized from the layer diff
    /// IDs unless the image was pulled with a config of its own.
    pub fn config_bytes(&self) -> Result<Vec<u8>, LayerError> {
        if let Some(cfg) = &self.source_config {
            return Ok(cfg.clone());
        }

        let diff_ids = self
            .layers
            .iter()
            .map(|l| l.diff_id())
            .collect::<Result<Vec<_>, _>>()?;

        serde_json::to_vec(&ImageConfig::new(diff_ids))
            .map_err(|e| LayerError::Io(std::io::Error::other(e)))
    }

    /// The manifest describing this image.
    ///
    /// Built from the layers (media type, digest and size; annotations
    /// are only re-injected by `append_annotations` after a drain),
    /// unless an override or an untouched source manifest applies. Fails
    /// with [`LayerError::NotComputed`] while any layer is undrained.
    pub fn manifest(&self) -> Result<OciImageManifest, LayerError> {
        if let Some(m) = &self.manifest_override {
            return Ok(m.clone());
        }
        if let Some(m) = &self.source_manifest {
            return Ok(m.clone());
        }
        self.build_manifest(false)
    }

    /// The manifest with every layer's annotations merged into its
    /// descriptor. Only meaningful once the layers have been drained.
    pub fn manifest_with_annotations(&self) -> Result<OciImageManifest, LayerError> {
        self.build_manifest(true)
    }

    fn build_manifest(&self, with_annotations: bool) -> Result<OciImageManifest, LayerError> {
        let config_bytes = self.config_bytes()?;
        let config = OciDescriptor {
            media_type: IMAGE_CONFIG_MEDIA_TYPE.to_string(),
            digest: sha256_digest(&config_bytes),
            size: config_bytes.len() as i64,
            urls: None,
            annotations: None,
        };

        let mut layers = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let annotations = if with_annotations {
                let a = layer.annotations()?;
                if a.is_empty() { None } else { Some(a) }
            } else {
                None
            };
            layers.push(OciDescriptor {
                media_type: layer.media_type()?,
                digest: layer.digest()?,
                size: layer.size()?,
                urls: None,
                annotations,
            });
        }

        Ok(OciImageManifest {
            schema_version: 2,
            media_type: Some(OCI_IMAGE_MEDIA_TYPE.to_string()),
            config,
            layers,
            subject: None,
            artifact_type: None,
            annotations: None,
        })
    }
}
