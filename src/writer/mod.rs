//! Image sinks: OCI layout directories, remote registries and
//! Ollama-compatible stores.

use async_trait::async_trait;
use thiserror::Error;

use crate::image::Image;

pub mod encryption;
pub mod ollama;
pub mod path;
pub mod registry;

pub use ollama::OllamaWriter;
pub use path::PathWriter;
pub use registry::RegistryWriter;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("invalid option combination: {0}")]
    InvalidCombination(&'static str),

    #[error("manifest error: {0}")]
    Manifest(String),
}

/// A sink an assembled or pulled image can be drained into.
#[async_trait]
pub trait ImageWriter: Send + Sync {
    /// Write the image under the given reference. `decrypt` runs the
    /// decryption pass with the key provider's private key first; `unzip`
    /// replaces written blobs with their gunzipped content where the sink
    /// supports it.
    async fn write(
        &self,
        image: Image,
        image_ref: &str,
        decrypt: bool,
        unzip: bool,
    ) -> anyhow::Result<()>;

    /// Encrypt every layer with the key provider's public key, write the
    /// image, then re-commit the manifest carrying the per-layer
    /// encryption annotations that only exist after the first drain.
    async fn write_encrypted(&self, image: Image, image_ref: &str) -> anyhow::Result<()>;
}
