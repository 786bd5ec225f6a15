//! Pushing images to a remote OCI registry.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use oci_client::Reference;
use oci_client::RegistryOperation;
use oci_client::client::{Client, ClientConfig};
use oci_client::manifest::OciManifest;
use oci_client::secrets::RegistryAuth;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::encryption::{append_annotations, decrypt_image, encrypt_image};
use super::{ImageWriter, WriteError};
use crate::crypto::providers::KeyProvider;
use crate::image::Image;
use crate::types::sha256_digest;

/// Pushes images to a remote registry with HTTP Basic (or anonymous)
/// authentication.
pub struct RegistryWriter {
    client: Client,
    auth: RegistryAuth,
    key_provider: Arc<dyn KeyProvider>,
}

impl RegistryWriter {
    pub fn new(
        username: Option<&str>,
        password: Option<&str>,
        insecure: bool,
        key_provider: Arc<dyn KeyProvider>,
    ) -> Self {
        RegistryWriter {
            client: Client::new(ClientConfig {
                accept_invalid_certificates: insecure,
                ..Default::default()
            }),
            auth: resolve_auth(username, password),
            key_provider,
        }
    }

    /// Push every blob of the image, then its manifest. Layers are
    /// drained into memory first so their deferred digests exist by the
    /// time the upload needs them.
    async fn push_image(&self, image: &Image, reference: &Reference) -> Result<()> {
        self.client
            .auth(reference, &self.auth, RegistryOperation::Push)
            .await
            .with_context(|| format!("unable to authenticate push to {reference}"))?;

        let progress = ProgressReporter::spawn();
        let mut completed: u64 = 0;

        for layer in image.layers() {
            let mut stream = layer.compressed()?;
            let mut bytes = Vec::new();
            stream.read_to_end(&mut bytes)?;
            drop(stream);

            let digest = layer.digest()?;
            self.client
                .push_blob(reference, &bytes, &digest)
                .await
                .with_context(|| format!("unable to push layer {digest}"))?;

            completed += bytes.len() as u64;
            progress.update(completed);
            debug!(%digest, size = bytes.len(), "layer pushed");
        }

        let config = image.config_bytes()?;
        let config_digest = sha256_digest(&config);
        self.client
            .push_blob(reference, &config, &config_digest)
            .await
            .context("unable to push image config")?;
        completed += config.len() as u64;
        progress.update(completed);

        let manifest = image.manifest()?;
        let url = self
            .client
            .push_manifest(reference, &OciManifest::Image(manifest))
            .await
            .context("unable to push manifest")?;
        info!(%url, "manifest pushed");

        Ok(())
    }
}

#[async_trait]
impl ImageWriter for RegistryWriter {
    async fn write(
        &self,
        image: Image,
        image_ref: &str,
        decrypt: bool,
        unzip: bool,
    ) -> Result<()> {
        // Registries store blobs exactly as provided; an unzip request is
        // a mistake rather than a no-op.
        if unzip {
            return Err(WriteError::InvalidCombination(
                "unzip is not supported for registry targets",
            )
            .into());
        }

        let reference: Reference = image_ref
            .parse()
            .with_context(|| format!("invalid reference: {image_ref}"))?;

        let image = if decrypt {
            info!("decrypting layers using private key");
            let key = self.key_provider.private_key().await?;
            decrypt_image(&image, &key)?
        } else {
            image
        };

        self.push_image(&image, &reference).await
    }

    async fn write_encrypted(&self, image: Image, image_ref: &str) -> Result<()> {
        let reference: Reference = image_ref
            .parse()
            .with_context(|| format!("invalid reference: {image_ref}"))?;

        info!("encrypting layers using public key");
        let key = self.key_provider.public_key().await?;
        let encrypted = encrypt_image(&image, &key)?;

        // Phase 1: blobs plus an interim manifest without encryption
        // annotations (they do not exist until the drain completes).
        self.push_image(&encrypted, &reference).await?;

        // Phase 2: the same blobs are already on the registry; only the
        // manifest binding is rewritten, now carrying the annotations.
        let annotated = append_annotations(&encrypted)?;
        let manifest = annotated.manifest()?;
        let url = self
            .client
            .push_manifest(&reference, &OciManifest::Image(manifest))
            .await
            .context("unable to push annotated manifest")?;
        info!(%url, "encrypted manifest pushed");

        Ok(())
    }
}

fn resolve_auth(username: Option<&str>, password: Option<&str>) -> RegistryAuth {
    match (username, password) {
        (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
            RegistryAuth::Basic(user.to_string(), pass.to_string())
        }
        _ => RegistryAuth::Anonymous,
    }
}

/// Background progress reporting: the sink sends cumulative completed
/// bytes into a bounded channel of one; a timer task logs the latest
/// figure every two seconds and stops when the channel closes.
struct ProgressReporter {
    tx: mpsc::Sender<u64>,
}

impl ProgressReporter {
    fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<u64>(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(2));
            let mut completed: u64 = 0;
            loop {
                tokio::select! {
                    update = rx.recv() => match update {
                        Some(bytes) => completed = bytes,
                        None => {
                            info!(completed_bytes = completed, "push complete");
                            return;
                        }
                    },
                    _ = interval.tick() => {
                        info!(completed_bytes = completed, "pushing image");
                    }
                }
            }
        });
        ProgressReporter { tx }
    }

    /// Stale updates are dropped rather than blocking the push.
    fn update(&self, completed: u64) {
        let _ = self.tx.try_send(completed);
    }
}
