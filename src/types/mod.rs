//! Shared media types, reference normalization and manifest config types.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod ollama;

/// Media type for the model weights layer.
pub const MEDIA_TYPE_MODEL: &str = "application/vnd.kapsule.image.model";
/// Media type for the prompt template layer.
pub const MEDIA_TYPE_TEMPLATE: &str = "application/vnd.kapsule.image.template";
/// Media type for the sampler parameters layer (gzipped JSON map of
/// string to list of strings).
pub const MEDIA_TYPE_PARAMETERS: &str = "application/vnd.kapsule.image.parameters";
/// Media type for a licence layer.
pub const MEDIA_TYPE_LICENCE: &str = "application/vnd.kapsule.image.licence";

/// Suffix appended to a layer media type once the layer is encrypted.
pub const ENCRYPTED_SUFFIX: &str = "+enc";

pub const OLLAMA_MEDIA_TYPE_MODEL: &str = "application/vnd.ollama.image.model";
pub const OLLAMA_MEDIA_TYPE_TEMPLATE: &str = "application/vnd.ollama.image.template";
pub const OLLAMA_MEDIA_TYPE_PARAMETERS: &str = "application/vnd.ollama.image.params";
pub const OLLAMA_MEDIA_TYPE_LICENCE: &str = "application/vnd.ollama.image.licence";

/// OCI annotation carrying the JWE-wrapped symmetric layer key.
pub const ANNOTATION_ENC_KEYS_JWE: &str = "org.opencontainers.image.enc.keys.jwe";
/// OCI annotation carrying the public layer-cipher options.
pub const ANNOTATION_ENC_PUBOPTS: &str = "org.opencontainers.image.enc.pubopts";

const DEFAULT_REGISTRY: &str = "kapsule.io";
const DEFAULT_WORKSPACE: &str = "library";
const DEFAULT_TAG: &str = "latest";

/// A fully-qualified image reference of the form
/// `{registry}/{workspace}/{image}:{tag}`.
///
/// Partial references fill in `kapsule.io`, `library` and `latest` for the
/// missing pieces. The first path segment is treated as a registry when it
/// contains a `.` or when the reference has three or more segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRef {
    registry: String,
    workspace: String,
    image: String,
    tag: String,
}

impl CanonicalRef {
    pub fn parse(image_ref: &str) -> Self {
        let mut parts: Vec<&str> = image_ref.split('/').collect();

        let registry = if parts.len() > 2 || parts[0].contains('.') {
            let r = parts.remove(0);
            r.to_string()
        } else {
            DEFAULT_REGISTRY.to_string()
        };

        let workspace = if parts.len() > 1 {
            let w = parts.remove(0);
            w.to_string()
        } else {
            DEFAULT_WORKSPACE.to_string()
        };

        let (image, tag) = match parts[0].split_once(':') {
            Some((i, t)) if !t.is_empty() => (i.to_string(), t.to_string()),
            Some((i, _)) => (i.to_string(), DEFAULT_TAG.to_string()),
            None => (parts[0].to_string(), DEFAULT_TAG.to_string()),
        };

        CanonicalRef {
            registry,
            workspace,
            image,
            tag,
        }
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl std::fmt::Display for CanonicalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.registry, self.workspace, self.image, self.tag
        )
    }
}

/// Minimal OCI image configuration written alongside a manifest.
///
/// Only the fields kapsule consumers look at are emitted; `diff_ids` holds
/// the uncompressed content hashes of every layer in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    pub architecture: String,
    pub os: String,
    pub rootfs: RootFs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<String>,
}

impl ImageConfig {
    pub fn new(diff_ids: Vec<String>) -> Self {
        ImageConfig {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids,
            },
        }
    }
}

/// Format a `sha256:<hex>` digest string for raw content.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}
