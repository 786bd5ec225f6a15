//! Assembles a streaming image from a layer plan.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use flate2::Compression;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::image::{Image, StreamLayer};
use crate::modelfile::{self, LayerPlan, LayerSpec, ParseError};
use crate::types::{MEDIA_TYPE_MODEL, MEDIA_TYPE_PARAMETERS, MEDIA_TYPE_TEMPLATE};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("unable to find file {path:?} defined in FROM: {source}")]
    FromResolve {
        path: String,
        source: std::io::Error,
    },

    #[error("unable to load modelfile: {0}")]
    Parse(#[from] ParseError),

    #[error("unable to serialize parameters: {0}")]
    Parameters(#[from] serde_json::Error),
}

/// Parse the given Modelfile and assemble its image relative to `context`.
pub fn build(modelfile: impl AsRef<Path>, context: impl AsRef<Path>) -> Result<Image, BuildError> {
    let plan = modelfile::parse_file(modelfile)?;
    assemble(&plan, context.as_ref())
}

/// Assemble an image from a layer plan, resolving FROM paths under the
/// build context. Layers are appended in declaration order; nothing is
/// read or compressed until a sink drains the image.
pub fn assemble(plan: &LayerPlan, context: &Path) -> Result<Image, BuildError> {
    let mut image = Image::empty();

    for spec in plan.specs() {
        match spec {
            LayerSpec::From { path } => {
                let resolved = context.join(path);
                debug!(path = %resolved.display(), "adding model layer");
                let file = File::open(&resolved).map_err(|source| BuildError::FromResolve {
                    path: path.clone(),
                    source,
                })?;
                image.append_layer(Arc::new(StreamLayer::new(
                    Box::new(file),
                    MEDIA_TYPE_MODEL,
                    Compression::default(),
                )));
            }
            LayerSpec::Template { text } => {
                debug!("adding template layer");
                image.append_layer(Arc::new(StreamLayer::from_bytes(
                    text.as_bytes().to_vec(),
                    MEDIA_TYPE_TEMPLATE,
                    Compression::default(),
                )));
            }
            LayerSpec::Parameters { params } => {
                debug!(keys = params.len(), "adding parameters layer");
                let mut object = Map::new();
                for (key, values) in params {
                    object.insert(key.clone(), Value::from(values.clone()));
                }
                let bytes = serde_json::to_vec(&Value::Object(object))?;
                image.append_layer(Arc::new(StreamLayer::from_bytes(
                    bytes,
                    MEDIA_TYPE_PARAMETERS,
                    Compression::fast(),
                )));
            }
        }
    }

    Ok(image)
}
