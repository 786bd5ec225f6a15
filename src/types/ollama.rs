//! Ollama manifest config and parameter translation.
//!
//! Ollama stores sampler parameters as a JSON object with typed values,
//! while kapsule stores them as a map of string to list of strings. The
//! dictionary below drives the conversion.

use std::io::Read;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::sha256_digest;

/// Docker manifest config for an Ollama image.
///
/// The model metadata fields are fixed; only `rootfs.diff_ids` varies per
/// image. Field spelling follows the format Ollama ships.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    pub model_format: String,
    #[serde(rename = "model_familly")]
    pub model_family: String,
    #[serde(rename = "model_famillies")]
    pub model_families: Vec<String>,
    pub model_type: String,
    pub file_type: String,
    pub architecture: String,
    pub os: String,
    pub rootfs: OllamaRootFs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaRootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<String>,
}

impl OllamaConfig {
    pub fn new(diff_ids: Vec<String>) -> Self {
        OllamaConfig {
            model_format: "gguf".to_string(),
            model_family: "llama".to_string(),
            model_families: vec!["llama".to_string()],
            model_type: "7B".to_string(),
            file_type: "Q4_0".to_string(),
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            rootfs: OllamaRootFs {
                fs_type: "layers".to_string(),
                diff_ids,
            },
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Digest over the serialized config, as referenced from the manifest.
    pub fn digest(&self) -> serde_json::Result<String> {
        Ok(sha256_digest(&self.to_bytes()?))
    }
}

/// Target JSON type for a known parameter key.
enum ParamType {
    Int,
    Float,
    StringList,
}

/// Known Ollama parameter keys and their JSON types. Keys outside this
/// table are dropped on translation.
fn parameter_type(key: &str) -> Option<ParamType> {
    match key {
        "mirostat" | "num_ctx" | "repeat_last_n" | "seed" | "num_predict" | "top_k" => {
            Some(ParamType::Int)
        }
        "mirostat_eta" | "mirostat_tau" | "repeat_penalty" | "temperature" | "tfs_z" | "top_p" => {
            Some(ParamType::Float)
        }
        "stop" => Some(ParamType::StringList),
        _ => None,
    }
}

/// Convert a gzipped kapsule parameters payload (JSON map of string to
/// list of strings) into the typed JSON object Ollama expects.
///
/// Unknown keys are dropped; values that fail to parse as their target
/// type skip the key. `int` and `float` take the first value of the list.
pub fn convert_parameters<R: Read>(compressed: R) -> anyhow::Result<Vec<u8>> {
    let gz = GzDecoder::new(compressed);
    let params: Map<String, Value> = serde_json::from_reader(gz)?;

    let mut out = Map::new();
    for (key, value) in params {
        let values: Vec<String> = serde_json::from_value(value)?;
        match parameter_type(&key) {
            Some(ParamType::Int) => {
                if let Some(v) = values.first().and_then(|s| s.parse::<i64>().ok()) {
                    out.insert(key, Value::from(v));
                }
            }
            Some(ParamType::Float) => {
                if let Some(v) = values.first().and_then(|s| s.parse::<f64>().ok()) {
                    out.insert(key, Value::from(v));
                }
            }
            Some(ParamType::StringList) => {
                out.insert(key, Value::from(values));
            }
            None => {}
        }
    }

    Ok(serde_json::to_vec(&Value::Object(out))?)
}
