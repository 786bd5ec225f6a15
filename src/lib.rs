//! Kapsule packages large language model artifacts (weights, prompt
//! templates, sampler parameters) as OCI images.
//!
//! The crate is organized around a streaming layer pipeline: a
//! [`modelfile`] is parsed into a layer plan, the [`builder`] assembles a
//! streaming [`image::Image`] from it, the [`crypto`] adapters optionally
//! encrypt or decrypt every layer in flight, and a [`writer`] drains the
//! pipeline into a registry, an OCI image-layout directory, or an
//! Ollama-compatible store. Digests and sizes of streaming layers are only
//! known after their streams have been fully consumed; sinks honor that
//! deferred-descriptor contract.

pub mod builder;
pub mod crypto;
pub mod image;
pub mod modelfile;
pub mod reader;
pub mod types;
pub mod writer;
