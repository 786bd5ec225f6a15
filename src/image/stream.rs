//! Streaming gzip layers.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use flate2::Compression;
use flate2::read::GzEncoder;

use super::measured::MeasuredReader;
use super::{Layer, LayerError, LayerStream};

#[derive(Default)]
struct StreamState {
    diff_id: Option<String>,
    digest: Option<String>,
    size: Option<i64>,
    done: bool,
}

/// A layer backed by a one-shot byte source, gzip-compressed as it is
/// read.
///
/// The source is consumed on the first `compressed()` call; the diff ID,
/// digest and size materialize when that stream reaches EOF (or is
/// dropped). A second `compressed()` call after consumption yields an
/// empty stream so sinks can revisit the layer while rewriting manifests.
pub struct StreamLayer {
    media_type: String,
    compression: Compression,
    source: Mutex<Option<LayerStream>>,
    state: Arc<Mutex<StreamState>>,
}

impl StreamLayer {
    pub fn new(source: LayerStream, media_type: &str, compression: Compression) -> Self {
        StreamLayer {
            media_type: media_type.to_string(),
            compression,
            source: Mutex::new(Some(source)),
            state: Arc::new(Mutex::new(StreamState::default())),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>, media_type: &str, compression: Compression) -> Self {
        Self::new(Box::new(Cursor::new(bytes)), media_type, compression)
    }
}

impl Layer for StreamLayer {
    fn media_type(&self) -> Result<String, LayerError> {
        Ok(self.media_type.clone())
    }

    fn diff_id(&self) -> Result<String, LayerError> {
        self.state
            .lock()
            .unwrap()
            .diff_id
            .clone()
            .ok_or(LayerError::NotComputed)
    }

    fn digest(&self) -> Result<String, LayerError> {
        self.state
            .lock()
            .unwrap()
            .digest
            .clone()
            .ok_or(LayerError::NotComputed)
    }

    fn size(&self) -> Result<i64, LayerError> {
        self.state.lock().unwrap().size.ok_or(LayerError::NotComputed)
    }

    fn compressed(&self) -> Result<LayerStream, LayerError> {
        let source = match self.source.lock().unwrap().take() {
            Some(s) => s,
            None => {
                return if self.state.lock().unwrap().done {
                    Ok(Box::new(std::io::empty()))
                } else {
                    Err(LayerError::Consumed)
                };
            }
        };

        // Uncompressed side: records the diff ID when the source drains.
        let state = self.state.clone();
        let measured_source = MeasuredReader::new(
            source,
            Box::new(move |digest, _| {
                state.lock().unwrap().diff_id = Some(format!("sha256:{digest}"));
            }),
        );

        // Compressed side: records digest and size of the wire bytes.
        let compressor = GzEncoder::new(measured_source, self.compression);
        let state = self.state.clone();
        let measured = MeasuredReader::new(
            Box::new(compressor),
            Box::new(move |digest, count| {
                let mut st = state.lock().unwrap();
                st.digest = Some(format!("sha256:{digest}"));
                st.size = Some(count as i64);
                st.done = true;
            }),
        );

        Ok(Box::new(measured))
    }

    fn uncompressed(&self) -> Result<LayerStream, LayerError> {
        Err(LayerError::Unavailable(
            "uncompressed stream is not available for streaming layers",
        ))
    }

    fn annotations(&self) -> Result<BTreeMap<String, String>, LayerError> {
        Ok(BTreeMap::new())
    }
}
