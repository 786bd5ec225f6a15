//! Stream measurement: the primitive behind every deferred descriptor.

use std::io::{Read, Write};

use sha2::{Digest, Sha256};

use super::{LayerError, LayerStream};

/// Callback invoked once a measured stream has been fully consumed, with
/// the hex SHA-256 of the forwarded bytes and their count.
pub type Finalizer = Box<dyn FnOnce(String, u64) + Send>;

/// Wraps a byte stream, hashing and counting everything read through it.
///
/// The finalizer fires exactly once: at EOF, or on drop if the consumer
/// abandons the stream early (in which case the digest and count cover the
/// bytes actually forwarded). Read errors propagate to the caller; the
/// finalizer still fires when the reader is dropped.
pub struct MeasuredReader {
    inner: LayerStream,
    hasher: Option<Sha256>,
    count: u64,
    finalizer: Option<Finalizer>,
    result: Option<(String, u64)>,
}

impl MeasuredReader {
    pub fn new(inner: LayerStream, finalizer: Finalizer) -> Self {
        MeasuredReader {
            inner,
            hasher: Some(Sha256::new()),
            count: 0,
            finalizer: Some(finalizer),
            result: None,
        }
    }

    /// Hex digest of the forwarded bytes; [`LayerError::NotComputed`]
    /// until the stream has been drained.
    pub fn digest_hex(&self) -> Result<String, LayerError> {
        self.result
            .as_ref()
            .map(|(d, _)| d.clone())
            .ok_or(LayerError::NotComputed)
    }

    /// Count of forwarded bytes; [`LayerError::NotComputed`] until the
    /// stream has been drained.
    pub fn size(&self) -> Result<u64, LayerError> {
        self.result
            .as_ref()
            .map(|(_, n)| *n)
            .ok_or(LayerError::NotComputed)
    }

    fn finish(&mut self) {
        let Some(hasher) = self.hasher.take() else {
            return;
        };
        let digest = hex::encode(hasher.finalize());
        self.result = Some((digest.clone(), self.count));
        if let Some(finalizer) = self.finalizer.take() {
            finalizer(digest, self.count);
        }
    }
}

impl Read for MeasuredReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.finish();
        } else {
            if let Some(h) = self.hasher.as_mut() {
                h.update(&buf[..n]);
            }
            self.count += n as u64;
        }
        Ok(n)
    }
}

impl Drop for MeasuredReader {
    fn drop(&mut self) {
        self.finish();
    }
}

struct HashWriter {
    hasher: Sha256,
}

impl Write for HashWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Recovers the uncompressed-content digest (diff ID) of a gzip stream as
/// it passes through, without a second read of the source.
///
/// Every chunk forwarded to the consumer is also pushed through a gzip
/// decoder backed by a hasher; at EOF the callback receives the hex digest
/// of the inflated bytes. A corrupt gzip stream surfaces as a read error.
pub struct DiffIdReader {
    inner: LayerStream,
    decoder: Option<flate2::write::GzDecoder<HashWriter>>,
    finalizer: Option<Box<dyn FnOnce(String) + Send>>,
}

impl DiffIdReader {
    pub fn new(inner: LayerStream, finalizer: Box<dyn FnOnce(String) + Send>) -> Self {
        DiffIdReader {
            inner,
            decoder: Some(flate2::write::GzDecoder::new(HashWriter {
                hasher: Sha256::new(),
            })),
            finalizer: Some(finalizer),
        }
    }

    fn finish(&mut self) -> std::io::Result<()> {
        let Some(decoder) = self.decoder.take() else {
            return Ok(());
        };
        let writer = decoder.finish()?;
        if let Some(finalizer) = self.finalizer.take() {
            finalizer(hex::encode(writer.hasher.finalize()));
        }
        Ok(())
    }
}

impl Read for DiffIdReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.finish()?;
        } else if let Some(d) = self.decoder.as_mut() {
            d.write_all(&buf[..n])?;
        }
        Ok(n)
    }
}

impl Drop for DiffIdReader {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    use flate2::Compression;
    use sha2::{Digest, Sha256};

    use super::*;

    fn capture() -> (Arc<Mutex<Vec<(String, u64)>>>, Finalizer) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cloned = seen.clone();
        let finalizer: Finalizer = Box::new(move |digest, count| {
            cloned.lock().unwrap().push((digest, count));
        });
        (seen, finalizer)
    }

    #[test]
    fn forwards_the_stream_unchanged() {
        let (_, finalizer) = capture();
        let mut r = MeasuredReader::new(Box::new(Cursor::new(b"hello world".to_vec())), finalizer);

        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn finalizer_reports_digest_and_count() {
        let (seen, finalizer) = capture();
        let mut r = MeasuredReader::new(Box::new(Cursor::new(b"hello world".to_vec())), finalizer);
        std::io::copy(&mut r, &mut std::io::sink()).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[(
                "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9".to_string(),
                11
            )]
        );
    }

    #[test]
    fn accessors_gate_until_drained() {
        let (_, finalizer) = capture();
        let mut r = MeasuredReader::new(Box::new(Cursor::new(b"hello".to_vec())), finalizer);

        assert!(matches!(r.digest_hex(), Err(LayerError::NotComputed)));
        assert!(matches!(r.size(), Err(LayerError::NotComputed)));

        std::io::copy(&mut r, &mut std::io::sink()).unwrap();
        assert_eq!(r.size().unwrap(), 5);
    }

    #[test]
    fn finalizer_fires_once_with_partial_count_on_early_drop() {
        let (seen, finalizer) = capture();
        let mut r = MeasuredReader::new(Box::new(Cursor::new(vec![7u8; 64])), finalizer);

        let mut buf = [0u8; 16];
        r.read(&mut buf).unwrap();
        drop(r);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, 16);
    }

    #[test]
    fn diff_id_reader_recovers_uncompressed_digest() {
        let mut gz = flate2::read::GzEncoder::new(Cursor::new(b"blah".to_vec()), Compression::default());
        let mut compressed = Vec::new();
        gz.read_to_end(&mut compressed).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let cloned = seen.clone();
        let mut r = DiffIdReader::new(
            Box::new(Cursor::new(compressed)),
            Box::new(move |digest| *cloned.lock().unwrap() = Some(digest)),
        );
        std::io::copy(&mut r, &mut std::io::sink()).unwrap();

        let expected = hex::encode(Sha256::digest(b"blah"));
        assert_eq!(seen.lock().unwrap().as_deref(), Some(expected.as_str()));
    }
}
