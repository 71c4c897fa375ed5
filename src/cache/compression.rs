//! Size-gated gzip compression for stored payloads.
//!
//! Compressed payloads are wrapped as `{"__compressed":true,"data":"<base64>"}`
//! so reads can tell the two formats apart without out-of-band metadata.

use std::io::{Read, Write};

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::config::CompressionConfig;
use super::error::CacheError;

const MARKER_PREFIX: &[u8] = br#"{"__compressed":true"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressed {
    pub data: Vec<u8>,
    pub compressed: bool,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "__compressed")]
    compressed: bool,
    data: String,
}

#[derive(Debug, Clone, Copy)]
pub struct CompressionCodec {
    config: CompressionConfig,
}

impl CompressionCodec {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Compress `payload` when enabled and larger than the threshold. Any
    /// encoder failure falls back to storing the payload as-is.
    pub fn compress(&self, payload: Vec<u8>) -> Compressed {
        if !self.config.enabled || payload.len() <= self.config.threshold_bytes {
            return Compressed {
                data: payload,
                compressed: false,
            };
        }
        match gzip_envelope(&payload) {
            Ok(data) => Compressed {
                data,
                compressed: true,
            },
            Err(err) => {
                warn!(
                    target = "tagcache::cache::compression",
                    error = %err,
                    size = payload.len(),
                    "Compression failed; storing uncompressed"
                );
                Compressed {
                    data: payload,
                    compressed: false,
                }
            }
        }
    }

    /// Undo [`compress`](Self::compress). Plain payloads pass through
    /// unchanged, even when compression is disabled.
    pub fn decompress(&self, stored: &[u8]) -> Result<Vec<u8>, CacheError> {
        if !stored.starts_with(MARKER_PREFIX) {
            return Ok(stored.to_vec());
        }
        let envelope: Envelope = serde_json::from_slice(stored)?;
        if !envelope.compressed {
            return Err(CacheError::serialization("compression marker is false"));
        }
        let gz = BASE64_STANDARD
            .decode(envelope.data.as_bytes())
            .map_err(|err| CacheError::serialization(err.to_string()))?;
        let mut decoder = GzDecoder::new(gz.as_slice());
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|err| CacheError::serialization(err.to_string()))?;
        Ok(out)
    }
}

fn gzip_envelope(payload: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 2), Compression::default());
    encoder
        .write_all(payload)
        .map_err(|err| CacheError::serialization(err.to_string()))?;
    let gz = encoder
        .finish()
        .map_err(|err| CacheError::serialization(err.to_string()))?;
    let envelope = Envelope {
        compressed: true,
        data: BASE64_STANDARD.encode(gz),
    };
    Ok(serde_json::to_vec(&envelope)?)
}
