//! Chunk encoding.
//!
//! The pipeline treats the codec as an opaque content-encoding routine:
//! bytes in, bytes out, deterministic, no side effects. Implementations
//! must be safe to call from a blocking thread (`spawn_blocking`), since
//! encoding is the CPU-bound stage of the pipeline.

use crate::config::{CodecConfig, CodecScheme};
use bytes::Bytes;
use std::sync::Arc;

/// A content encoder for one chunk payload.
pub trait ChunkCodec: Send + Sync {
    /// Encode a raw chunk payload, returning the encoded blob.
    fn encode(&self, raw: Bytes) -> anyhow::Result<Bytes>;

    /// Human-readable scheme name, for logs and reports.
    fn name(&self) -> &'static str;
}

/// Pass-through codec. Output is byte-for-byte the input.
pub struct IdentityCodec;

impl ChunkCodec for IdentityCodec {
    fn encode(&self, raw: Bytes) -> anyhow::Result<Bytes> {
        Ok(raw)
    }

    fn name(&self) -> &'static str {
        "identity"
    }
}

/// Zstd block compression at a fixed level.
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl ChunkCodec for ZstdCodec {
    fn encode(&self, raw: Bytes) -> anyhow::Result<Bytes> {
        let encoded = zstd::bulk::compress(&raw, self.level)?;
        Ok(Bytes::from(encoded))
    }

    fn name(&self) -> &'static str {
        "zstd"
    }
}

/// Build a codec from configuration.
pub fn build_codec(config: &CodecConfig) -> Arc<dyn ChunkCodec> {
    match config.scheme {
        CodecScheme::Identity => Arc::new(IdentityCodec),
        CodecScheme::Zstd => Arc::new(ZstdCodec::new(config.level)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_returns_input() {
        let codec = IdentityCodec;
        let input = Bytes::from_static(b"hello chunk");
        let output = codec.encode(input.clone()).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_zstd_round_trip() {
        let codec = ZstdCodec::new(3);
        let input = Bytes::from(vec![b'a'; 4096]);
        let encoded = codec.encode(input.clone()).unwrap();
        // Highly repetitive input must shrink
        assert!(encoded.len() < input.len());

        let decoded = zstd::bulk::decompress(&encoded, input.len()).unwrap();
        assert_eq!(decoded, input.to_vec());
    }

    #[test]
    fn test_zstd_is_deterministic() {
        let codec = ZstdCodec::new(5);
        let input = Bytes::from_static(b"the same bytes every time");
        let a = codec.encode(input.clone()).unwrap();
        let b = codec.encode(input).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_build_codec_from_config() {
        let config = CodecConfig {
            scheme: CodecScheme::Identity,
            level: 3,
        };
        assert_eq!(build_codec(&config).name(), "identity");

        let config = CodecConfig::default();
        assert_eq!(build_codec(&config).name(), "zstd");
    }
}
