//! Payload compression for large job bodies and cache values.
//!
//! Four codecs (gzip, deflate, brotli, lz4) behind one self-describing
//! frame format: a one-byte algorithm tag prefix, so a consumer can
//! decompress without being told which codec was used.

use std::io::{Read, Write};

use thiserror::Error;

/// Errors raised while compressing or decompressing a payload.
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("io error during compression: {0}")]
    Io(#[from] std::io::Error),

    #[error("brotli error: {0}")]
    Brotli(String),

    #[error("lz4 error: {0}")]
    Lz4(String),

    #[error("unknown algorithm tag: {0}")]
    UnknownTag(u8),

    #[error("payload too short to contain a valid frame")]
    TruncatedFrame,
}

/// Supported codecs. `None` is a valid choice: callers below the
/// compression threshold pass data through untouched but still framed,
/// so decompression never needs to guess whether a payload was
/// compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    None,
    Gzip,
    Deflate,
    Brotli,
    Lz4,
}

impl Algorithm {
    fn tag(self) -> u8 {
        match self {
            Algorithm::None => 0,
            Algorithm::Gzip => 1,
            Algorithm::Deflate => 2,
            Algorithm::Brotli => 3,
            Algorithm::Lz4 => 4,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, CompressionError> {
        match tag {
            0 => Ok(Algorithm::None),
            1 => Ok(Algorithm::Gzip),
            2 => Ok(Algorithm::Deflate),
            3 => Ok(Algorithm::Brotli),
            4 => Ok(Algorithm::Lz4),
            other => Err(CompressionError::UnknownTag(other)),
        }
    }
}

/// Magic byte prefixes of formats that are already compressed; payloads
/// starting with these are not worth recompressing.
const KNOWN_COMPRESSED_MAGIC: &[&[u8]] = &[
    &[0x1f, 0x8b],             // gzip
    &[0x50, 0x4b, 0x03, 0x04], // zip
    &[0x42, 0x5a, 0x68],       // bzip2
    &[0x28, 0xb5, 0x2f, 0xfd], // zstd
];

/// Heuristic: is this payload likely to shrink under compression? Scans
/// for known magic bytes of pre-compressed formats; anything else is
/// assumed compressible.
pub fn is_likely_compressible(data: &[u8]) -> bool {
    !KNOWN_COMPRESSED_MAGIC.iter().any(|magic| data.starts_with(magic))
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn compress_deflate(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress_deflate(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut decoder = flate2::read::DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn compress_brotli(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::new();
    let params = brotli::enc::BrotliEncoderParams::default();
    let mut input = data;
    brotli::BrotliCompress(&mut input, &mut out, &params).map_err(|e| CompressionError::Brotli(e.to_string()))?;
    Ok(out)
}

fn decompress_brotli(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::new();
    let mut input = data;
    brotli::BrotliDecompress(&mut input, &mut out).map_err(|e| CompressionError::Brotli(e.to_string()))?;
    Ok(out)
}

fn compress_lz4(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

fn decompress_lz4(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    lz4_flex::decompress_size_prepended(data).map_err(|e| CompressionError::Lz4(e.to_string()))
}

/// Compress `data` with `algorithm`, producing a self-describing frame
/// (one tag byte followed by the codec's output) so `decompress` never
/// needs the algorithm passed back in.
pub fn compress(data: &[u8], algorithm: Algorithm) -> Result<Vec<u8>, CompressionError> {
    let body = match algorithm {
        Algorithm::None => data.to_vec(),
        Algorithm::Gzip => compress_gzip(data)?,
        Algorithm::Deflate => compress_deflate(data)?,
        Algorithm::Brotli => compress_brotli(data)?,
        Algorithm::Lz4 => compress_lz4(data),
    };

    let mut framed = Vec::with_capacity(body.len() + 1);
    framed.push(algorithm.tag());
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Decompress a frame produced by `compress`.
pub fn decompress(framed: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let (tag, body) = framed.split_first().ok_or(CompressionError::TruncatedFrame)?;
    match Algorithm::from_tag(*tag)? {
        Algorithm::None => Ok(body.to_vec()),
        Algorithm::Gzip => decompress_gzip(body),
        Algorithm::Deflate => decompress_deflate(body),
        Algorithm::Brotli => decompress_brotli(body),
        Algorithm::Lz4 => decompress_lz4(body),
    }
}

/// Compress only if `data` is at least `threshold_bytes` and passes the
/// compressibility heuristic; otherwise pass through uncompressed but
/// still framed. Returns the frame and whether compression was applied.
pub fn compress_if_beneficial(
    data: &[u8],
    algorithm: Algorithm,
    threshold_bytes: usize,
) -> Result<(Vec<u8>, bool), CompressionError> {
    if data.len() < threshold_bytes || !is_likely_compressible(data) {
        return Ok((compress(data, Algorithm::None)?, false));
    }

    let framed = compress(data, algorithm)?;
    if framed.len() >= data.len() {
        // Compression didn't pay off; fall back to the raw passthrough
        // frame rather than ship a larger payload.
        return Ok((compress(data, Algorithm::None)?, false));
    }
    Ok((framed, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible_payload() -> Vec<u8> {
        "the quick brown fox jumps over the lazy dog ".repeat(200).into_bytes()
    }

    #[test]
    fn test_gzip_round_trip() {
        let data = compressible_payload();
        let framed = compress(&data, Algorithm::Gzip).unwrap();
        assert_eq!(decompress(&framed).unwrap(), data);
    }

    #[test]
    fn test_deflate_round_trip() {
        let data = compressible_payload();
        let framed = compress(&data, Algorithm::Deflate).unwrap();
        assert_eq!(decompress(&framed).unwrap(), data);
    }

    #[test]
    fn test_brotli_round_trip() {
        let data = compressible_payload();
        let framed = compress(&data, Algorithm::Brotli).unwrap();
        assert_eq!(decompress(&framed).unwrap(), data);
    }

    #[test]
    fn test_lz4_round_trip() {
        let data = compressible_payload();
        let framed = compress(&data, Algorithm::Lz4).unwrap();
        assert_eq!(decompress(&framed).unwrap(), data);
    }

    #[test]
    fn test_none_passthrough_round_trip() {
        let data = b"small".to_vec();
        let framed = compress(&data, Algorithm::None).unwrap();
        assert_eq!(decompress(&framed).unwrap(), data);
    }

    #[test]
    fn test_below_threshold_skips_compression() {
        let data = b"tiny".to_vec();
        let (framed, compressed) = compress_if_beneficial(&data, Algorithm::Gzip, 1024).unwrap();
        assert!(!compressed);
        assert_eq!(decompress(&framed).unwrap(), data);
    }

    #[test]
    fn test_already_compressed_magic_is_skipped() {
        let mut data = vec![0x1f, 0x8b];
        data.extend_from_slice(&[0u8; 2048]);
        let (_, compressed) = compress_if_beneficial(&data, Algorithm::Gzip, 16).unwrap();
        assert!(!compressed);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let framed = vec![99, 1, 2, 3];
        assert!(matches!(decompress(&framed), Err(CompressionError::UnknownTag(99))));
    }
}
