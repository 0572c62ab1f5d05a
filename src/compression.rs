//! Lossless packing of f32 sample buffers for the backing store.
//!
//! Every blob is tagged with the integer id of the scheme that produced it.
//! Ids are never reused; new schemes get the next free id.

use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::Deserialize;
use thiserror::Error;

const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("unknown compression scheme id {0}")]
    UnknownScheme(i64),
    #[error("zlib: {0}")]
    Zlib(#[from] std::io::Error),
    #[error("LZ4: {0}")]
    Lz4(String),
    #[error("decompressed {found} bytes, expected {expected}")]
    LengthMismatch { expected: usize, found: usize },
}

/// Known compression schemes, keyed by their persisted id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionScheme {
    /// Little-endian f32, uncompressed.
    Raw,
    Zlib,
    Lz4,
}

impl Default for CompressionScheme {
    fn default() -> Self {
        Self::PREFERRED
    }
}

impl CompressionScheme {
    /// Scheme used for every write unless configured otherwise.
    pub const PREFERRED: Self = Self::Lz4;

    /// Known schemes, newest first. Reads try schemes in this order of preference.
    pub const ALL: [Self; 3] = [Self::Lz4, Self::Zlib, Self::Raw];

    pub fn id(self) -> i64 {
        match self {
            Self::Raw => 0,
            Self::Zlib => 1,
            Self::Lz4 => 2,
        }
    }

    pub fn from_id(id: i64) -> Result<Self, CompressionError> {
        Self::ALL
            .into_iter()
            .find(|s| s.id() == id)
            .ok_or(CompressionError::UnknownScheme(id))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Zlib => "zlib",
            Self::Lz4 => "lz4",
        }
    }

    /// Pack samples into a blob.
    pub fn pack(self, samples: &[f32]) -> Result<Vec<u8>, CompressionError> {
        let raw = to_bytes(samples);
        match self {
            Self::Raw => Ok(raw),
            Self::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&raw)?;
                Ok(encoder.finish()?)
            }
            Self::Lz4 => Ok(lz4_flex::block::compress(&raw)),
        }
    }

    /// Unpack a blob that must hold exactly `expected_samples` samples.
    /// Anything else means the blob is corrupt.
    pub fn unpack(self, blob: &[u8], expected_samples: usize) -> Result<Vec<f32>, CompressionError> {
        let expected = expected_samples * SAMPLE_BYTES;
        let raw = match self {
            Self::Raw => blob.to_vec(),
            Self::Zlib => {
                // Read one byte past the expected size so oversized payloads are detected
                // without inflating all of them.
                let mut decoder = ZlibDecoder::new(blob).take(expected as u64 + 1);
                let mut out = Vec::with_capacity(expected);
                decoder.read_to_end(&mut out)?;
                out
            }
            Self::Lz4 => lz4_flex::block::decompress(blob, expected)
                .map_err(|e| CompressionError::Lz4(e.to_string()))?,
        };

        if raw.len() != expected {
            return Err(CompressionError::LengthMismatch {
                expected,
                found: raw.len(),
            });
        }
        Ok(from_bytes(&raw))
    }
}

fn to_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = vec![0u8; samples.len() * SAMPLE_BYTES];
    LittleEndian::write_f32_into(samples, &mut out);
    out
}

fn from_bytes(bytes: &[u8]) -> Vec<f32> {
    let mut out = vec![0.0f32; bytes.len() / SAMPLE_BYTES];
    LittleEndian::read_f32_into(bytes, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| ((i as f32) * 0.013).sin() * 0.8).collect()
    }

    #[test]
    fn test_every_scheme_is_lossless() {
        let samples = ramp(4096);
        for scheme in CompressionScheme::ALL {
            let blob = scheme.pack(&samples).unwrap();
            let back = scheme.unpack(&blob, samples.len()).unwrap();
            // Bit-identical, not just approximately equal
            let same = samples.iter().zip(&back).all(|(a, b)| a.to_bits() == b.to_bits());
            assert!(same, "{} is not lossless", scheme.name());
        }
    }

    #[test]
    fn test_compressed_schemes_shrink_silence() {
        let silence = vec![0.0f32; 4096];
        let raw = CompressionScheme::Raw.pack(&silence).unwrap().len();
        assert!(CompressionScheme::Zlib.pack(&silence).unwrap().len() < raw / 10);
        assert!(CompressionScheme::Lz4.pack(&silence).unwrap().len() < raw / 10);
    }

    #[test]
    fn test_ids_round_trip_and_unknown_rejected() {
        for scheme in CompressionScheme::ALL {
            assert_eq!(CompressionScheme::from_id(scheme.id()).unwrap(), scheme);
        }
        assert!(matches!(
            CompressionScheme::from_id(3),
            Err(CompressionError::UnknownScheme(3))
        ));
        assert!(matches!(
            CompressionScheme::from_id(-1),
            Err(CompressionError::UnknownScheme(-1))
        ));
    }

    #[test]
    fn test_length_mismatch_detected() {
        let samples = ramp(100);
        for scheme in CompressionScheme::ALL {
            let blob = scheme.pack(&samples).unwrap();
            assert!(scheme.unpack(&blob, 101).is_err(), "{} accepted short blob", scheme.name());
            assert!(scheme.unpack(&blob, 99).is_err(), "{} accepted long blob", scheme.name());
        }
    }

    #[test]
    fn test_garbage_blob_is_an_error() {
        let garbage = vec![0xFFu8; 64];
        assert!(CompressionScheme::Zlib.unpack(&garbage, 16).is_err());
        assert!(CompressionScheme::Lz4.unpack(&garbage, 16).is_err());
    }
}
