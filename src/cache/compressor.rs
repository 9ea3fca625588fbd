//! Payload compression for the disk tier.
//!
//! Entries are compressed once on write and decompressed on a disk hit.
//! A payload the codec cannot shrink is stored raw, so the stored size never
//! exceeds the original size.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use thiserror::Error;

use crate::cache::entry::Codec;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Zstd codec failed: {0}")]
    Zstd(#[source] std::io::Error),

    #[error("Gzip codec failed: {0}")]
    Gzip(#[source] std::io::Error),

    #[error("Decoded {actual} bytes, header says {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// The compression engine used by the store.
#[derive(Debug, Clone)]
pub struct Compressor {
    codec: Codec,
    level: i32,
}

impl Compressor {
    pub fn new(codec: Codec, level: i32) -> Self {
        Self { codec, level }
    }

    /// Compress a payload. Returns the codec actually applied with the output.
    pub fn compress(&self, data: &[u8]) -> Result<(Codec, Vec<u8>), CompressionError> {
        let encoded = match self.codec {
            Codec::None => return Ok((Codec::None, data.to_vec())),
            Codec::Zstd => self.zstd_compress(data)?,
            Codec::Gzip => self.gzip_compress(data)?,
        };

        if encoded.len() >= data.len() {
            Ok((Codec::None, data.to_vec()))
        } else {
            Ok((self.codec, encoded))
        }
    }

    /// Decompress a stored payload and check it against the recorded size.
    ///
    /// `expected_len` comes from the entry header and is not trusted: output
    /// is read at most one byte past it, and the buffer is not sized from it.
    pub fn decompress(
        &self,
        codec: Codec,
        data: &[u8],
        expected_len: u64,
    ) -> Result<Vec<u8>, CompressionError> {
        let decoded = match codec {
            Codec::None => data.to_vec(),
            Codec::Zstd => {
                let decoder = zstd::stream::read::Decoder::new(data).map_err(CompressionError::Zstd)?;
                read_bounded(decoder, data.len(), expected_len).map_err(CompressionError::Zstd)?
            }
            Codec::Gzip => {
                read_bounded(GzDecoder::new(data), data.len(), expected_len)
                    .map_err(CompressionError::Gzip)?
            }
        };

        if decoded.len() as u64 != expected_len {
            return Err(CompressionError::SizeMismatch {
                expected: expected_len,
                actual: decoded.len() as u64,
            });
        }
        Ok(decoded)
    }

    fn zstd_compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        zstd::encode_all(data, self.level).map_err(CompressionError::Zstd)
    }

    fn gzip_compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let level = flate2::Compression::new(self.level.clamp(0, 9) as u32);
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), level);
        encoder.write_all(data).map_err(CompressionError::Gzip)?;
        encoder.finish().map_err(CompressionError::Gzip)
    }
}

/// Read at most `expected_len + 1` bytes so overlong output shows up as a mismatch.
fn read_bounded<R: Read>(reader: R, input_len: usize, expected_len: u64) -> std::io::Result<Vec<u8>> {
    let hint = expected_len.min((input_len as u64).saturating_mul(4));
    let mut out = Vec::with_capacity(hint as usize);
    reader.take(expected_len.saturating_add(1)).read_to_end(&mut out)?;
    Ok(out)
}
