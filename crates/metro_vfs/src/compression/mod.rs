//! Block compression and decompression handling.
//!
//! Two unrelated codecs are in use across the Metro games:
//!
//! - [`Codec::Legacy`]: the QuickLZ packet stream used by *Metro 2033* and *Last Light*.
//! - [`Codec::Lz4`]: the LZ4 block stream used by *Redux*, *Arktika.1* and *Exodus*.
//!
//! Which one applies to an archive is decided by its registry, see [`crate::types::Layout`].

pub mod lz4;
pub mod quicklz;

use tracing::instrument;

use crate::error::{CodecError, FormatError};

/// Compression tag stored in a VFX header
///
/// Only [`CompressionType::Lz4`] is accepted by the readers. *Last Light* registries carry the
/// same tag even though their payloads use the legacy codec.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum CompressionType {
    /// Tag found in every shipped registry
    #[default]
    Lz4 = 1,
}

impl TryFrom<u32> for CompressionType {
    type Error = FormatError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CompressionType::Lz4),
            other => Err(FormatError::UnsupportedCompression(other)),
        }
    }
}

impl From<CompressionType> for u32 {
    fn from(value: CompressionType) -> Self {
        value as u32
    }
}

/// Codec used to compress file payloads inside package blobs
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Codec {
    /// QuickLZ packets of up to 64 KiB each
    Legacy,

    /// LZ4 blocks of up to 192 KiB each, sharing a sliding dictionary
    Lz4,
}

impl Codec {
    /// Decode `src` into a buffer of at most `capacity` bytes
    ///
    /// The returned buffer may be shorter than `capacity` when the stream holds less data; the
    /// callers compare it against the size they expect.
    #[instrument(skip(src), fields(compressed = src.len()), err)]
    pub fn decompress(self, src: &[u8], capacity: usize) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Legacy => quicklz::decompress(src, capacity),
            Codec::Lz4 => lz4::decompress_stream(src, capacity),
        }
    }

    /// Encode `src` using this codec's stream framing
    #[instrument(skip(src), fields(uncompressed = src.len()))]
    pub fn compress(self, src: &[u8]) -> Vec<u8> {
        match self {
            Codec::Legacy => quicklz::compress(src),
            Codec::Lz4 => lz4::compress_stream(src),
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    use super::{Codec, CompressionType};
    use crate::error::{CodecError, FormatError};

    fn sample(len: usize) -> Vec<u8> {
        // text-like data with plenty of repeats and some noise
        let words = [&b"metro "[..], b"tunnel ", b"station ", b"ranger ", b"\x00\x01\x02"];
        let mut state = 0x2545_f491u32;
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            if state % 7 == 0 {
                out.push(state as u8);
            } else {
                out.extend_from_slice(words[(state as usize >> 3) % words.len()]);
            }
        }
        out.truncate(len);
        out
    }

    #[traced_test]
    #[test]
    fn round_trip_both_codecs() -> Result<(), CodecError> {
        for codec in [Codec::Legacy, Codec::Lz4] {
            for len in [0usize, 1, 4095, 4096, 0x30001] {
                let data = sample(len);
                let packed = codec.compress(&data);
                let unpacked = codec.decompress(&packed, len)?;
                assert_eq!(unpacked.len(), len, "{codec:?} at {len}");
                assert!(unpacked == data, "{codec:?} at {len} differs");
            }
        }

        Ok(())
    }

    #[test]
    fn compressible_data_shrinks() {
        let data = sample(0x20000);
        for codec in [Codec::Legacy, Codec::Lz4] {
            assert!(codec.compress(&data).len() < data.len() * 3 / 4, "{codec:?}");
        }
    }

    #[test]
    fn compression_tag() {
        assert_eq!(CompressionType::try_from(1), Ok(CompressionType::Lz4));
        assert_eq!(
            CompressionType::try_from(0),
            Err(FormatError::UnsupportedCompression(0))
        );
        assert_eq!(u32::from(CompressionType::Lz4), 1);
    }
}
