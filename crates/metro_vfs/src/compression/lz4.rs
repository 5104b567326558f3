//! LZ4 block streams and blobs
//!
//! A stream is a sequence of blocks, each one prefixed by two little endian `u32`: the size of
//! the block including this 8 byte header, and the number of bytes it decodes to. Blocks may
//! reference up to 64 KiB of previously decoded data, even across block boundaries.
//!
//! A blob is a single raw LZ4 block without any header.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::CodecError;

/// Largest amount of input encoded into a single stream block
pub const STREAM_BLOCK_SIZE: usize = 0x30000;

const DICTIONARY_SIZE: usize = 0x10000;
const BLOCK_HEADER_LEN: usize = 8;

/// Upper bound of what one byte of LZ4 block input can decode to
const MAX_RATIO: usize = 255;

/// Largest output an LZ4 block of `len` bytes can produce
fn max_decoded_len(len: usize) -> usize {
    len.saturating_mul(MAX_RATIO).saturating_add(16)
}

/// Decode a block stream into a buffer of at most `capacity` bytes
pub fn decompress_stream(src: &[u8], capacity: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    let mut written = 0;
    let mut cursor = 0;

    while cursor < src.len() {
        let header = src
            .get(cursor..cursor + BLOCK_HEADER_LEN)
            .ok_or(CodecError::Framing(cursor))?;
        let block_len = LittleEndian::read_u32(&header[..4]) as usize;
        let declared = LittleEndian::read_u32(&header[4..]) as usize;

        if block_len < BLOCK_HEADER_LEN {
            return Err(CodecError::Framing(cursor));
        }
        let block = src
            .get(cursor + BLOCK_HEADER_LEN..cursor + block_len)
            .ok_or(CodecError::Framing(cursor))?;
        if written + declared > capacity {
            return Err(CodecError::Overrun);
        }
        if declared > max_decoded_len(block.len()) {
            return Err(CodecError::Framing(cursor));
        }
        out.resize(written + declared, 0);

        let (history, rest) = out.split_at_mut(written);
        let dictionary = &history[history.len().saturating_sub(DICTIONARY_SIZE)..];
        let n =
            lz4_flex::block::decompress_into_with_dict(block, &mut rest[..declared], dictionary)?;
        if n != declared {
            return Err(CodecError::Framing(cursor));
        }

        written += n;
        cursor += block_len;
    }

    out.truncate(written);
    Ok(out)
}

/// Encode `src` as a block stream of [`STREAM_BLOCK_SIZE`] blocks
///
/// Blocks are compressed with the fast `lz4_flex` compressor; it has no high compression mode,
/// so the output is larger than what the games' own packer produces, but decodes the same.
pub fn compress_stream(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(lz4_flex::block::get_maximum_output_size(src.len()) + 64);
    for chunk in src.chunks(STREAM_BLOCK_SIZE) {
        let block = lz4_flex::block::compress(chunk);
        out.extend_from_slice(&((block.len() + BLOCK_HEADER_LEN) as u32).to_le_bytes());
        out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        out.extend_from_slice(&block);
    }
    out
}

/// Decode a single headerless block of exactly `uncompressed` bytes
pub fn decompress_blob(src: &[u8], uncompressed: usize) -> Result<Vec<u8>, CodecError> {
    if uncompressed > max_decoded_len(src.len()) {
        return Err(CodecError::Framing(0));
    }
    let out = lz4_flex::block::decompress(src, uncompressed)?;
    if out.len() != uncompressed {
        return Err(CodecError::Framing(0));
    }
    Ok(out)
}

/// Encode `src` as a single headerless block
pub fn compress_blob(src: &[u8]) -> Vec<u8> {
    lz4_flex::block::compress(src)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{compress_blob, compress_stream, decompress_blob, decompress_stream};
    use crate::error::CodecError;

    #[test]
    fn stream_block_header() -> Result<(), CodecError> {
        let data = b"abcabcabcabcabcabcabcabcabcabc";
        let packed = compress_stream(data);

        let block_len = u32::from_le_bytes([packed[0], packed[1], packed[2], packed[3]]) as usize;
        let declared = u32::from_le_bytes([packed[4], packed[5], packed[6], packed[7]]) as usize;
        assert_eq!(block_len, packed.len());
        assert_eq!(declared, data.len());

        assert_eq!(decompress_stream(&packed, data.len())?, data);
        Ok(())
    }

    #[test]
    fn blocks_reference_previous_output() -> Result<(), CodecError> {
        #[rustfmt::skip]
        let data = [
            0x0d, 0x00, 0x00, 0x00,       // block of 13 bytes
            0x04, 0x00, 0x00, 0x00,       // decodes to 4 bytes
            0x40, b'w', b'x', b'y', b'z', // 4 literals, no match
            0x0c, 0x00, 0x00, 0x00,       // block of 12 bytes
            0x04, 0x00, 0x00, 0x00,       // decodes to 4 bytes
            0x00,                         // no literals, match length 4
            0x04, 0x00,                   // offset 4, reaching into the first block
            0x00,                         // empty final sequence
        ];

        assert_eq!(decompress_stream(&data, 8)?, b"wxyzwxyz");
        Ok(())
    }

    #[test]
    fn stream_errors() {
        let packed = compress_stream(&[5u8; 1000]);

        assert!(matches!(
            decompress_stream(&packed, 999),
            Err(CodecError::Overrun)
        ));
        assert!(matches!(
            decompress_stream(&packed[..packed.len() - 1], 1000),
            Err(CodecError::Framing(0))
        ));
        assert!(matches!(
            decompress_stream(&[1, 0, 0, 0], 1000),
            Err(CodecError::Framing(0))
        ));
    }

    #[test]
    fn declared_size_is_bounded_by_input() {
        #[rustfmt::skip]
        let block = [
            0x09, 0x00, 0x00, 0x00, // block length
            0xF0, 0xFF, 0xFF, 0xFF, // decoded length
            0x00,
        ];

        assert!(matches!(
            decompress_stream(&block, usize::MAX),
            Err(CodecError::Framing(0))
        ));
        assert!(matches!(
            decompress_blob(&[0x00], u32::MAX as usize),
            Err(CodecError::Framing(0))
        ));
    }

    #[test]
    fn blob() -> Result<(), CodecError> {
        let data = b"blob blob blob blob blob blob";
        assert_eq!(decompress_blob(&compress_blob(data), data.len())?, data);
        Ok(())
    }
}
