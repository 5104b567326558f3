//! QuickLZ 1.5.0 packet streams
//!
//! A legacy payload is a plain concatenation of independent packets. Each packet starts with a
//! header byte followed by its sizes:
//!
//! | Bit | Meaning                                                  |
//! |-----|----------------------------------------------------------|
//! | 0   | body is compressed, otherwise the bytes are stored as-is |
//! | 1   | long header: two `u32` sizes instead of two `u8` sizes   |
//! | 2-3 | compression level                                        |
//! | 4-5 | streaming buffer mode (unused)                           |
//! | 6   | always set                                               |
//!
//! The first size includes the header itself, the second one is the decompressed size of the
//! packet. Compressed bodies are a sequence of 32 bit control words, each one describing whether
//! the next 31 tokens are literals or back references.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::CodecError;

/// Largest amount of input encoded into a single packet
pub const BLOCK_SIZE: usize = 0x10000;

const HASH_VALUES: usize = 4096;
const CWORD_LEN: usize = 4;
const CWORD_SENTINEL: u32 = 1 << 31;

/// Trailing bytes of a packet that are always stored as literals
const UNCOMPRESSED_END: usize = 4;
const LITERAL_TAIL: usize = 11;

const MIN_BODY: usize = 9;
const SHORT_HEADER_LIMIT: usize = 216;
const SHORT_HEADER_LEN: usize = 3;
const LONG_HEADER_LEN: usize = 9;

const SHORT_MATCH: usize = 18;
const MAX_MATCH: usize = 255;

const FLAG_COMPRESSED: u8 = 1;
const FLAG_LONG_HEADER: u8 = 1 << 1;
const FLAG_ALWAYS: u8 = 1 << 6;
const LEVEL_SHIFT: u8 = 2;
const ENCODER_LEVEL: u8 = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct PacketHeader {
    compressed: bool,
    level: u8,
    header_len: usize,
    packet_len: usize,
    decompressed: usize,
}

impl PacketHeader {
    fn parse(src: &[u8]) -> Result<Self, CodecError> {
        let flags = *src.first().ok_or(CodecError::TruncatedHeader)?;
        let long = flags & FLAG_LONG_HEADER != 0;
        let header_len = if long {
            LONG_HEADER_LEN
        } else {
            SHORT_HEADER_LEN
        };
        let header = src.get(..header_len).ok_or(CodecError::TruncatedHeader)?;

        let (packet_len, decompressed) = if long {
            (
                LittleEndian::read_u32(&header[1..5]) as usize,
                LittleEndian::read_u32(&header[5..9]) as usize,
            )
        } else {
            (header[1] as usize, header[2] as usize)
        };

        if packet_len < header_len {
            return Err(CodecError::TruncatedHeader);
        }
        if packet_len > src.len() {
            return Err(CodecError::TruncatedPacket {
                declared: packet_len,
                available: src.len(),
            });
        }

        Ok(Self {
            compressed: flags & FLAG_COMPRESSED != 0,
            level: (flags >> LEVEL_SHIFT) & 3,
            header_len,
            packet_len,
            decompressed,
        })
    }
}

/// Decode every packet of `src`, refusing to grow past `capacity` bytes
pub fn decompress(src: &[u8], capacity: usize) -> Result<Vec<u8>, CodecError> {
    // grown packet by packet, `capacity` comes from the registry
    let mut out = Vec::new();
    let mut cursor = 0;

    while cursor < src.len() {
        let header = PacketHeader::parse(&src[cursor..])?;
        if out.len() + header.decompressed > capacity {
            return Err(CodecError::Overrun);
        }

        let body = &src[cursor + header.header_len..cursor + header.packet_len];
        if header.compressed {
            match header.level {
                1 | 3 => decode_packet(body, header.decompressed, header.level, &mut out)?,
                other => return Err(CodecError::UnsupportedLevel(other)),
            }
        } else {
            let raw = body
                .get(..header.decompressed)
                .ok_or(CodecError::UnexpectedEnd)?;
            out.extend_from_slice(raw);
        }

        cursor += header.packet_len;
    }

    Ok(out)
}

fn hash3(bytes: &[u8]) -> usize {
    let value = bytes[0] as u32 | (bytes[1] as u32) << 8 | (bytes[2] as u32) << 16;
    (((value >> 12) ^ value) as usize) & (HASH_VALUES - 1)
}

/// Little endian word at `at`, zero padded past the end of `body`
fn fetch(body: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    if let Some(rest) = body.get(at..) {
        let n = rest.len().min(word.len());
        word[..n].copy_from_slice(&rest[..n]);
    }
    u32::from_le_bytes(word)
}

fn read_cword(body: &[u8], at: usize) -> Result<u32, CodecError> {
    body.get(at..at + CWORD_LEN)
        .map(LittleEndian::read_u32)
        .ok_or(CodecError::UnexpectedEnd)
}

fn hash_position(table: &mut [Option<usize>], out: &[u8], position: usize) {
    if let Some(bytes) = out.get(position..position + 3) {
        table[hash3(bytes)] = Some(position);
    }
}

/// Level 3 back reference as `(offset, length, bytes used)`
fn level3_token(fetch: u32) -> (usize, usize, usize) {
    if fetch & 3 == 0 {
        (((fetch & 0xff) >> 2) as usize, 3, 1)
    } else if fetch & 2 == 0 {
        (((fetch & 0xffff) >> 2) as usize, 3, 2)
    } else if fetch & 1 == 0 {
        (
            ((fetch & 0xffff) >> 6) as usize,
            ((fetch >> 2) & 15) as usize + 3,
            2,
        )
    } else if fetch & 127 != 3 {
        (
            ((fetch >> 7) & 0x1ffff) as usize,
            ((fetch >> 2) & 0x1f) as usize + 2,
            3,
        )
    } else {
        ((fetch >> 15) as usize, ((fetch >> 7) & 255) as usize + 3, 4)
    }
}

fn decode_packet(body: &[u8], size: usize, level: u8, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let base = out.len();
    let end = base + size;
    let literal_limit = base + size.saturating_sub(LITERAL_TAIL);

    // level 1 references earlier positions through a hash of their first three bytes
    let mut table = if level == 1 {
        vec![None; HASH_VALUES]
    } else {
        Vec::new()
    };
    let mut next_hash = base;

    let mut src = 0;
    let mut cword: u32 = 1;

    loop {
        if cword == 1 {
            cword = read_cword(body, src)?;
            src += CWORD_LEN;
        }

        if cword & 1 == 1 {
            cword >>= 1;
            let word = fetch(body, src);

            let (from, len) = if level == 1 {
                let hash = ((word >> 4) & 0xfff) as usize;
                let len = if word & 0xf != 0 {
                    src += 2;
                    (word & 0xf) as usize + 2
                } else {
                    let len = *body.get(src + 2).ok_or(CodecError::UnexpectedEnd)? as usize;
                    src += 3;
                    len
                };
                (table[hash].ok_or(CodecError::InvalidOffset)?, len)
            } else {
                let (offset, len, used) = level3_token(word);
                src += used;
                if offset == 0 || offset > out.len() {
                    return Err(CodecError::InvalidOffset);
                }
                (out.len() - offset, len)
            };

            if out.len() + len > end {
                return Err(CodecError::Overrun);
            }

            // byte by byte, a match may overlap its own output
            let start = out.len();
            for i in 0..len {
                let byte = out[from + i];
                out.push(byte);
            }

            if level == 1 {
                while next_hash <= start {
                    hash_position(&mut table, out, next_hash);
                    next_hash += 1;
                }
                next_hash = out.len();
            }
        } else if out.len() < literal_limit {
            let byte = *body.get(src).ok_or(CodecError::UnexpectedEnd)?;
            out.push(byte);
            src += 1;
            cword >>= 1;

            if level == 1 {
                while next_hash + 3 <= out.len() {
                    hash_position(&mut table, out, next_hash);
                    next_hash += 1;
                }
            }
        } else {
            while out.len() < end {
                if cword == 1 {
                    src += CWORD_LEN;
                    cword = CWORD_SENTINEL;
                }
                let byte = *body.get(src).ok_or(CodecError::UnexpectedEnd)?;
                out.push(byte);
                src += 1;
                cword >>= 1;
            }
            return Ok(());
        }
    }
}

/// Encode `src` as level 1 packets of at most [`BLOCK_SIZE`] bytes each
///
/// Packets that do not shrink enough are stored uncompressed. Empty input produces no packets.
pub fn compress(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() + src.len() / 16 + LONG_HEADER_LEN);
    for block in src.chunks(BLOCK_SIZE) {
        compress_packet(block, &mut out);
    }
    out
}

fn compress_packet(block: &[u8], out: &mut Vec<u8>) {
    let long = block.len() >= SHORT_HEADER_LIMIT;
    let header_len = if long {
        LONG_HEADER_LEN
    } else {
        SHORT_HEADER_LEN
    };

    let body = compress_core(block);
    let compressed = body.is_some();
    let body = body.as_deref().unwrap_or(block);
    let packet_len = header_len + body.len();

    let mut flags = FLAG_ALWAYS | ENCODER_LEVEL << LEVEL_SHIFT;
    if compressed {
        flags |= FLAG_COMPRESSED;
    }

    if long {
        out.push(flags | FLAG_LONG_HEADER);
        out.extend_from_slice(&(packet_len as u32).to_le_bytes());
        out.extend_from_slice(&(block.len() as u32).to_le_bytes());
    } else {
        out.push(flags);
        out.push(packet_len as u8);
        out.push(block.len() as u8);
    }
    out.extend_from_slice(body);
}

fn write_cword(dst: &mut [u8], at: usize, cword: u32) {
    LittleEndian::write_u32(&mut dst[at..at + CWORD_LEN], (cword >> 1) | CWORD_SENTINEL);
}

/// Compressed body of a single packet, or `None` when storing it raw is smaller
fn compress_core(input: &[u8]) -> Option<Vec<u8>> {
    let size = input.len();
    let mut table: Vec<Option<usize>> = vec![None; HASH_VALUES];

    let mut dst = vec![0u8; CWORD_LEN];
    let mut cword_at = 0;
    let mut cword = CWORD_SENTINEL;
    let mut src = 0;
    let mut literals = 0;

    if let Some(last_match_start) = size.checked_sub(LITERAL_TAIL) {
        while src <= last_match_start {
            if cword & 1 == 1 {
                if src > size / 2 && dst.len() > src - src / 32 {
                    return None;
                }
                write_cword(&mut dst, cword_at, cword);
                cword_at = dst.len();
                dst.extend_from_slice(&[0; CWORD_LEN]);
                cword = CWORD_SENTINEL;
            }

            let hash = hash3(&input[src..]);
            let candidate = table[hash].replace(src);

            let usable = |o: usize| {
                src - o > 2
                    || (src == o + 1
                        && literals >= 3
                        && src > 3
                        && input[src - 3..src + 3].iter().all(|&b| b == input[src]))
            };

            match candidate {
                Some(o) if usable(o) && input[o..o + 3] == input[src..src + 3] => {
                    let remaining = (size - src - UNCOMPRESSED_END).min(MAX_MATCH);
                    let mut len = 3;
                    while len < remaining && input[o + len] == input[src + len] {
                        len += 1;
                    }

                    let token = (hash as u32) << 4;
                    if len < SHORT_MATCH {
                        dst.extend_from_slice(&((len as u32 - 2) | token).to_le_bytes()[..2]);
                    } else {
                        dst.extend_from_slice(&((len as u32) << 16 | token).to_le_bytes()[..3]);
                    }
                    cword = (cword >> 1) | CWORD_SENTINEL;
                    src += len;
                    literals = 0;
                }
                _ => {
                    dst.push(input[src]);
                    src += 1;
                    cword >>= 1;
                    literals += 1;
                }
            }
        }
    }

    while src < size {
        if cword & 1 == 1 {
            write_cword(&mut dst, cword_at, cword);
            cword_at = dst.len();
            dst.extend_from_slice(&[0; CWORD_LEN]);
            cword = CWORD_SENTINEL;
        }
        dst.push(input[src]);
        src += 1;
        cword >>= 1;
    }

    while cword & 1 != 1 {
        cword >>= 1;
    }
    write_cword(&mut dst, cword_at, cword);

    if dst.len() < MIN_BODY {
        dst.resize(MIN_BODY, 0);
    }
    Some(dst)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{compress, decompress, PacketHeader};
    use crate::error::CodecError;

    #[test]
    fn stored_packet() -> Result<(), CodecError> {
        #[rustfmt::skip]
        let data = [
            0x44, 0x08, 0x05,             // stored, level 1, short header
            b'h', b'e', b'l', b'l', b'o',
        ];

        assert_eq!(decompress(&data, 5)?, b"hello");
        Ok(())
    }

    #[test]
    fn short_literal_packet() -> Result<(), CodecError> {
        #[rustfmt::skip]
        let data = [
            0x45, 0x0c, 0x02,             // compressed, level 1, short header
            0x00, 0x00, 0x00, 0x80,       // control word: everything is a literal
            b'o', b'k',
            0x00, 0x00, 0x00,             // body padding
        ];

        assert_eq!(decompress(&data, 2)?, b"ok");
        Ok(())
    }

    #[test]
    fn encoder_output_layout() -> Result<(), CodecError> {
        let packed = compress(b"ok");
        assert_eq!(
            packed,
            [0x45, 0x0c, 0x02, 0x00, 0x00, 0x00, 0x80, b'o', b'k', 0x00, 0x00, 0x00]
        );

        let header = PacketHeader::parse(&packed)?;
        assert!(header.compressed);
        assert_eq!(header.level, 1);
        assert_eq!(header.packet_len, packed.len());
        Ok(())
    }

    #[test]
    fn long_header_used_for_large_blocks() -> Result<(), CodecError> {
        let data = vec![7u8; 300];
        let packed = compress(&data);
        assert_eq!(packed[0] & 0b10, 0b10);

        let header = PacketHeader::parse(&packed)?;
        assert_eq!(header.decompressed, 300);
        assert!(packed.len() < 100);
        assert_eq!(decompress(&packed, 300)?, data);
        Ok(())
    }

    #[test]
    fn incompressible_block_is_stored() -> Result<(), CodecError> {
        let mut state = 0x1234_5678u32;
        let data: Vec<u8> = (0..4096)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
                (state >> 16) as u8
            })
            .collect();

        let packed = compress(&data);
        assert_eq!(packed[0] & 1, 0);
        assert_eq!(packed.len(), data.len() + 9);
        assert_eq!(decompress(&packed, data.len())?, data);
        Ok(())
    }

    #[test]
    fn level3_back_reference() -> Result<(), CodecError> {
        #[rustfmt::skip]
        let data = [
            0x4d, 0x13, 0x0e,             // compressed, level 3, short header
            0x02, 0x00, 0x00, 0x80,       // control word: second token is a match
            b'a',
            0x04,                         // offset 1, length 3
            b'b', b'c', b'd', b'e', b'f', b'g', b'h', b'i', b'j', b'k',
        ];

        assert_eq!(decompress(&data, 14)?, b"aaaabcdefghijk");
        Ok(())
    }

    #[test]
    fn level2_rejected() {
        let data = [0x49, 0x0c, 0x02, 0, 0, 0, 0x80, 1, 2, 0, 0, 0];
        assert!(matches!(
            decompress(&data, 2),
            Err(CodecError::UnsupportedLevel(2))
        ));
    }

    #[test]
    fn capacity_is_only_a_limit() -> Result<(), CodecError> {
        let data = b"station station station station station".to_vec();
        assert_eq!(decompress(&compress(&data), usize::MAX)?, data);
        Ok(())
    }

    #[test]
    fn capacity_is_enforced() {
        let packed = compress(b"hello world");
        assert!(matches!(decompress(&packed, 4), Err(CodecError::Overrun)));
    }

    #[test]
    fn truncated_packet() {
        let packed = compress(&[1u8; 500]);
        assert!(matches!(
            decompress(&packed[..packed.len() - 1], 500),
            Err(CodecError::TruncatedPacket { .. })
        ));
        assert!(matches!(
            decompress(&packed[..4], 500),
            Err(CodecError::TruncatedHeader)
        ));
    }
}
