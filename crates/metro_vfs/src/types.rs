//! Base types shared by every archive container.

use binrw::{BinRead, BinReaderExt, BinWrite, BinWriterExt, NullString};
use crc::{Crc, CRC_32_ISO_HDLC};
use std::{
    fmt,
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};
use tracing::instrument;

use crate::{
    compression::Codec,
    error::{Error, FormatError, Result},
};

/// Checksum used for UPK payloads, VFI record headers and name hashes
pub(crate) const CHECKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Registry identifier
///
/// Every VFX and VFI registry carries one of these after its version. It identifies the build
/// of the game that produced the archive and, for *Last Light*, decides how the rest of the file
/// is laid out.
#[derive(BinRead, BinWrite, Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
#[brw(little)]
pub struct Guid {
    pub a: u32,
    pub b: u16,
    pub c: u16,
    pub d: u16,
    pub e: [u8; 6],
}

impl Guid {
    pub const LAST_LIGHT_STEAM: Guid =
        Guid::new(0xE4727F4A, 0xF56A, 0x4998, 0x2E84, [0xFC, 0xD2, 0x75, 0x22, 0xEB, 0x3D]);
    pub const LAST_LIGHT_STEAM_LINUX: Guid =
        Guid::new(0xB03B72E1, 0x7659, 0x4D74, 0x618C, [0xBF, 0x1F, 0xBD, 0x55, 0x22, 0x1B]);
    pub const LAST_LIGHT_STEAM_MACOS: Guid =
        Guid::new(0x3541E232, 0x1A41, 0x4B20, 0xAC94, [0x86, 0x43, 0x31, 0xC2, 0x4C, 0x41]);
    pub const LAST_LIGHT_XBOX360: Guid =
        Guid::new(0x96B68062, 0x41B8, 0x41EE, 0xEAB2, [0x90, 0xED, 0xF0, 0x78, 0xF2, 0x22]);
    pub const LAST_LIGHT_XBOX360_OCT18_2012: Guid =
        Guid::new(0x292A1047, 0x06A4, 0x4423, 0xE980, [0xB3, 0xEA, 0x49, 0x32, 0xB0, 0x31]);
    pub const LAST_LIGHT_XBOX360_DEC03_2012: Guid =
        Guid::new(0xA328D21D, 0x8D8C, 0x477D, 0x4AA8, [0xFD, 0xDA, 0x86, 0x59, 0xEF, 0x62]);

    pub const REDUX_2033_PC: Guid =
        Guid::new(0x3CC39580, 0x3AD4, 0x4007, 0xEDBF, [0xC1, 0xB5, 0xE4, 0x4D, 0x20, 0xCB]);
    pub const REDUX_LAST_LIGHT_PC: Guid =
        Guid::new(0xF48EB978, 0xAF7E, 0x42B0, 0x37BF, [0xD2, 0x09, 0x7A, 0x92, 0xAF, 0x9A]);
    pub const REDUX_2033_SWITCH: Guid =
        Guid::new(0xEA0296FA, 0xB4B1, 0x4C31, 0x7580, [0xC2, 0x03, 0xF0, 0xFC, 0xBB, 0x74]);
    pub const REDUX_LAST_LIGHT_SWITCH: Guid =
        Guid::new(0xE983FCA4, 0x3EC9, 0x4BBD, 0x7FBE, [0x56, 0xA9, 0x53, 0x10, 0xD0, 0xB5]);

    pub const ARKTIKA1_1: Guid =
        Guid::new(0xA4B0F5D3, 0x875C, 0x481C, 0x1B9C, [0x2D, 0xB9, 0xC7, 0xC4, 0x0B, 0xD5]);
    pub const ARKTIKA1_2: Guid =
        Guid::new(0xE113CED0, 0x8B8C, 0x4E59, 0x7480, [0x1B, 0x32, 0x0F, 0x13, 0xD2, 0x2B]);

    pub const EXODUS: Guid =
        Guid::new(0x9FE25B12, 0xF276, 0x40F4, 0xEAB8, [0x0F, 0xE1, 0xA4, 0xC6, 0x9E, 0x7A]);

    pub const fn new(a: u32, b: u16, c: u16, d: u16, e: [u8; 6]) -> Self {
        Self { a, b, c, d, e }
    }

    /// Whether this identifies one of the *Last Light* builds
    pub fn is_last_light(&self) -> bool {
        KNOWN_REGISTRIES
            .iter()
            .any(|known| known.guid == *self && known.title == Title::LastLight)
    }

    /// Known build matching this identifier
    pub fn known(&self) -> Option<&'static KnownRegistry> {
        KNOWN_REGISTRIES.iter().find(|known| known.guid == *self)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}-{:04x}-{:04x}-{:04x}-", self.a, self.b, self.c, self.d)?;
        self.e.iter().try_for_each(|b| write!(f, "{b:02x}"))
    }
}

/// Game an archive belongs to
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Title {
    Metro2033,
    LastLight,
    Metro2033Redux,
    LastLightRedux,
    Arktika1,
    Exodus,
    Unknown,
}

impl Title {
    /// Best effort classification of a VFX registry
    ///
    /// Identifiers that are not in [`KNOWN_REGISTRIES`] fall back on the registry version.
    pub fn classify(version: u32, guid: &Guid) -> Self {
        match guid.known() {
            Some(known) => known.title,
            None => match version {
                2 => Title::Arktika1,
                3 => Title::Exodus,
                _ => Title::Unknown,
            },
        }
    }
}

impl fmt::Display for Title {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Title::Metro2033 => "Metro 2033",
            Title::LastLight => "Metro: Last Light",
            Title::Metro2033Redux => "Metro 2033 Redux",
            Title::LastLightRedux => "Metro: Last Light Redux",
            Title::Arktika1 => "Arktika.1",
            Title::Exodus => "Metro Exodus",
            Title::Unknown => "unknown",
        })
    }
}

/// A registry identifier seen in a shipped build
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KnownRegistry {
    pub guid: Guid,
    pub title: Title,
    pub build: &'static str,
}

pub const KNOWN_REGISTRIES: [KnownRegistry; 13] = [
    KnownRegistry { guid: Guid::LAST_LIGHT_STEAM, title: Title::LastLight, build: "Steam" },
    KnownRegistry { guid: Guid::LAST_LIGHT_STEAM_LINUX, title: Title::LastLight, build: "Steam Linux" },
    KnownRegistry { guid: Guid::LAST_LIGHT_STEAM_MACOS, title: Title::LastLight, build: "Steam macOS" },
    KnownRegistry { guid: Guid::LAST_LIGHT_XBOX360, title: Title::LastLight, build: "Xbox 360" },
    KnownRegistry { guid: Guid::LAST_LIGHT_XBOX360_OCT18_2012, title: Title::LastLight, build: "Xbox 360 (Oct 18 2012)" },
    KnownRegistry { guid: Guid::LAST_LIGHT_XBOX360_DEC03_2012, title: Title::LastLight, build: "Xbox 360 (Dec 03 2012)" },
    KnownRegistry { guid: Guid::REDUX_2033_PC, title: Title::Metro2033Redux, build: "PC" },
    KnownRegistry { guid: Guid::REDUX_LAST_LIGHT_PC, title: Title::LastLightRedux, build: "PC" },
    KnownRegistry { guid: Guid::REDUX_2033_SWITCH, title: Title::Metro2033Redux, build: "Switch" },
    KnownRegistry { guid: Guid::REDUX_LAST_LIGHT_SWITCH, title: Title::LastLightRedux, build: "Switch" },
    KnownRegistry { guid: Guid::ARKTIKA1_1, title: Title::Arktika1, build: "PC" },
    KnownRegistry { guid: Guid::ARKTIKA1_2, title: Title::Arktika1, build: "PC (update)" },
    KnownRegistry { guid: Guid::EXODUS, title: Title::Exodus, build: "PC" },
];

/// How a VFX registry is laid out, derived from its version and identifier
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Codec of compressed payloads
    pub codec: Codec,

    /// Record flags are stored shifted left by one bit
    pub shifted_flags: bool,

    /// Packages list the levels they hold before their size
    pub package_levels: bool,

    /// Duplicates are stored as named records without a base index
    pub named_duplicates: bool,

    /// The header carries a content version string
    pub content_version: bool,
}

impl Layout {
    pub fn new(version: u32, guid: &Guid) -> Self {
        let last_light = guid.is_last_light();
        Self {
            codec: if last_light { Codec::Legacy } else { Codec::Lz4 },
            shifted_flags: last_light,
            package_levels: !last_light,
            named_duplicates: *guid == Guid::LAST_LIGHT_XBOX360_OCT18_2012,
            content_version: version >= 3,
        }
    }
}

/// A blob holding the payloads of a set of files
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Package {
    /// File name, relative to the registry
    pub name: String,

    /// Levels whose resources live in this package
    pub levels: Vec<String>,

    /// Size of the blob as recorded in the registry
    pub size: u32,
}

/// Where the payload of a file lives
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FileLocation {
    /// Index into the package list of the owning archive
    pub package: usize,
    pub offset: u32,
    pub uncompressed: u32,
    pub compressed: u32,
}

impl FileLocation {
    /// Whether the payload is stored without compression
    pub fn is_stored(&self) -> bool {
        self.compressed == self.uncompressed
    }
}

/// Read the payload described by `location` from its package inside `dir`
///
/// The returned buffer always holds exactly `location.uncompressed` bytes.
#[instrument(skip(dir, package), fields(package = %package.name), err)]
pub(crate) fn read_payload(
    dir: &Path,
    package: &Package,
    location: &FileLocation,
    codec: Codec,
) -> Result<Vec<u8>> {
    let mut file = File::open(dir.join(&package.name))?;

    let available = file.metadata()?.len();
    let end = location.offset as u64 + location.compressed as u64;
    if end > available {
        return Err(Error::Truncated {
            expected: end,
            actual: available,
        });
    }

    file.seek(SeekFrom::Start(location.offset as u64))?;
    let mut raw = vec![0u8; location.compressed as usize];
    file.read_exact(&mut raw)?;

    if location.is_stored() {
        return Ok(raw);
    }

    let data = codec.decompress(&raw, location.uncompressed as usize)?;
    if data.len() != location.uncompressed as usize {
        return Err(Error::DecompressionMismatch {
            expected: location.uncompressed as u64,
            actual: data.len() as u64,
        });
    }
    Ok(data)
}

pub(crate) fn read_string_z<R: Read + Seek>(reader: &mut R) -> Result<String> {
    let raw: NullString = reader.read_le()?;
    Ok(String::from_utf8_lossy(&raw.0).into_owned())
}

pub(crate) fn write_string_z<W: Write + Seek>(writer: &mut W, value: &str) -> Result<()> {
    writer.write_le(&NullString::from(value))?;
    Ok(())
}

/// Read `len` bytes and undo the XOR `mask` applied to them
pub(crate) fn read_masked<R: Read>(reader: &mut R, len: usize, mask: u8) -> Result<String> {
    let mut raw = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut raw)?;
    if raw.len() != len {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
    }
    raw.iter_mut().for_each(|b| *b ^= mask);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

pub(crate) fn masked(value: &str, mask: u8) -> Vec<u8> {
    value.bytes().map(|b| b ^ mask).collect()
}

/// Read a record name: a `u16` header holding the length and the mask, then the masked bytes
/// and a terminator
pub(crate) fn read_record_name<R: Read + Seek>(reader: &mut R) -> Result<String> {
    let header: u16 = reader.read_le()?;
    let len = (header & 0xFF) as usize;
    let mask = (header >> 8) as u8;

    let name = read_masked(reader, len.saturating_sub(1), mask)?;
    let _terminator: u8 = reader.read_le()?;
    Ok(name)
}

/// Write a record name the way [`read_record_name`] expects it
///
/// An empty name is always written as `01 00 00`.
pub(crate) fn write_record_name<W: Write + Seek>(writer: &mut W, name: &str, mask: u8) -> Result<()> {
    if name.is_empty() {
        writer.write_all(&[1, 0, 0])?;
        return Ok(());
    }

    let len = name.len() + 1;
    if len > u8::MAX as usize {
        return Err(FormatError::NameTooLong(name.len()).into());
    }

    writer.write_le(&((mask as u16) << 8 | len as u16))?;
    writer.write_all(&masked(name, mask))?;
    writer.write_all(&[0])?;
    Ok(())
}
