//! Owned, windowed views over decoded payloads

use std::{
    fmt,
    io::{self, BufRead, Read, Seek, SeekFrom},
    sync::Arc,
};

/// A cursor over a window of a shared, immutable buffer
///
/// Every extraction hands out a new stream. Cloning a stream, or taking a [`ByteStream::window`]
/// or [`ByteStream::substream`] of it, shares the underlying buffer; [`ByteStream::detach`]
/// copies the visible window out into a buffer of its own.
///
/// Positions are relative to the start of the window. The typed little endian readers of
/// [`byteorder::ReadBytesExt`] and [`binrw::BinReaderExt`] work on it directly.
#[derive(Clone)]
pub struct ByteStream {
    data: Arc<[u8]>,
    start: usize,
    end: usize,
    cursor: usize,
    name: Option<Arc<str>>,
}

impl ByteStream {
    pub fn new(data: Vec<u8>) -> Self {
        let end = data.len();
        Self {
            data: Arc::from(data),
            start: 0,
            end,
            cursor: 0,
            name: None,
        }
    }

    /// A stream holding nothing; what failed extractions return
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Attach a name, usually the path the stream was opened from
    pub fn with_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether the stream holds any data at all
    pub fn is_good(&self) -> bool {
        !self.data.is_empty()
    }

    /// Length of the window
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> usize {
        self.cursor - self.start
    }

    /// Move the cursor, clamped to the end of the window
    pub fn set_position(&mut self, position: usize) {
        self.cursor = self.start + position.min(self.len());
    }

    pub fn skip(&mut self, count: usize) {
        self.set_position(self.position().saturating_add(count));
    }

    pub fn remaining(&self) -> usize {
        self.end - self.cursor
    }

    pub fn ended(&self) -> bool {
        self.cursor >= self.end
    }

    /// The whole window
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// The part of the window past the cursor
    pub fn remaining_slice(&self) -> &[u8] {
        &self.data[self.cursor..self.end]
    }

    /// A view of `length` bytes at `offset` into this window
    ///
    /// Both values are clamped to the window, so the result is never larger than it.
    pub fn window(&self, offset: usize, length: usize) -> ByteStream {
        let offset = offset.min(self.len());
        let length = length.min(self.len() - offset);
        let start = self.start + offset;

        Self {
            data: Arc::clone(&self.data),
            start,
            end: start + length,
            cursor: start,
            name: self.name.clone(),
        }
    }

    /// A view of the next `length` bytes from the cursor
    ///
    /// The cursor of this stream does not move.
    pub fn substream(&self, length: usize) -> ByteStream {
        self.window(self.position(), length)
    }

    /// Copy the window into a buffer that is not shared with any other stream
    pub fn detach(&self) -> ByteStream {
        let mut detached = Self::new(self.as_slice().to_vec());
        detached.cursor = self.position();
        detached.name = self.name.clone();
        detached
    }

    /// Read a zero terminated string
    ///
    /// A missing terminator consumes the rest of the window.
    pub fn read_string_z(&mut self) -> String {
        let rest = self.remaining_slice();
        let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let value = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.skip(len + 1);
        value
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl Default for ByteStream {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("position", &self.position())
            .finish()
    }
}

impl From<Vec<u8>> for ByteStream {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

impl AsRef<[u8]> for ByteStream {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Read for ByteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.remaining_slice().read(buf)?;
        self.cursor += n;
        Ok(n)
    }
}

impl BufRead for ByteStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        Ok(self.remaining_slice())
    }

    fn consume(&mut self, amt: usize) {
        self.skip(amt);
    }
}

impl Seek for ByteStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n as i64),
            SeekFrom::End(n) => (self.len() as i64).checked_add(n),
            SeekFrom::Current(n) => (self.position() as i64).checked_add(n),
        };

        match target {
            Some(target) if target >= 0 => {
                self.set_position(target as usize);
                Ok(self.position() as u64)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the stream",
            )),
        }
    }
}
