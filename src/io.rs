//! Primitive byte-level contracts: the `Source`/`Sink` collaborators the
//! writer and indexed reader sit on top of, and small counting/CRC wrappers
//! used to implement the deferred-length-patching pattern (spec §4.1) and
//! the streaming CRCs (spec §4.2).

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use crc32fast::Hasher;

/// A random-access byte source, as read by the indexed reader.
///
/// Implementations may return transient buffers: the core copies anything
/// it needs to retain past the next call.
pub trait Source {
    /// Total size of the underlying data, in bytes.
    fn size(&self) -> u64;
    /// Read `len` bytes starting at `offset`.
    fn read(&self, offset: u64, len: u64) -> McapIoResult<Vec<u8>>;
}

/// Error type for the byte-level `Source`/`Sink` contracts.
pub type McapIoResult<T> = io::Result<T>;

/// A plain, append-only sink, as written by the writer.
pub trait Sink: Write {
    /// Current write offset.
    fn position(&mut self) -> McapIoResult<u64>;
}

/// A sink that additionally supports seeking and truncation, required for
/// append mode (spec §4.5.7).
pub trait SeekableSink: Sink + Seek {
    /// Truncate the underlying storage to the current position.
    fn truncate(&mut self) -> McapIoResult<()>;
}

impl<T: Write + Seek> Sink for T {
    fn position(&mut self) -> McapIoResult<u64> {
        self.stream_position()
    }
}

/// Blanket impl: any in-memory or file-backed `Write + Seek` whose backing
/// store can be truncated (we only need this for `Cursor<Vec<u8>>` and
/// `std::fs::File` in practice) gets `SeekableSink` via a narrower impl
/// below, since `Seek` alone gives no truncate facility.
pub struct FileSink<'a>(pub &'a mut std::fs::File);

impl Write for FileSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Seek for FileSink<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}

impl SeekableSink for FileSink<'_> {
    fn truncate(&mut self) -> io::Result<()> {
        let len = self.0.stream_position()?;
        self.0.set_len(len)
    }
}

/// A `Source` over an in-memory byte slice.
impl Source for &[u8] {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn read(&self, offset: u64, len: u64) -> McapIoResult<Vec<u8>> {
        let start = offset as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|&e| e <= self.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of source"))?;
        Ok(self[start..end].to_vec())
    }
}

impl Source for Vec<u8> {
    fn size(&self) -> u64 {
        self.as_slice().size()
    }

    fn read(&self, offset: u64, len: u64) -> McapIoResult<Vec<u8>> {
        self.as_slice().read(offset, len)
    }
}

/// Writes `op_and_len` for a record whose content length is already known.
pub(crate) fn op_and_len<W: Write>(w: &mut W, op: u8, len: u64) -> io::Result<()> {
    w.write_u8(op)?;
    w.write_u64::<LE>(len)?;
    Ok(())
}

/// Wraps a reader, tracking total bytes read and maintaining a running CRC
/// of everything that passes through it.
pub(crate) struct CountingCrcReader<R> {
    inner: R,
    position: u64,
    hasher: Hasher,
}

impl<R: Read> CountingCrcReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            position: 0,
            hasher: Hasher::new(),
        }
    }

    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    pub(crate) fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

impl<R: Read> Read for CountingCrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

/// Wraps a writer, tracking total bytes written and maintaining a running
/// CRC of everything that passes through it. Used both for the per-chunk
/// uncompressed CRC and the streaming data-section CRC (spec §4.2, §9).
pub(crate) struct CountingCrcWriter<W> {
    inner: W,
    position: u64,
    hasher: Hasher,
}

impl<W: Write> CountingCrcWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            position: 0,
            hasher: Hasher::new(),
        }
    }

    /// Resume an existing CRC accumulation, for append mode. `position`
    /// should be the byte count already hashed; `crc` is the *finalized*
    /// (XOR'd) CRC of that prior data, which we invert back to the raw
    /// running state before continuing (spec §9).
    pub(crate) fn resume(inner: W, position: u64, crc: u32) -> Self {
        Self {
            inner,
            position,
            hasher: Hasher::new_with_initial(crc ^ 0xFFFF_FFFF),
        }
    }

    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    pub(crate) fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub(crate) fn finalize(self) -> (W, u32) {
        (self.inner, self.hasher.finalize())
    }
}

impl<W: Write> Write for CountingCrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write + Seek> Seek for CountingCrcWriter<W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_source_reads_in_bounds() {
        let data: &[u8] = &[1, 2, 3, 4, 5];
        assert_eq!(data.read(1, 3).unwrap(), vec![2, 3, 4]);
        assert!(data.read(3, 10).is_err());
    }

    #[test]
    fn counting_crc_writer_tracks_position() {
        let mut w = CountingCrcWriter::new(Vec::new());
        w.write_all(b"hello").unwrap();
        assert_eq!(w.position(), 5);
        let (buf, _crc) = w.finalize();
        assert_eq!(buf, b"hello");
    }
}
