//! Growable byte buffer with seek-back, used for deferred length patching
//! when the underlying sink cannot be seeked directly (spec §4.3, §9).

use std::io::{self, Read, Seek, SeekFrom, Write};

/// A contiguous, growable byte buffer supporting random-access writes and a
/// zero-copy borrowed view for CRC computation.
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    data: Vec<u8>,
    cursor: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn length(&self) -> usize {
        self.data.len()
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.cursor = 0;
    }

    /// A zero-copy view of `[offset, offset+len)`.
    pub fn buffer_view(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let end = self.cursor + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.cursor..end].copy_from_slice(buf);
        self.cursor = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for Buffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.data.len().saturating_sub(self.cursor);
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }
}

impl Seek for Buffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_cursor = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => self.data.len() as i64 + n,
            SeekFrom::Current(n) => self.cursor as i64 + n,
        };
        if new_cursor < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of buffer",
            ));
        }
        self.cursor = new_cursor as usize;
        Ok(self.cursor as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_seek_back_and_patch() {
        let mut buf = Buffer::new();
        buf.write_all(&[0u8; 4]).unwrap();
        buf.write_all(b"hello").unwrap();
        buf.seek(SeekFrom::Start(0)).unwrap();
        buf.write_all(&5u32.to_le_bytes()).unwrap();
        assert_eq!(buf.buffer_view(4, 5), b"hello");
    }
}
