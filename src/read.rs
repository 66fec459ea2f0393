//! Stream reader (spec §2, "Stream reader"): a forward-only consumer that
//! decodes records as bytes arrive, with no index or random access.

use std::{borrow::Cow, collections::BTreeMap, io::Cursor};

use binrw::{BinRead, BinWrite};
use byteorder::{ReadBytesExt, LE};

use crate::{
    records::{self, op, Record},
    McapError, McapResult, MAGIC,
};

/// Decodes one length-framed record from `content`, which must be exactly
/// `content_length` bytes (spec §4.2: decode must land exactly at the end
/// of the bounded view).
pub(crate) fn parse_record(opcode: u8, content: &[u8]) -> McapResult<Record<'static>> {
    let mut cur = Cursor::new(content);
    let record = match opcode {
        op::HEADER => Record::Header(records::Header::read_le(&mut cur)?),
        op::FOOTER => Record::Footer(records::Footer::read_le(&mut cur)?),
        op::SCHEMA => {
            let header = records::SchemaHeader::read_le(&mut cur)?;
            let len = cur.read_u32::<LE>()?;
            let start = cur.position() as usize;
            let available = (content.len() - start) as u32;
            if len > available {
                return Err(McapError::BadSchemaLength {
                    header: len,
                    available,
                });
            }
            let data = content[start..start + len as usize].to_vec();
            return Ok(Record::Schema {
                header,
                data: Cow::Owned(data),
            });
        }
        op::CHANNEL => Record::Channel(records::Channel::read_le(&mut cur)?),
        op::MESSAGE => {
            let header = records::MessageHeader::read_le(&mut cur)?;
            let start = cur.position() as usize;
            return Ok(Record::Message {
                header,
                data: Cow::Owned(content[start..].to_vec()),
            });
        }
        op::CHUNK => {
            let header = records::ChunkHeader::read_le(&mut cur)?;
            let start = cur.position() as usize;
            let available = (content.len() - start) as u64;
            if header.compressed_size > available {
                return Err(McapError::BadChunkLength {
                    header: header.compressed_size,
                    available,
                });
            }
            let end = start + header.compressed_size as usize;
            return Ok(Record::Chunk {
                header,
                data: Cow::Owned(content[start..end].to_vec()),
            });
        }
        op::MESSAGE_INDEX => Record::MessageIndex(records::MessageIndex::read_le(&mut cur)?),
        op::CHUNK_INDEX => Record::ChunkIndex(records::ChunkIndex::read_le(&mut cur)?),
        op::ATTACHMENT => {
            let header = records::AttachmentHeader::read_le(&mut cur)?;
            let data_len = cur.read_u64::<LE>()?;
            let start = cur.position() as usize;
            let available = (content.len() - start) as u64;
            if data_len.checked_add(4).map_or(true, |needed| needed > available) {
                return Err(McapError::BadAttachmentLength {
                    header: data_len,
                    available,
                });
            }
            let end = start + data_len as usize;
            let data = content[start..end].to_vec();
            let crc = (&content[end..end + 4]).read_u32::<LE>()?;
            return Ok(Record::Attachment {
                header,
                data: Cow::Owned(data),
                crc,
            });
        }
        op::ATTACHMENT_INDEX => {
            Record::AttachmentIndex(records::AttachmentIndex::read_le(&mut cur)?)
        }
        op::STATISTICS => Record::Statistics(records::Statistics::read_le(&mut cur)?),
        op::METADATA => Record::Metadata(records::Metadata::read_le(&mut cur)?),
        op::METADATA_INDEX => Record::MetadataIndex(records::MetadataIndex::read_le(&mut cur)?),
        op::SUMMARY_OFFSET => Record::SummaryOffset(records::SummaryOffset::read_le(&mut cur)?),
        op::DATA_END => Record::DataEnd(records::DataEnd::read_le(&mut cur)?),
        other => {
            log::debug!("skipping unknown opcode 0x{other:02X} ({} bytes)", content.len());
            Record::Unknown {
                opcode: other,
                data: Cow::Owned(content.to_vec()),
            }
        }
    };
    Ok(record)
}

/// Forward-only reader over an in-memory byte buffer, yielding top-level
/// records in physical order. Chunk payloads are returned undecoded;
/// callers that want the messages inside a chunk should decompress and feed
/// the payload back through [`LinearReader::sans_magic`].
pub struct LinearReader<'a> {
    buf: &'a [u8],
    pos: usize,
    in_chunk: bool,
}

impl<'a> LinearReader<'a> {
    /// Construct a reader over a complete MCAP file, including magic bytes.
    pub fn new(buf: &'a [u8]) -> McapResult<Self> {
        if buf.len() < MAGIC.len() || &buf[..MAGIC.len()] != MAGIC {
            return Err(McapError::BadMagic);
        }
        Ok(Self {
            buf: &buf[MAGIC.len()..],
            pos: 0,
            in_chunk: false,
        })
    }

    /// Construct a reader over a region that does not begin with magic
    /// bytes (e.g. a chunk payload, or a summary-section slice).
    pub fn sans_magic(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            in_chunk: false,
        }
    }

    fn next_record(&mut self) -> Option<McapResult<Record<'static>>> {
        if self.pos >= self.buf.len() {
            return None;
        }
        if self.pos + 9 > self.buf.len() {
            return Some(Err(McapError::UnexpectedEof));
        }
        let opcode = self.buf[self.pos];
        let len =
            u64::from_le_bytes(self.buf[self.pos + 1..self.pos + 9].try_into().unwrap());
        let content_start = self.pos + 9;
        let content_end = match content_start.checked_add(len as usize) {
            Some(end) if end <= self.buf.len() => end,
            _ => return Some(Err(McapError::UnexpectedEof)),
        };
        self.pos = content_end;

        if self.in_chunk && !is_data_section_opcode(opcode) {
            return Some(Err(McapError::UnknownOpcodeInChunk(opcode)));
        }

        Some(parse_record(opcode, &self.buf[content_start..content_end]))
    }
}

fn is_data_section_opcode(opcode: u8) -> bool {
    matches!(opcode, op::SCHEMA | op::CHANNEL | op::MESSAGE)
}

impl<'a> Iterator for LinearReader<'a> {
    type Item = McapResult<Record<'static>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record()
    }
}

/// The last `1 + 8 + 8 + 8 + 4` bytes before the trailing magic: the
/// Footer's opcode+length prefix and its fixed 20-byte content (spec §4.6.1).
pub const FOOTER_RECORD_LEN: usize = 1 + 8 + 20;

/// Reads the trailing Footer record of a complete file.
pub fn footer(buf: &[u8]) -> McapResult<records::Footer> {
    if buf.len() < FOOTER_RECORD_LEN + MAGIC.len() {
        return Err(McapError::TooSmall);
    }
    let trailing_magic = &buf[buf.len() - MAGIC.len()..];
    if trailing_magic != MAGIC {
        return Err(McapError::BadMagic);
    }
    let record_start = buf.len() - MAGIC.len() - FOOTER_RECORD_LEN;
    let opcode = buf[record_start];
    if opcode != op::FOOTER {
        return Err(McapError::BadFooterLength);
    }
    let len = u64::from_le_bytes(
        buf[record_start + 1..record_start + 9].try_into().unwrap(),
    );
    if len != 20 {
        return Err(McapError::BadFooterLength);
    }
    let content = &buf[record_start + 9..record_start + 9 + 20];
    let mut cur = Cursor::new(content);
    Ok(records::Footer::read_le(&mut cur)?)
}

/// Reads an attachment given its index entry.
pub fn attachment(buf: &[u8], index: &records::AttachmentIndex) -> McapResult<crate::Attachment> {
    let region = &buf[index.offset as usize..(index.offset + index.length) as usize];
    let opcode = region[0];
    let len = u64::from_le_bytes(region[1..9].try_into().unwrap());
    let record = parse_record(opcode, &region[9..9 + len as usize])?;
    match record {
        Record::Attachment { header, data, .. } => Ok(crate::Attachment {
            log_time: header.log_time,
            create_time: header.create_time,
            name: header.name,
            media_type: header.media_type,
            data,
        }),
        _ => Err(McapError::BadFooterLength),
    }
}

/// Reads a metadata record given its index entry.
pub fn metadata(buf: &[u8], index: &records::MetadataIndex) -> McapResult<records::Metadata> {
    let region = &buf[index.offset as usize..(index.offset + index.length) as usize];
    let opcode = region[0];
    let len = u64::from_le_bytes(region[1..9].try_into().unwrap());
    let record = parse_record(opcode, &region[9..9 + len as usize])?;
    match record {
        Record::Metadata(m) => Ok(m),
        _ => Err(McapError::BadFooterLength),
    }
}

/// Decompresses a chunk's payload using the registered decompressor for its
/// `compression` name (spec §6, "Decompression registry").
pub(crate) fn decompress_chunk(compression: &str, compressed: &[u8], uncompressed_size: u64) -> McapResult<Vec<u8>> {
    match compression {
        "" => Ok(compressed.to_vec()),
        #[cfg(feature = "zstd")]
        "zstd" => {
            let mut out = Vec::with_capacity(uncompressed_size as usize);
            zstd::stream::copy_decode(compressed, &mut out)?;
            Ok(out)
        }
        #[cfg(feature = "lz4")]
        "lz4" => {
            let mut decoder = lz4::Decoder::new(compressed)?;
            let mut out = Vec::with_capacity(uncompressed_size as usize);
            std::io::Read::read_to_end(&mut decoder, &mut out)?;
            Ok(out)
        }
        other => Err(McapError::UnsupportedCompression(other.to_string())),
    }
}

#[allow(dead_code)]
pub(crate) type ChannelCounts = BTreeMap<u16, u64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let buf = [0u8; 16];
        assert!(matches!(LinearReader::new(&buf), Err(McapError::BadMagic)));
    }

    #[test]
    fn empty_stream_after_magic_yields_nothing() {
        let reader = LinearReader::new(MAGIC).unwrap();
        assert_eq!(reader.count(), 0);
    }

    #[test]
    fn schema_with_oversized_declared_length_errors_instead_of_panicking() {
        let header = records::SchemaHeader {
            id: 1,
            name: "s".into(),
            encoding: "e".into(),
        };
        let mut content = Cursor::new(Vec::new());
        header.write_le(&mut content).unwrap();
        byteorder::WriteBytesExt::write_u32::<LE>(&mut content, 999).unwrap();
        content.get_mut().extend_from_slice(b"short");

        let err = parse_record(op::SCHEMA, content.get_ref()).unwrap_err();
        assert!(matches!(
            err,
            McapError::BadSchemaLength {
                header: 999,
                available: 5
            }
        ));
    }

    #[test]
    fn attachment_with_oversized_declared_length_errors_instead_of_panicking() {
        let header = records::AttachmentHeader {
            log_time: 0,
            create_time: 0,
            name: "a".into(),
            media_type: "m".into(),
        };
        let mut content = Cursor::new(Vec::new());
        header.write_le(&mut content).unwrap();
        byteorder::WriteBytesExt::write_u64::<LE>(&mut content, 999).unwrap();
        content.get_mut().extend_from_slice(b"short");

        let err = parse_record(op::ATTACHMENT, content.get_ref()).unwrap_err();
        assert!(matches!(
            err,
            McapError::BadAttachmentLength {
                header: 999,
                available: 5
            }
        ));
    }
}
