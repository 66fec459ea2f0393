//! Per-opcode record definitions (spec §4.2, §6): bit-exact binrw structs
//! for every MCAP record, plus the length-prefixed string/bytes/map parsers
//! and writers shared across them.

use std::{borrow::Cow, collections::BTreeMap, io::SeekFrom};

use binrw::{binrw, BinRead, BinWrite};

/// Record opcodes (spec §3).
pub mod op {
    pub const HEADER: u8 = 0x01;
    pub const FOOTER: u8 = 0x02;
    pub const SCHEMA: u8 = 0x03;
    pub const CHANNEL: u8 = 0x04;
    pub const MESSAGE: u8 = 0x05;
    pub const CHUNK: u8 = 0x06;
    pub const MESSAGE_INDEX: u8 = 0x07;
    pub const CHUNK_INDEX: u8 = 0x08;
    pub const ATTACHMENT: u8 = 0x09;
    pub const ATTACHMENT_INDEX: u8 = 0x0A;
    pub const STATISTICS: u8 = 0x0B;
    pub const METADATA: u8 = 0x0C;
    pub const METADATA_INDEX: u8 = 0x0D;
    pub const SUMMARY_OFFSET: u8 = 0x0E;
    pub const DATA_END: u8 = 0x0F;
}

/// A length-prefixed UTF-8 string (`u32` byte length then bytes).
#[binrw::parser(reader, endian)]
pub(crate) fn parse_string() -> binrw::BinResult<String> {
    let len = u32::read_options(reader, endian, ())?;
    let mut buf = vec![0u8; len as usize];
    std::io::Read::read_exact(reader, &mut buf).map_err(|e| binrw::Error::Io(e))?;
    String::from_utf8(buf).map_err(|e| binrw::Error::Custom {
        pos: 0,
        err: Box::new(e),
    })
}

#[binrw::writer(writer, endian)]
pub(crate) fn write_string(s: &String) -> binrw::BinResult<()> {
    (s.len() as u32).write_options(writer, endian, ())?;
    std::io::Write::write_all(writer, s.as_bytes()).map_err(binrw::Error::Io)
}

#[binrw::parser(reader, endian)]
pub(crate) fn parse_u32_bytes() -> binrw::BinResult<Cow<'static, [u8]>> {
    let len = u32::read_options(reader, endian, ())?;
    let mut buf = vec![0u8; len as usize];
    std::io::Read::read_exact(reader, &mut buf).map_err(binrw::Error::Io)?;
    Ok(Cow::Owned(buf))
}

#[binrw::writer(writer, endian)]
pub(crate) fn write_u32_bytes(data: &Cow<'static, [u8]>) -> binrw::BinResult<()> {
    (data.len() as u32).write_options(writer, endian, ())?;
    std::io::Write::write_all(writer, data).map_err(binrw::Error::Io)
}

/// A `string -> string` map with a `u32` total-byte-length prefix, rejecting
/// duplicate keys (spec §4.1).
#[binrw::parser(reader, endian)]
pub(crate) fn parse_string_map() -> binrw::BinResult<BTreeMap<String, String>> {
    let byte_len = u32::read_options(reader, endian, ())?;
    let start = std::io::Seek::stream_position(reader).map_err(binrw::Error::Io)?;
    let end = start + byte_len as u64;
    let mut map = BTreeMap::new();
    while std::io::Seek::stream_position(reader).map_err(binrw::Error::Io)? < end {
        let key = parse_string(reader, endian, ())?;
        let value = parse_string(reader, endian, ())?;
        if map.insert(key, value).is_some() {
            return Err(binrw::Error::AssertFail {
                pos: start,
                message: "duplicate key in string map".into(),
            });
        }
    }
    Ok(map)
}

#[binrw::writer(writer, endian)]
pub(crate) fn write_string_map(map: &BTreeMap<String, String>) -> binrw::BinResult<()> {
    let mut buf = Vec::new();
    {
        let mut cursor = std::io::Cursor::new(&mut buf);
        for (k, v) in map {
            write_string(k, &mut cursor, endian, ())?;
            write_string(v, &mut cursor, endian, ())?;
        }
    }
    (buf.len() as u32).write_options(writer, endian, ())?;
    std::io::Write::write_all(writer, &buf).map_err(binrw::Error::Io)
}

/// A `u16 -> u64` map with a `u32` total-byte-length prefix (used by
/// `ChunkIndex.message_index_offsets`).
#[binrw::parser(reader, endian)]
pub(crate) fn parse_u16_u64_map() -> binrw::BinResult<BTreeMap<u16, u64>> {
    let byte_len = u32::read_options(reader, endian, ())?;
    let start = std::io::Seek::stream_position(reader).map_err(binrw::Error::Io)?;
    let end = start + byte_len as u64;
    let mut map = BTreeMap::new();
    while std::io::Seek::stream_position(reader).map_err(binrw::Error::Io)? < end {
        let key = u16::read_options(reader, endian, ())?;
        let value = u64::read_options(reader, endian, ())?;
        if map.insert(key, value).is_some() {
            return Err(binrw::Error::AssertFail {
                pos: start,
                message: "duplicate key in index map".into(),
            });
        }
    }
    Ok(map)
}

#[binrw::writer(writer, endian)]
pub(crate) fn write_u16_u64_map(map: &BTreeMap<u16, u64>) -> binrw::BinResult<()> {
    (map.len() as u32 * 10).write_options(writer, endian, ())?;
    for (k, v) in map {
        k.write_options(writer, endian, ())?;
        v.write_options(writer, endian, ())?;
    }
    Ok(())
}

/// A `u16 -> u64` map used for `Statistics.channel_message_counts`.
pub(crate) use parse_u16_u64_map as parse_channel_counts;
pub(crate) use write_u16_u64_map as write_channel_counts;

/// One `(log_time, offset)` entry inside a `MessageIndex`.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageIndexEntry {
    pub log_time: u64,
    pub offset: u64,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    #[br(parse_with = parse_string)]
    #[bw(write_with = write_string)]
    pub profile: String,
    #[br(parse_with = parse_string)]
    #[bw(write_with = write_string)]
    pub library: String,
}

/// Fixed 20-byte content (spec §6); the magic/CRC framing is handled by the
/// writer/reader since the footer's CRC is self-referencing.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Footer {
    pub summary_start: u64,
    pub summary_offset_start: u64,
    pub summary_crc: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaHeader {
    pub id: u16,
    #[br(parse_with = parse_string)]
    #[bw(write_with = write_string)]
    pub name: String,
    #[br(parse_with = parse_string)]
    #[bw(write_with = write_string)]
    pub encoding: String,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: u16,
    pub schema_id: u16,
    #[br(parse_with = parse_string)]
    #[bw(write_with = write_string)]
    pub topic: String,
    #[br(parse_with = parse_string)]
    #[bw(write_with = write_string)]
    pub message_encoding: String,
    #[br(parse_with = parse_string_map)]
    #[bw(write_with = write_string_map)]
    pub metadata: BTreeMap<String, String>,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub channel_id: u16,
    pub sequence: u32,
    pub log_time: u64,
    pub publish_time: u64,
}

impl MessageHeader {
    /// Size in bytes of the fixed-width header (spec §6: 22 bytes).
    pub const fn serialized_len() -> u64 {
        2 + 4 + 8 + 8
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkHeader {
    pub message_start_time: u64,
    pub message_end_time: u64,
    pub uncompressed_size: u64,
    pub uncompressed_crc: u32,
    #[br(parse_with = parse_string)]
    #[bw(write_with = write_string)]
    pub compression: String,
    pub compressed_size: u64,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq)]
pub struct MessageIndex {
    pub channel_id: u16,
    #[br(parse_with = parse_message_index_entries)]
    #[bw(write_with = write_message_index_entries)]
    pub records: Vec<MessageIndexEntry>,
}

#[binrw::parser(reader, endian)]
fn parse_message_index_entries() -> binrw::BinResult<Vec<MessageIndexEntry>> {
    let byte_len = u32::read_options(reader, endian, ())?;
    let count = byte_len as u64 / 16;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(MessageIndexEntry::read_options(reader, endian, ())?);
    }
    Ok(out)
}

#[binrw::writer(writer, endian)]
fn write_message_index_entries(entries: &Vec<MessageIndexEntry>) -> binrw::BinResult<()> {
    ((entries.len() * 16) as u32).write_options(writer, endian, ())?;
    for e in entries {
        e.write_options(writer, endian, ())?;
    }
    Ok(())
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkIndex {
    pub message_start_time: u64,
    pub message_end_time: u64,
    pub chunk_start_offset: u64,
    pub chunk_length: u64,
    #[br(parse_with = parse_u16_u64_map)]
    #[bw(write_with = write_u16_u64_map)]
    pub message_index_offsets: BTreeMap<u16, u64>,
    pub message_index_length: u64,
    #[br(parse_with = parse_string)]
    #[bw(write_with = write_string)]
    pub compression: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

impl ChunkIndex {
    /// Offset of the chunk's compressed record data (past the chunk header).
    pub fn compressed_data_offset(&self, chunk_header_len: u64) -> u64 {
        self.chunk_start_offset + 9 + chunk_header_len
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentHeader {
    pub log_time: u64,
    pub create_time: u64,
    #[br(parse_with = parse_string)]
    #[bw(write_with = write_string)]
    pub name: String,
    #[br(parse_with = parse_string)]
    #[bw(write_with = write_string)]
    pub media_type: String,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentIndex {
    pub offset: u64,
    pub length: u64,
    pub log_time: u64,
    pub create_time: u64,
    pub data_size: u64,
    #[br(parse_with = parse_string)]
    #[bw(write_with = write_string)]
    pub name: String,
    #[br(parse_with = parse_string)]
    #[bw(write_with = write_string)]
    pub media_type: String,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Statistics {
    pub message_count: u64,
    pub schema_count: u16,
    pub channel_count: u32,
    pub attachment_count: u32,
    pub metadata_count: u32,
    pub chunk_count: u32,
    pub message_start_time: u64,
    pub message_end_time: u64,
    #[br(parse_with = parse_channel_counts)]
    #[bw(write_with = write_channel_counts)]
    pub channel_message_counts: BTreeMap<u16, u64>,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    #[br(parse_with = parse_string)]
    #[bw(write_with = write_string)]
    pub name: String,
    #[br(parse_with = parse_string_map)]
    #[bw(write_with = write_string_map)]
    pub metadata: BTreeMap<String, String>,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataIndex {
    pub offset: u64,
    pub length: u64,
    #[br(parse_with = parse_string)]
    #[bw(write_with = write_string)]
    pub name: String,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryOffset {
    pub group_opcode: u8,
    pub group_start: u64,
    pub group_length: u64,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataEnd {
    pub data_section_crc: u32,
}

/// A fully decoded record, with its opcode recoverable via [`Record::opcode`].
#[derive(Debug, Clone, PartialEq)]
pub enum Record<'a> {
    Header(Header),
    Footer(Footer),
    Schema {
        header: SchemaHeader,
        data: Cow<'a, [u8]>,
    },
    Channel(Channel),
    Message {
        header: MessageHeader,
        data: Cow<'a, [u8]>,
    },
    Chunk {
        header: ChunkHeader,
        data: Cow<'a, [u8]>,
    },
    MessageIndex(MessageIndex),
    ChunkIndex(ChunkIndex),
    Attachment {
        header: AttachmentHeader,
        data: Cow<'a, [u8]>,
        crc: u32,
    },
    AttachmentIndex(AttachmentIndex),
    Statistics(Statistics),
    Metadata(Metadata),
    MetadataIndex(MetadataIndex),
    SummaryOffset(SummaryOffset),
    DataEnd(DataEnd),
    /// A record whose opcode this crate does not recognize. Preserved
    /// verbatim so it can be re-emitted unchanged.
    Unknown { opcode: u8, data: Cow<'a, [u8]> },
}

impl<'a> Record<'a> {
    pub fn opcode(&self) -> u8 {
        match self {
            Record::Header(_) => op::HEADER,
            Record::Footer(_) => op::FOOTER,
            Record::Schema { .. } => op::SCHEMA,
            Record::Channel(_) => op::CHANNEL,
            Record::Message { .. } => op::MESSAGE,
            Record::Chunk { .. } => op::CHUNK,
            Record::MessageIndex(_) => op::MESSAGE_INDEX,
            Record::ChunkIndex(_) => op::CHUNK_INDEX,
            Record::Attachment { .. } => op::ATTACHMENT,
            Record::AttachmentIndex(_) => op::ATTACHMENT_INDEX,
            Record::Statistics(_) => op::STATISTICS,
            Record::Metadata(_) => op::METADATA,
            Record::MetadataIndex(_) => op::METADATA_INDEX,
            Record::SummaryOffset(_) => op::SUMMARY_OFFSET,
            Record::DataEnd(_) => op::DATA_END,
            Record::Unknown { opcode, .. } => *opcode,
        }
    }

    /// Whether this record kind is legal inside a chunk's payload (spec §3:
    /// only Schema/Channel/Message).
    pub fn allowed_in_chunk(&self) -> bool {
        matches!(
            self,
            Record::Schema { .. } | Record::Channel(_) | Record::Message { .. }
        )
    }

    pub fn into_owned(self) -> Record<'static> {
        match self {
            Record::Header(h) => Record::Header(h),
            Record::Footer(f) => Record::Footer(f),
            Record::Schema { header, data } => Record::Schema {
                header,
                data: Cow::Owned(data.into_owned()),
            },
            Record::Channel(c) => Record::Channel(c),
            Record::Message { header, data } => Record::Message {
                header,
                data: Cow::Owned(data.into_owned()),
            },
            Record::Chunk { header, data } => Record::Chunk {
                header,
                data: Cow::Owned(data.into_owned()),
            },
            Record::MessageIndex(m) => Record::MessageIndex(m),
            Record::ChunkIndex(c) => Record::ChunkIndex(c),
            Record::Attachment { header, data, crc } => Record::Attachment {
                header,
                data: Cow::Owned(data.into_owned()),
                crc,
            },
            Record::AttachmentIndex(a) => Record::AttachmentIndex(a),
            Record::Statistics(s) => Record::Statistics(s),
            Record::Metadata(m) => Record::Metadata(m),
            Record::MetadataIndex(m) => Record::MetadataIndex(m),
            Record::SummaryOffset(s) => Record::SummaryOffset(s),
            Record::DataEnd(d) => Record::DataEnd(d),
            Record::Unknown { opcode, data } => Record::Unknown {
                opcode,
                data: Cow::Owned(data.into_owned()),
            },
        }
    }
}

/// Computes `end - start - 8` for the deferred-length pattern (spec §4.1)
/// and seeks back to `start` to patch it, then returns to `end`.
pub(crate) fn patch_length<W: std::io::Write + std::io::Seek>(
    w: &mut W,
    len_field_pos: u64,
    content_start: u64,
) -> std::io::Result<()> {
    let end = w.stream_position()?;
    let len = end - content_start;
    w.seek(SeekFrom::Start(len_field_pos))?;
    byteorder::WriteBytesExt::write_u64::<byteorder::LE>(w, len)?;
    w.seek(SeekFrom::Start(end))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::io::Cursor;

    #[test]
    fn string_round_trip() {
        let mut buf = Vec::new();
        {
            let mut cur = Cursor::new(&mut buf);
            write_string(
                &String::from("hello"),
                &mut cur,
                binrw::Endian::Little,
                (),
            )
            .unwrap();
        }
        let mut cur = Cursor::new(&buf);
        let s = parse_string(&mut cur, binrw::Endian::Little, ()).unwrap();
        assert_eq!(s, "hello");
    }

    #[test]
    fn header_round_trip() {
        let header = Header {
            profile: "ros1".into(),
            library: "mcap-rs".into(),
        };
        let mut buf = Vec::new();
        {
            let mut cur = Cursor::new(&mut buf);
            binrw::BinWrite::write_le(&header, &mut cur).unwrap();
        }
        let mut cur = Cursor::new(&buf);
        let decoded: Header = binrw::BinRead::read_le(&mut cur).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn message_header_len_matches_spec() {
        assert_eq!(MessageHeader::serialized_len(), 22);
    }

    #[test]
    fn string_map_rejects_duplicate_keys() {
        let mut buf = Vec::new();
        {
            let mut cur = Cursor::new(&mut buf);
            write_string(&String::from("a"), &mut cur, binrw::Endian::Little, ()).unwrap();
            write_string(&String::from("1"), &mut cur, binrw::Endian::Little, ()).unwrap();
            write_string(&String::from("a"), &mut cur, binrw::Endian::Little, ()).unwrap();
            write_string(&String::from("2"), &mut cur, binrw::Endian::Little, ()).unwrap();
        }
        let mut framed = Vec::new();
        {
            let mut cur = Cursor::new(&mut framed);
            byteorder::WriteBytesExt::write_u32::<byteorder::LE>(&mut cur, buf.len() as u32)
                .unwrap();
            std::io::Write::write_all(&mut cur, &buf).unwrap();
        }
        let mut cur = Cursor::new(&framed);
        let result = parse_string_map(&mut cur, binrw::Endian::Little, ());
        assert!(result.is_err());
    }
}
