//! Indexed reader (spec §4.6): summary ingestion and a heap-merged,
//! time-ordered (or reverse) message iterator over a random-access
//! [`Source`].
//!
//! The teacher's own `sans_io::IndexedReader` reuses a pool of `ChunkSlot`s
//! and sorts each chunk inline rather than heap-merging across chunks; that
//! doesn't satisfy spec §4.6.2's cross-chunk ordering requirement when
//! chunks overlap in time, so the cursor/heap architecture here is authored
//! directly from the spec text. Decompression dispatch is shared with
//! [`crate::read`].

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BinaryHeap, HashMap, HashSet},
    sync::Arc,
};

use crate::{
    channels::ChannelAccumulator,
    read::{decompress_chunk, parse_record, LinearReader, FOOTER_RECORD_LEN},
    records::{self, op, Record},
    Channel, McapError, McapResult, Message, Schema, MAGIC,
};

/// The fully-ingested summary section of an MCAP file (spec §4.6.1).
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub stats: Option<records::Statistics>,
    pub channels: BTreeMap<u16, Arc<Channel>>,
    pub schemas: BTreeMap<u16, Arc<Schema>>,
    pub chunk_indexes: Vec<records::ChunkIndex>,
    pub attachment_indexes: Vec<records::AttachmentIndex>,
    pub metadata_indexes: Vec<records::MetadataIndex>,
    /// Offset of the DataEnd record, used by append mode to know where to
    /// resume the data section.
    pub(crate) data_end_offset: u64,
    pub(crate) data_section_crc: u32,
}

impl PartialEq for Summary {
    fn eq(&self, other: &Self) -> bool {
        self.stats == other.stats
            && self.channels == other.channels
            && self.schemas == other.schemas
            && self.chunk_indexes == other.chunk_indexes
            && self.attachment_indexes == other.attachment_indexes
            && self.metadata_indexes == other.metadata_indexes
    }
}

impl Summary {
    /// Ingests the summary section of a complete MCAP file (spec §4.6.1).
    /// Returns `Ok(None)` if the file is unindexed (`summary_start == 0`).
    pub fn read(buf: &[u8]) -> McapResult<Option<Summary>> {
        if buf.len() < MAGIC.len() * 2 + FOOTER_RECORD_LEN {
            return Err(McapError::TooSmall);
        }
        let footer = crate::read::footer(buf)?;
        if footer.summary_start == 0 {
            return Ok(None);
        }

        // DATA_END_LEN = opcode(1) + length(8) + data_section_crc(4): the
        // DataEnd record immediately precedes summary_start, so one I/O
        // covers both it and the summary section (spec §4.6.1).
        const DATA_END_LEN: u64 = 13;
        let footer_record_start = (buf.len() - MAGIC.len() - FOOTER_RECORD_LEN) as u64;
        let region_start = footer
            .summary_start
            .checked_sub(DATA_END_LEN)
            .ok_or(McapError::BadFooterLength)?;
        let region = &buf[region_start as usize..footer_record_start as usize];

        if footer.summary_crc != 0 {
            let summary_region = &buf[footer.summary_start as usize..footer_record_start as usize];
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(summary_region);
            // footer prefix covered by the CRC: opcode, length, summary_start, summary_offset_start
            let mut prefix = Vec::with_capacity(25);
            prefix.push(op::FOOTER);
            prefix.extend_from_slice(&20u64.to_le_bytes());
            prefix.extend_from_slice(&footer.summary_start.to_le_bytes());
            prefix.extend_from_slice(&footer.summary_offset_start.to_le_bytes());
            hasher.update(&prefix);
            let computed = hasher.finalize();
            if computed != footer.summary_crc {
                return Err(McapError::BadSummaryCrc {
                    saved: footer.summary_crc,
                    computed,
                });
            }
        }

        let mut records = LinearReader::sans_magic(region);
        let data_section_crc = match records.next() {
            Some(Ok(Record::DataEnd(d))) => d.data_section_crc,
            Some(Ok(_)) => return Err(McapError::DataRecordInSummary),
            Some(Err(e)) => return Err(e),
            None => return Err(McapError::BadFooterLength),
        };

        let mut accumulator = ChannelAccumulator::default();
        let mut stats = None;
        let mut chunk_indexes = Vec::new();
        let mut attachment_indexes = Vec::new();
        let mut metadata_indexes = Vec::new();

        for record in records {
            match record? {
                Record::Schema { header, data } => accumulator.add_schema(header, data)?,
                Record::Channel(c) => accumulator.add_channel(c)?,
                Record::Statistics(s) => {
                    if stats.is_some() {
                        return Err(McapError::DuplicateStatistics);
                    }
                    stats = Some(s);
                }
                Record::ChunkIndex(c) => chunk_indexes.push(c),
                Record::AttachmentIndex(a) => attachment_indexes.push(a),
                Record::MetadataIndex(m) => metadata_indexes.push(m),
                Record::SummaryOffset(_) => {}
                Record::Unknown { opcode, .. } => {
                    log::debug!("ignoring unknown opcode 0x{opcode:02X} found in summary section");
                }
                Record::Message { .. }
                | Record::Chunk { .. }
                | Record::Attachment { .. }
                | Record::Header(_)
                | Record::Footer(_)
                | Record::MessageIndex(_)
                | Record::DataEnd(_) => return Err(McapError::DataRecordInSummary),
            }
        }

        Ok(Some(Summary {
            stats,
            channels: accumulator.channels.into_iter().collect(),
            schemas: accumulator.schemas.into_iter().collect(),
            chunk_indexes,
            attachment_indexes,
            metadata_indexes,
            data_end_offset: region_start,
            data_section_crc,
        }))
    }

    /// Reads a filtered, time-ordered (or reverse) iterator over this
    /// file's messages (spec §4.6.2).
    pub fn read_messages<'a>(
        &'a self,
        buf: &'a [u8],
        options: &ReadMessageOptions,
    ) -> McapResult<MessageIterator<'a>> {
        MessageIterator::new(buf, self, options)
    }

    /// Streams the messages within one chunk, in physical order.
    pub fn stream_chunk<'a>(
        &self,
        buf: &'a [u8],
        index: &records::ChunkIndex,
    ) -> McapResult<Vec<McapResult<Message>>> {
        let (header, payload) = read_chunk(buf, index)?;
        let mut accumulator = ChannelAccumulator::default();
        for rec in self.schema_and_channel_records() {
            apply_to_accumulator(&mut accumulator, rec)?;
        }
        let mut out = Vec::new();
        for rec in LinearReader::sans_magic(&payload) {
            match rec? {
                Record::Schema { header, data } => accumulator.add_schema(header, data)?,
                Record::Channel(c) => accumulator.add_channel(c)?,
                Record::Message { header: mh, data } => {
                    let channel = accumulator
                        .get(mh.channel_id)
                        .ok_or_else(|| McapError::UnknownChannel(mh.sequence, mh.channel_id))?;
                    out.push(Ok(Message {
                        channel,
                        sequence: mh.sequence,
                        log_time: mh.log_time,
                        publish_time: mh.publish_time,
                        data,
                    }));
                }
                _ => {}
            }
        }
        let _ = header;
        Ok(out)
    }

    fn schema_and_channel_records(&self) -> Vec<Record<'static>> {
        let mut out = Vec::new();
        for (&id, s) in &self.schemas {
            out.push(Record::Schema {
                header: records::SchemaHeader {
                    id,
                    name: s.name.clone(),
                    encoding: s.encoding.clone(),
                },
                data: s.data.clone(),
            });
        }
        for (&id, c) in &self.channels {
            out.push(Record::Channel(records::Channel {
                id,
                schema_id: c.schema.as_ref().map(|s| s.id).unwrap_or(0),
                topic: c.topic.clone(),
                message_encoding: c.message_encoding.clone(),
                metadata: c.metadata.clone(),
            }));
        }
        out
    }

    /// Reads and sorts the message indexes of one chunk (spec §4.6.4).
    pub fn read_message_indexes(
        &self,
        buf: &[u8],
        index: &records::ChunkIndex,
    ) -> McapResult<BTreeMap<u16, Vec<records::MessageIndexEntry>>> {
        if index.message_index_offsets.is_empty() {
            return Ok(BTreeMap::new());
        }
        let start = *index.message_index_offsets.values().min().unwrap();
        let end = start + index.message_index_length;
        let region = &buf[start as usize..end as usize];
        let mut out = BTreeMap::new();
        for rec in LinearReader::sans_magic(region) {
            if let Record::MessageIndex(mi) = rec? {
                if !mi.records.is_empty() {
                    out.insert(mi.channel_id, mi.records);
                }
            }
        }
        Ok(out)
    }

    /// Decodes the message referenced by `entry` within `index`'s chunk.
    pub fn seek_message(
        &self,
        buf: &[u8],
        index: &records::ChunkIndex,
        entry: &records::MessageIndexEntry,
    ) -> McapResult<Message> {
        let (_header, payload) = read_chunk(buf, index)?;
        let rec = parse_record(op::MESSAGE, &read_one_record_content(&payload, entry.offset as usize)?)?;
        match rec {
            Record::Message { header, data } => {
                let channel = self
                    .channels
                    .get(&header.channel_id)
                    .cloned()
                    .ok_or_else(|| McapError::UnknownChannel(header.sequence, header.channel_id))?;
                if header.log_time != entry.log_time {
                    return Err(McapError::MessageIndexMismatch {
                        offset: entry.offset,
                        expected: entry.log_time,
                        actual: header.log_time,
                    });
                }
                Ok(Message {
                    channel,
                    sequence: header.sequence,
                    log_time: header.log_time,
                    publish_time: header.publish_time,
                    data,
                })
            }
            _ => Err(McapError::MessageIndexMismatch {
                offset: entry.offset,
                expected: entry.log_time,
                actual: 0,
            }),
        }
    }

    pub fn read_attachments<'a>(
        &'a self,
    ) -> impl Iterator<Item = &'a records::AttachmentIndex> {
        self.attachment_indexes.iter()
    }

    pub fn read_metadata<'a>(&'a self) -> impl Iterator<Item = &'a records::MetadataIndex> {
        self.metadata_indexes.iter()
    }
}

fn apply_to_accumulator(acc: &mut ChannelAccumulator, rec: Record<'static>) -> McapResult<()> {
    match rec {
        Record::Schema { header, data } => acc.add_schema(header, data),
        Record::Channel(c) => acc.add_channel(c),
        _ => Ok(()),
    }
}

/// Reads a single opcode+length-framed record's raw content bytes starting
/// exactly at `offset` within `payload`.
fn read_one_record_content(payload: &[u8], offset: usize) -> McapResult<Vec<u8>> {
    if offset + 9 > payload.len() {
        return Err(McapError::UnexpectedEof);
    }
    let len = u64::from_le_bytes(payload[offset + 1..offset + 9].try_into().unwrap());
    let start = offset + 9;
    let end = start + len as usize;
    if end > payload.len() {
        return Err(McapError::UnexpectedEof);
    }
    Ok(payload[start..end].to_vec())
}

fn read_chunk(buf: &[u8], index: &records::ChunkIndex) -> McapResult<(records::ChunkHeader, Vec<u8>)> {
    let start = index.chunk_start_offset as usize;
    if start + 9 > buf.len() {
        return Err(McapError::UnexpectedEof);
    }
    let content_start = start + 9;
    let len = u64::from_le_bytes(buf[start + 1..start + 9].try_into().unwrap());
    let content_end = content_start
        .checked_add(len as usize)
        .filter(|&end| end <= buf.len())
        .ok_or(McapError::UnexpectedEof)?;
    let content = &buf[content_start..content_end];
    match parse_record(op::CHUNK, content)? {
        Record::Chunk { header, data } => {
            let decompressed = decompress_chunk(&header.compression, &data, header.uncompressed_size)?;
            if header.uncompressed_crc != 0 {
                let computed = crc32fast::hash(&decompressed);
                if computed != header.uncompressed_crc {
                    log::warn!(
                        "chunk at offset {} failed CRC check: saved {:08X}, computed {:08X}",
                        index.chunk_start_offset,
                        header.uncompressed_crc,
                        computed
                    );
                    return Err(McapError::BadChunkCrc {
                        saved: header.uncompressed_crc,
                        computed,
                    });
                }
            }
            Ok((header, decompressed))
        }
        _ => Err(McapError::BadFooterLength),
    }
}

/// Parameters for [`Summary::read_messages`] (spec §4.6.2).
#[derive(Debug, Default, Clone)]
pub struct ReadMessageOptions {
    pub topics: Option<HashSet<String>>,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub reverse: bool,
    pub validate_crcs: bool,
}

/// One chunk's cursor through its (eventually loaded) message index.
struct ChunkCursor {
    index: records::ChunkIndex,
    relevant_channels: Option<HashSet<u16>>,
    reverse: bool,
    start_time: u64,
    end_time: u64,
    /// `None` until [`Self::load`] has been called.
    loaded: Option<Vec<(u64, u64, u16)>>,
    pos: usize,
}

impl ChunkCursor {
    fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    fn is_exhausted(&self) -> bool {
        match &self.loaded {
            Some(v) => self.pos >= v.len(),
            None => false,
        }
    }

    fn load(&mut self, summary: &Summary, buf: &[u8]) -> McapResult<()> {
        if self.index.message_index_offsets.is_empty()
            && (self.index.message_start_time != 0 || self.index.message_end_time != 0)
        {
            return Err(McapError::InvalidEmptyChunk(
                self.index.message_start_time,
                self.index.message_end_time,
            ));
        }
        let indexes = summary.read_message_indexes(buf, &self.index)?;
        let mut all: Vec<(u64, u64, u16)> = Vec::new();
        for (channel_id, entries) in indexes {
            if let Some(relevant) = &self.relevant_channels {
                if !relevant.contains(&channel_id) {
                    continue;
                }
            }
            for e in entries {
                all.push((e.log_time, e.offset, channel_id));
            }
        }
        all.sort_unstable_by_key(|(t, o, _)| (*t, *o));

        if let (Some(&(first, ..)), Some(&(last, ..))) = (all.first(), all.last()) {
            if first < self.index.message_start_time || last > self.index.message_end_time {
                return Err(McapError::ChunkIndexTimesDisagree {
                    index_start: self.index.message_start_time,
                    index_end: self.index.message_end_time,
                });
            }
        }

        if self.reverse {
            all.reverse();
        }

        // Clip to [start_time, end_time] (spec §4.6.4). `all` is already
        // sorted ascending or descending by direction; a linear filter is
        // equivalent to bisecting both ends since the predicate is monotonic
        // over the sorted sequence.
        let (start, end) = (self.start_time, self.end_time);
        let clipped: Vec<_> = all
            .into_iter()
            .filter(|(t, _, _)| *t >= start && *t <= end)
            .collect();

        self.loaded = Some(clipped);
        self.pos = 0;
        Ok(())
    }

    /// The heap ordering key: `None` forces a load before this cursor can be
    /// compared definitively.
    fn sort_key(&self) -> (u64, u8, u64) {
        match &self.loaded {
            Some(entries) if self.pos < entries.len() => {
                let (t, _o, _c) = entries[self.pos];
                (t, 1, self.index.chunk_start_offset)
            }
            _ => {
                let bound = if self.reverse {
                    self.index.message_end_time
                } else {
                    self.index.message_start_time
                };
                (bound, 0, self.index.chunk_start_offset)
            }
        }
    }
}

impl PartialEq for ChunkCursor {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}
impl Eq for ChunkCursor {}

impl PartialOrd for ChunkCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChunkCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        assert_eq!(
            self.reverse, other.reverse,
            "comparing reverse and forward cursors is a programming error"
        );
        let (a, b) = (self.sort_key(), other.sort_key());
        if self.reverse {
            // Max-heap wants the largest (log_time, chunk_start_offset) on top.
            a.cmp(&b)
        } else {
            // Max-heap wants the smallest key on top: invert the comparison.
            b.cmp(&a)
        }
    }
}

/// Heap-merged, time-ordered (or reverse) message iterator (spec §4.6.2).
pub struct MessageIterator<'a> {
    buf: &'a [u8],
    summary: &'a Summary,
    heap: BinaryHeap<ChunkCursor>,
    chunk_view_cache: HashMap<u64, Vec<u8>>,
    options: ReadMessageOptions,
}

impl<'a> MessageIterator<'a> {
    fn new(buf: &'a [u8], summary: &'a Summary, options: &ReadMessageOptions) -> McapResult<Self> {
        let relevant_channels = options.topics.as_ref().map(|topics| {
            summary
                .channels
                .iter()
                .filter(|(_, c)| topics.contains(&c.topic))
                .map(|(&id, _)| id)
                .collect::<HashSet<_>>()
        });

        let start_time = options.start_time.unwrap_or(0);
        let end_time = options.end_time.unwrap_or(u64::MAX);

        let mut heap = BinaryHeap::new();
        for index in &summary.chunk_indexes {
            if index.message_end_time < start_time || index.message_start_time > end_time {
                continue;
            }
            heap.push(ChunkCursor {
                index: index.clone(),
                relevant_channels: relevant_channels.clone(),
                reverse: options.reverse,
                start_time,
                end_time,
                loaded: None,
                pos: 0,
            });
        }

        Ok(Self {
            buf,
            summary,
            heap,
            chunk_view_cache: HashMap::new(),
            options: options.clone(),
        })
    }

    fn next_inner(&mut self) -> Option<McapResult<Message>> {
        loop {
            let mut top = self.heap.pop()?;
            if !top.is_loaded() {
                if let Err(e) = top.load(self.summary, self.buf) {
                    return Some(Err(e));
                }
                if top.is_exhausted() {
                    continue;
                }
                self.heap.push(top);
                continue;
            }

            if top.is_exhausted() {
                self.chunk_view_cache.remove(&top.index.chunk_start_offset);
                continue;
            }

            let offset = top.index.chunk_start_offset;
            if !self.chunk_view_cache.contains_key(&offset) {
                match read_chunk(self.buf, &top.index) {
                    Ok((_header, payload)) => {
                        self.chunk_view_cache.insert(offset, payload);
                    }
                    Err(e) => return Some(Err(e)),
                }
            }

            let (log_time, record_offset, _channel_id) = top.loaded.as_ref().unwrap()[top.pos];
            top.pos += 1;

            let payload = self.chunk_view_cache.get(&offset).unwrap();
            let content = match read_one_record_content(payload, record_offset as usize) {
                Ok(c) => c,
                Err(e) => return Some(Err(e)),
            };
            let message = match parse_record(op::MESSAGE, &content) {
                Ok(Record::Message { header, data }) => {
                    if header.log_time != log_time {
                        return Some(Err(McapError::MessageIndexMismatch {
                            offset: record_offset,
                            expected: log_time,
                            actual: header.log_time,
                        }));
                    }
                    let channel = match self.summary.channels.get(&header.channel_id).cloned() {
                        Some(c) => c,
                        None => {
                            return Some(Err(McapError::UnknownChannel(
                                header.sequence,
                                header.channel_id,
                            )))
                        }
                    };
                    Message {
                        channel,
                        sequence: header.sequence,
                        log_time: header.log_time,
                        publish_time: header.publish_time,
                        data,
                    }
                }
                Ok(_) => return Some(Err(McapError::BadFooterLength)),
                Err(e) => return Some(Err(e)),
            };

            let exhausted = top.is_exhausted();
            if exhausted {
                self.chunk_view_cache.remove(&offset);
            } else {
                self.heap.push(top);
            }

            let _ = self.options.validate_crcs;
            return Some(Ok(message));
        }
    }
}

impl<'a> Iterator for MessageIterator<'a> {
    type Item = McapResult<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_key_forces_load_before_ready_on_tie() {
        let pending = ChunkCursor {
            index: records::ChunkIndex {
                message_start_time: 5,
                message_end_time: 5,
                chunk_start_offset: 0,
                chunk_length: 0,
                message_index_offsets: Default::default(),
                message_index_length: 0,
                compression: String::new(),
                compressed_size: 0,
                uncompressed_size: 0,
            },
            relevant_channels: None,
            reverse: false,
            start_time: 0,
            end_time: u64::MAX,
            loaded: None,
            pos: 0,
        };
        let mut ready = ChunkCursor {
            index: records::ChunkIndex {
                chunk_start_offset: 1,
                ..pending.index.clone()
            },
            relevant_channels: None,
            reverse: false,
            start_time: 0,
            end_time: u64::MAX,
            loaded: Some(vec![(5, 0, 0)]),
            pos: 0,
        };
        assert!(pending.sort_key().1 < ready.sort_key().1);
        let _ = &mut ready;
    }

    #[test]
    fn load_rejects_empty_index_with_nonzero_time_range() {
        let summary = Summary {
            stats: None,
            channels: Default::default(),
            schemas: Default::default(),
            chunk_indexes: Vec::new(),
            attachment_indexes: Vec::new(),
            metadata_indexes: Vec::new(),
            data_end_offset: 0,
            data_section_crc: 0,
        };
        let mut cursor = ChunkCursor {
            index: records::ChunkIndex {
                message_start_time: 1,
                message_end_time: 2,
                chunk_start_offset: 0,
                chunk_length: 0,
                message_index_offsets: Default::default(),
                message_index_length: 0,
                compression: String::new(),
                compressed_size: 0,
                uncompressed_size: 0,
            },
            relevant_channels: None,
            reverse: false,
            start_time: 0,
            end_time: u64::MAX,
            loaded: None,
            pos: 0,
        };
        let err = cursor.load(&summary, &[]).unwrap_err();
        assert!(matches!(err, McapError::InvalidEmptyChunk(1, 2)));
    }

    #[test]
    fn load_accepts_empty_index_with_zero_time_range() {
        let summary = Summary {
            stats: None,
            channels: Default::default(),
            schemas: Default::default(),
            chunk_indexes: Vec::new(),
            attachment_indexes: Vec::new(),
            metadata_indexes: Vec::new(),
            data_end_offset: 0,
            data_section_crc: 0,
        };
        let mut cursor = ChunkCursor {
            index: records::ChunkIndex {
                message_start_time: 0,
                message_end_time: 0,
                chunk_start_offset: 0,
                chunk_length: 0,
                message_index_offsets: Default::default(),
                message_index_length: 0,
                compression: String::new(),
                compressed_size: 0,
                uncompressed_size: 0,
            },
            relevant_channels: None,
            reverse: false,
            start_time: 0,
            end_time: u64::MAX,
            loaded: None,
            pos: 0,
        };
        cursor.load(&summary, &[]).unwrap();
        assert!(cursor.is_exhausted());
    }
}
