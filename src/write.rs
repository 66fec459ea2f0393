//! The writer (spec §4.5): configuration, chunked or top-level message
//! emission, attachments, metadata, summary/footer finalization, and
//! initializing a writer to append onto an existing indexed file.

use std::{
    borrow::Cow,
    collections::{BTreeMap, HashSet},
    io::{Seek, Write},
    sync::Arc,
};

use bimap::BiHashMap;

use crate::{
    chunk_builder::ChunkBuilder,
    buffer::Buffer,
    io::{op_and_len, CountingCrcWriter, SeekableSink},
    records::{self, op, patch_length},
    Attachment, Channel, Compression, McapError, McapResult, Schema, MAGIC,
};

/// Writer configuration (spec §4.5.1). Each setter consumes and returns
/// `self`; call [`WriteOptions::create`] to open a writer against a sink.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    compression: Option<Compression>,
    profile: String,
    library: String,
    chunk_size: Option<u64>,
    use_chunks: bool,
    use_statistics: bool,
    use_summary_offsets: bool,
    use_chunk_index: bool,
    use_attachment_index: bool,
    use_message_index: bool,
    use_metadata_index: bool,
    repeat_schemas: bool,
    repeat_channels: bool,
    start_channel_id: u16,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            compression: None,
            profile: String::new(),
            library: format!("mcap-rs {}", env!("CARGO_PKG_VERSION")),
            chunk_size: Some(1024 * 1024),
            use_chunks: true,
            use_statistics: true,
            use_summary_offsets: true,
            use_chunk_index: true,
            use_attachment_index: true,
            use_message_index: true,
            use_metadata_index: true,
            repeat_schemas: true,
            repeat_channels: true,
            start_channel_id: 0,
        }
    }
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.compression = compression;
        self
    }

    pub fn profile<S: Into<String>>(mut self, profile: S) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn library<S: Into<String>>(mut self, library: S) -> Self {
        self.library = library.into();
        self
    }

    pub fn chunk_size(mut self, chunk_size: Option<u64>) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn use_chunks(mut self, use_chunks: bool) -> Self {
        self.use_chunks = use_chunks;
        self
    }

    pub fn use_statistics(mut self, v: bool) -> Self {
        self.use_statistics = v;
        self
    }

    pub fn use_summary_offsets(mut self, v: bool) -> Self {
        self.use_summary_offsets = v;
        self
    }

    pub fn use_chunk_index(mut self, v: bool) -> Self {
        self.use_chunk_index = v;
        self
    }

    pub fn use_attachment_index(mut self, v: bool) -> Self {
        self.use_attachment_index = v;
        self
    }

    pub fn use_message_index(mut self, v: bool) -> Self {
        self.use_message_index = v;
        self
    }

    pub fn use_metadata_index(mut self, v: bool) -> Self {
        self.use_metadata_index = v;
        self
    }

    pub fn repeat_schemas(mut self, v: bool) -> Self {
        self.repeat_schemas = v;
        self
    }

    pub fn repeat_channels(mut self, v: bool) -> Self {
        self.repeat_channels = v;
        self
    }

    pub fn start_channel_id(mut self, id: u16) -> Self {
        self.start_channel_id = id;
        self
    }

    /// Emits the magic bytes and Header, and returns a [`Writer`] ready to
    /// accept schemas, channels, messages, attachments, and metadata (spec
    /// §4.5.2/§4.5.3: combines the `Fresh -> Started` transition into this
    /// single call).
    pub fn create<W: Write + Seek>(self, mut writer: W) -> McapResult<Writer<W>> {
        writer.write_all(MAGIC)?;
        let header = records::Header {
            profile: self.profile.clone(),
            library: self.library.clone(),
        };
        emit(&mut writer, op::HEADER, &serialize(&header)?)?;

        let next_channel_id = self.start_channel_id as u32;

        Ok(Writer {
            sink: Some(CountingCrcWriter::new(writer)),
            options: self,
            schemas: BiHashMap::new(),
            channels: BiHashMap::new(),
            schema_values: BTreeMap::new(),
            channel_values: BTreeMap::new(),
            emitted_schemas: HashSet::new(),
            emitted_channels: HashSet::new(),
            next_schema_id: 1,
            next_channel_id,
            chunk: None,
            chunk_indexes: Vec::new(),
            attachment_indexes: Vec::new(),
            metadata_indexes: Vec::new(),
            message_bounds: None,
            message_count: 0,
            channel_message_counts: BTreeMap::new(),
            attachment_count: 0,
            metadata_count: 0,
            chunk_count: 0,
            track_data_crc: true,
            current_attachment: None,
            finished: false,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SchemaKey {
    name: String,
    encoding: String,
    data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChannelKey {
    schema_id: u16,
    topic: String,
    message_encoding: String,
    metadata: BTreeMap<String, String>,
}

struct ChunkState {
    builder: ChunkBuilder,
    payload: Buffer,
    emitted_schemas: HashSet<u16>,
    emitted_channels: HashSet<u16>,
}

impl ChunkState {
    fn new() -> Self {
        Self {
            builder: ChunkBuilder::new(),
            payload: Buffer::new(),
            emitted_schemas: HashSet::new(),
            emitted_channels: HashSet::new(),
        }
    }
}

struct InProgressAttachment {
    record_start: u64,
    len_field_pos: u64,
    content_start: u64,
    expected_len: u64,
    written: u64,
    hasher: crc32fast::Hasher,
    log_time: u64,
    create_time: u64,
    name: String,
    media_type: String,
}

/// Writes MCAP records to a `Write + Seek` sink (spec §4.5).
///
/// Dropping a writer that was never explicitly [`finish`](Writer::finish)ed
/// finalizes it automatically, swallowing any error — call `finish()`
/// yourself to observe it.
pub struct Writer<W: Write + Seek> {
    sink: Option<CountingCrcWriter<W>>,
    options: WriteOptions,
    schemas: BiHashMap<SchemaKey, u16>,
    channels: BiHashMap<ChannelKey, u16>,
    schema_values: BTreeMap<u16, Arc<Schema>>,
    channel_values: BTreeMap<u16, Arc<Channel>>,
    emitted_schemas: HashSet<u16>,
    emitted_channels: HashSet<u16>,
    next_schema_id: u32,
    next_channel_id: u32,
    chunk: Option<ChunkState>,
    chunk_indexes: Vec<records::ChunkIndex>,
    attachment_indexes: Vec<records::AttachmentIndex>,
    metadata_indexes: Vec<records::MetadataIndex>,
    message_bounds: Option<(u64, u64)>,
    message_count: u64,
    channel_message_counts: BTreeMap<u16, u64>,
    attachment_count: u32,
    metadata_count: u32,
    chunk_count: u32,
    track_data_crc: bool,
    current_attachment: Option<InProgressAttachment>,
    finished: bool,
}

impl<W: Write + Seek> Writer<W> {
    /// Registers a schema, deduplicating identical re-registration, and
    /// returns its id. Schema ids are nonzero.
    pub fn add_schema(&mut self, name: &str, encoding: &str, data: &[u8]) -> McapResult<u16> {
        self.ensure_started()?;
        let key = SchemaKey {
            name: name.to_string(),
            encoding: encoding.to_string(),
            data: data.to_vec(),
        };
        if let Some(&id) = self.schemas.get_by_left(&key) {
            return Ok(id);
        }
        if self.next_schema_id == 0 || self.next_schema_id > u16::MAX as u32 {
            return Err(McapError::TooManySchemas);
        }
        let id = self.next_schema_id as u16;
        self.next_schema_id += 1;
        self.schemas.insert(key, id);
        self.schema_values.insert(
            id,
            Arc::new(Schema {
                id,
                name: name.to_string(),
                encoding: encoding.to_string(),
                data: Cow::Owned(data.to_vec()),
            }),
        );
        Ok(id)
    }

    /// Registers a channel, deduplicating identical re-registration, and
    /// returns its id. `schema_id` of `0` means no schema.
    pub fn add_channel(
        &mut self,
        schema_id: u16,
        topic: &str,
        message_encoding: &str,
        metadata: &BTreeMap<String, String>,
    ) -> McapResult<u16> {
        self.ensure_started()?;
        if schema_id != 0 && !self.schema_values.contains_key(&schema_id) {
            return Err(McapError::UnknownSchema(topic.to_string(), schema_id));
        }
        let key = ChannelKey {
            schema_id,
            topic: topic.to_string(),
            message_encoding: message_encoding.to_string(),
            metadata: metadata.clone(),
        };
        if let Some(&id) = self.channels.get_by_left(&key) {
            return Ok(id);
        }
        if self.next_channel_id > u16::MAX as u32 {
            return Err(McapError::TooManyChannels);
        }
        let id = self.next_channel_id as u16;
        self.next_channel_id += 1;
        self.channels.insert(key, id);
        self.channel_values.insert(
            id,
            Arc::new(Channel {
                id,
                topic: topic.to_string(),
                schema: self.schema_values.get(&schema_id).cloned(),
                message_encoding: message_encoding.to_string(),
                metadata: metadata.clone(),
            }),
        );
        Ok(id)
    }

    /// Writes a message, auto-registering its channel's schema/channel
    /// records on first use this epoch (spec §4.5.4). `message.channel` must
    /// have been obtained from [`Self::add_channel`]'s returned id (looked
    /// up by id, not by equality of content).
    pub fn write(&mut self, message: &crate::Message) -> McapResult<()> {
        let header = records::MessageHeader {
            channel_id: message.channel.id,
            sequence: message.sequence,
            log_time: message.log_time,
            publish_time: message.publish_time,
        };
        self.write_to_known_channel(&header, &message.data)
    }

    /// Writes a message directly from its header fields, without requiring
    /// an owned [`crate::Message`]/[`Channel`] pairing.
    pub fn write_to_known_channel(
        &mut self,
        header: &records::MessageHeader,
        data: &[u8],
    ) -> McapResult<()> {
        self.ensure_started()?;
        let channel_id = header.channel_id;
        if !self.channel_values.contains_key(&channel_id) {
            return Err(McapError::UnknownChannel(header.sequence, channel_id));
        }

        if self.options.use_chunks {
            self.chunk.get_or_insert_with(ChunkState::new);
        }
        self.ensure_emitted(channel_id)?;

        if self.options.use_statistics {
            self.message_count += 1;
            *self.channel_message_counts.entry(channel_id).or_insert(0) += 1;
            self.message_bounds = Some(match self.message_bounds {
                None => (header.log_time, header.log_time),
                Some((start, end)) => (start.min(header.log_time), end.max(header.log_time)),
            });
        }

        let content = serialize_message(header, data)?;

        if self.options.use_chunks {
            let chunk = self.chunk.as_mut().expect("chunk created above");
            let offset = chunk.payload.length() as u64;
            if self.options.use_message_index {
                chunk.builder.add_message(channel_id, header.log_time, offset);
            }
            chunk.payload.write_all(&content)?;

            let exceeded = self
                .options
                .chunk_size
                .is_some_and(|limit| chunk.payload.length() as u64 > limit);
            if exceeded {
                self.finish_chunk()?;
            }
        } else {
            let sink = self.sink.as_mut().ok_or(McapError::WriterNotStarted)?;
            emit(sink, op::MESSAGE, &content)?;
        }

        Ok(())
    }

    /// Emits `channel_id`'s schema (if any and not yet emitted) and the
    /// channel record itself, if not already emitted in the current epoch
    /// (the active chunk, or the top-level stream when not chunking).
    fn ensure_emitted(&mut self, channel_id: u16) -> McapResult<()> {
        let already = if self.options.use_chunks {
            self.chunk
                .as_ref()
                .is_some_and(|c| c.emitted_channels.contains(&channel_id))
        } else {
            self.emitted_channels.contains(&channel_id)
        };
        if already {
            return Ok(());
        }

        let channel = self
            .channel_values
            .get(&channel_id)
            .cloned()
            .expect("checked present by caller");

        if let Some(schema) = &channel.schema {
            let schema_emitted = if self.options.use_chunks {
                self.chunk
                    .as_ref()
                    .is_some_and(|c| c.emitted_schemas.contains(&schema.id))
            } else {
                self.emitted_schemas.contains(&schema.id)
            };
            if !schema_emitted {
                let header = records::SchemaHeader {
                    id: schema.id,
                    name: schema.name.clone(),
                    encoding: schema.encoding.clone(),
                };
                let content = serialize_schema(&header, &schema.data)?;
                self.emit_to_epoch(op::SCHEMA, &content)?;
                self.mark_emitted_schema(schema.id);
            }
        }

        let record = records::Channel {
            id: channel.id,
            schema_id: channel.schema.as_ref().map(|s| s.id).unwrap_or(0),
            topic: channel.topic.clone(),
            message_encoding: channel.message_encoding.clone(),
            metadata: channel.metadata.clone(),
        };
        let content = serialize(&record)?;
        self.emit_to_epoch(op::CHANNEL, &content)?;
        self.mark_emitted_channel(channel_id);
        Ok(())
    }

    fn emit_to_epoch(&mut self, opcode: u8, content: &[u8]) -> McapResult<()> {
        if self.options.use_chunks {
            let chunk = self.chunk.as_mut().expect("chunk created by caller");
            emit(&mut chunk.payload, opcode, content)
        } else {
            let sink = self.sink.as_mut().ok_or(McapError::WriterNotStarted)?;
            emit(sink, opcode, content)
        }
    }

    fn mark_emitted_schema(&mut self, schema_id: u16) {
        if self.options.use_chunks {
            self.chunk.as_mut().unwrap().emitted_schemas.insert(schema_id);
        } else {
            self.emitted_schemas.insert(schema_id);
        }
    }

    fn mark_emitted_channel(&mut self, channel_id: u16) {
        if self.options.use_chunks {
            let chunk = self.chunk.as_mut().unwrap();
            chunk.emitted_channels.insert(channel_id);
            chunk.builder.add_channel(channel_id);
        } else {
            self.emitted_channels.insert(channel_id);
        }
    }

    /// Finalizes the in-progress chunk, if any (spec §4.5.5). A no-op if no
    /// chunk is open.
    pub fn finish_chunk(&mut self) -> McapResult<()> {
        let Some(chunk) = self.chunk.take() else {
            return Ok(());
        };
        let (start_time, end_time) = chunk.builder.bounds().unwrap_or((0, 0));
        let indexes = chunk.builder.into_indexes();
        let uncompressed = chunk.payload.into_inner();
        let uncompressed_size = uncompressed.len() as u64;
        let uncompressed_crc = crc32fast::hash(&uncompressed);

        let (compression_name, compressed) = match self.options.compression {
            Some(c) => (c.name().to_string(), compress(&uncompressed, c)?),
            None => (String::new(), uncompressed),
        };
        let compressed_size = compressed.len() as u64;

        let sink = self.sink.as_mut().ok_or(McapError::WriterNotStarted)?;
        let chunk_start_offset = sink.get_mut().stream_position()?;
        let header = records::ChunkHeader {
            message_start_time: start_time,
            message_end_time: end_time,
            uncompressed_size,
            uncompressed_crc,
            compression: compression_name.clone(),
            compressed_size,
        };
        emit(sink, op::CHUNK, &serialize_chunk(&header, &compressed)?)?;

        let message_index_start = sink.get_mut().stream_position()?;
        let mut message_index_offsets = BTreeMap::new();
        if self.options.use_message_index {
            for (channel_id, entries) in &indexes {
                let offset = sink.get_mut().stream_position()?;
                message_index_offsets.insert(*channel_id, offset);
                let record = records::MessageIndex {
                    channel_id: *channel_id,
                    records: entries.clone(),
                };
                emit(sink, op::MESSAGE_INDEX, &serialize(&record)?)?;
            }
        }
        let message_index_length = sink.get_mut().stream_position()? - message_index_start;

        self.chunk_count += 1;
        if self.options.use_chunk_index {
            self.chunk_indexes.push(records::ChunkIndex {
                message_start_time: start_time,
                message_end_time: end_time,
                chunk_start_offset,
                chunk_length: message_index_start - chunk_start_offset,
                message_index_offsets,
                message_index_length,
                compression: compression_name,
                compressed_size,
                uncompressed_size,
            });
        }

        Ok(())
    }

    /// Begins a streamed attachment; declare its total byte length upfront,
    /// since the attachment's internal length prefix precedes its data and
    /// cannot be deferred the way the outer record length can.
    pub fn start_attachment(
        &mut self,
        log_time: u64,
        create_time: u64,
        name: &str,
        media_type: &str,
        data_len: u64,
    ) -> McapResult<()> {
        self.ensure_started()?;
        if self.current_attachment.is_some() {
            return Err(McapError::AttachmentAlreadyInProgress);
        }

        let header = records::AttachmentHeader {
            log_time,
            create_time,
            name: name.to_string(),
            media_type: media_type.to_string(),
        };
        let header_bytes = serialize(&header)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header_bytes);
        hasher.update(&data_len.to_le_bytes());

        let sink = self.sink.as_mut().ok_or(McapError::WriterNotStarted)?;
        let record_start = sink.get_mut().stream_position()?;
        op_and_len(sink, op::ATTACHMENT, 0)?;
        let content_start = sink.get_mut().stream_position()?;
        sink.write_all(&header_bytes)?;
        sink.write_all(&data_len.to_le_bytes())?;

        self.current_attachment = Some(InProgressAttachment {
            record_start,
            len_field_pos: record_start + 1,
            content_start,
            expected_len: data_len,
            written: 0,
            hasher,
            log_time,
            create_time,
            name: name.to_string(),
            media_type: media_type.to_string(),
        });
        Ok(())
    }

    /// Appends to the in-progress attachment's data.
    pub fn put_attachment_bytes(&mut self, bytes: &[u8]) -> McapResult<()> {
        let remaining = {
            let att = self
                .current_attachment
                .as_ref()
                .ok_or(McapError::AttachmentNotInProgress)?;
            att.expected_len - att.written
        };
        if bytes.len() as u64 > remaining {
            let att = self.current_attachment.as_ref().unwrap();
            return Err(McapError::AttachmentTooLarge {
                excess: bytes.len() as u64 - remaining,
                attachment_length: att.expected_len,
            });
        }
        let sink = self.sink.as_mut().ok_or(McapError::WriterNotStarted)?;
        sink.write_all(bytes)?;
        let att = self.current_attachment.as_mut().unwrap();
        att.hasher.update(bytes);
        att.written += bytes.len() as u64;
        Ok(())
    }

    /// Completes the in-progress attachment, patching its record length and
    /// recording an index entry if enabled.
    pub fn finish_attachment(&mut self) -> McapResult<()> {
        let att = self
            .current_attachment
            .take()
            .ok_or(McapError::AttachmentNotInProgress)?;
        if att.written != att.expected_len {
            return Err(McapError::AttachmentIncomplete {
                expected: att.expected_len,
                current: att.written,
            });
        }
        let crc = att.hasher.finalize();
        let sink = self.sink.as_mut().ok_or(McapError::WriterNotStarted)?;
        sink.write_all(&crc.to_le_bytes())?;
        patch_length(sink, att.len_field_pos, att.content_start)?;

        self.attachment_count += 1;
        if self.options.use_attachment_index {
            let end = sink.get_mut().stream_position()?;
            self.attachment_indexes.push(records::AttachmentIndex {
                offset: att.record_start,
                length: end - att.record_start,
                log_time: att.log_time,
                create_time: att.create_time,
                data_size: att.expected_len,
                name: att.name,
                media_type: att.media_type,
            });
        }
        Ok(())
    }

    /// Writes a complete [`Attachment`] in one call.
    pub fn attach(&mut self, attachment: &Attachment) -> McapResult<()> {
        self.start_attachment(
            attachment.log_time,
            attachment.create_time,
            &attachment.name,
            &attachment.media_type,
            attachment.data.len() as u64,
        )?;
        self.put_attachment_bytes(&attachment.data)?;
        self.finish_attachment()
    }

    /// Writes a Metadata record directly to the sink.
    pub fn write_metadata(&mut self, name: &str, metadata: &BTreeMap<String, String>) -> McapResult<()> {
        self.ensure_started()?;
        let record = records::Metadata {
            name: name.to_string(),
            metadata: metadata.clone(),
        };
        let sink = self.sink.as_mut().ok_or(McapError::WriterNotStarted)?;
        let record_start = sink.get_mut().stream_position()?;
        emit(sink, op::METADATA, &serialize(&record)?)?;

        self.metadata_count += 1;
        if self.options.use_metadata_index {
            let end = sink.get_mut().stream_position()?;
            self.metadata_indexes.push(records::MetadataIndex {
                offset: record_start,
                length: end - record_start,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn flush(&mut self) -> McapResult<()> {
        let sink = self.sink.as_mut().ok_or(McapError::WriterNotStarted)?;
        sink.flush()?;
        Ok(())
    }

    fn ensure_started(&self) -> McapResult<()> {
        if self.finished || self.sink.is_none() {
            return Err(McapError::WriterNotStarted);
        }
        Ok(())
    }

    /// Finalizes any pending chunk, emits DataEnd and the full summary
    /// section, and emits the Footer and trailing magic (spec §4.5.6).
    /// Idempotent: calling this more than once is a no-op after the first.
    pub fn finish(&mut self) -> McapResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finish_chunk()?;

        let Some(sink) = self.sink.take() else {
            self.finished = true;
            return Ok(());
        };
        let (mut raw, crc) = sink.finalize();
        let data_section_crc = if self.track_data_crc { crc } else { 0 };
        emit(
            &mut raw,
            op::DATA_END,
            &serialize(&records::DataEnd { data_section_crc })?,
        )?;

        let summary_start = raw.stream_position()?;
        let mut summary_buf: Vec<u8> = Vec::new();
        let mut offsets: Vec<records::SummaryOffset> = Vec::new();

        if self.options.repeat_schemas {
            push_group(&mut summary_buf, &mut offsets, summary_start, op::SCHEMA, |buf| {
                for schema in self.schema_values.values() {
                    let header = records::SchemaHeader {
                        id: schema.id,
                        name: schema.name.clone(),
                        encoding: schema.encoding.clone(),
                    };
                    emit(buf, op::SCHEMA, &serialize_schema(&header, &schema.data)?)?;
                }
                Ok(())
            })?;
        }

        if self.options.repeat_channels {
            push_group(&mut summary_buf, &mut offsets, summary_start, op::CHANNEL, |buf| {
                for channel in self.channel_values.values() {
                    let record = records::Channel {
                        id: channel.id,
                        schema_id: channel.schema.as_ref().map(|s| s.id).unwrap_or(0),
                        topic: channel.topic.clone(),
                        message_encoding: channel.message_encoding.clone(),
                        metadata: channel.metadata.clone(),
                    };
                    emit(buf, op::CHANNEL, &serialize(&record)?)?;
                }
                Ok(())
            })?;
        }

        if self.options.use_statistics {
            push_group(
                &mut summary_buf,
                &mut offsets,
                summary_start,
                op::STATISTICS,
                |buf| {
                    let stats = records::Statistics {
                        message_count: self.message_count,
                        schema_count: self.schema_values.len() as u16,
                        channel_count: self.channel_values.len() as u32,
                        attachment_count: self.attachment_count,
                        metadata_count: self.metadata_count,
                        chunk_count: self.chunk_count,
                        message_start_time: self.message_bounds.map(|(s, _)| s).unwrap_or(0),
                        message_end_time: self.message_bounds.map(|(_, e)| e).unwrap_or(0),
                        channel_message_counts: self.channel_message_counts.clone(),
                    };
                    emit(buf, op::STATISTICS, &serialize(&stats)?)
                },
            )?;
        }

        if self.options.use_metadata_index {
            push_group(
                &mut summary_buf,
                &mut offsets,
                summary_start,
                op::METADATA_INDEX,
                |buf| {
                    for idx in &self.metadata_indexes {
                        emit(buf, op::METADATA_INDEX, &serialize(idx)?)?;
                    }
                    Ok(())
                },
            )?;
        }

        if self.options.use_attachment_index {
            push_group(
                &mut summary_buf,
                &mut offsets,
                summary_start,
                op::ATTACHMENT_INDEX,
                |buf| {
                    for idx in &self.attachment_indexes {
                        emit(buf, op::ATTACHMENT_INDEX, &serialize(idx)?)?;
                    }
                    Ok(())
                },
            )?;
        }

        if self.options.use_chunk_index {
            push_group(
                &mut summary_buf,
                &mut offsets,
                summary_start,
                op::CHUNK_INDEX,
                |buf| {
                    for idx in &self.chunk_indexes {
                        emit(buf, op::CHUNK_INDEX, &serialize(idx)?)?;
                    }
                    Ok(())
                },
            )?;
        }

        let offsets_region_start = summary_start + summary_buf.len() as u64;
        if self.options.use_summary_offsets {
            for off in &offsets {
                emit(&mut summary_buf, op::SUMMARY_OFFSET, &serialize(off)?)?;
            }
        }

        let footer_summary_start = if summary_buf.is_empty() { 0 } else { summary_start };
        let footer_summary_offset_start = if self.options.use_summary_offsets && !offsets.is_empty() {
            offsets_region_start
        } else {
            0
        };

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&summary_buf);
        let mut prefix = Vec::with_capacity(17);
        prefix.push(op::FOOTER);
        prefix.extend_from_slice(&20u64.to_le_bytes());
        prefix.extend_from_slice(&footer_summary_start.to_le_bytes());
        prefix.extend_from_slice(&footer_summary_offset_start.to_le_bytes());
        hasher.update(&prefix);
        let summary_crc = hasher.finalize();

        raw.write_all(&summary_buf)?;

        let footer = records::Footer {
            summary_start: footer_summary_start,
            summary_offset_start: footer_summary_offset_start,
            summary_crc,
        };
        emit(&mut raw, op::FOOTER, &serialize(&footer)?)?;
        raw.write_all(MAGIC)?;
        raw.flush()?;

        self.finished = true;
        Ok(())
    }

    /// Opens a writer to append onto an existing, indexed MCAP file (spec
    /// §4.5.7). `existing` is the complete current file contents, used to
    /// ingest its summary; `sink` is positioned and truncated to the
    /// original data end before any new records are written.
    pub fn create_appending(
        existing: &[u8],
        mut sink: W,
        mut options: WriteOptions,
    ) -> McapResult<Writer<W>>
    where
        W: SeekableSink,
    {
        let summary = crate::indexed_reader::Summary::read(existing)?
            .ok_or(McapError::CannotAppendUnindexed)?;

        sink.seek(std::io::SeekFrom::Start(summary.data_end_offset))?;
        sink.truncate()?;

        if summary.stats.is_none() {
            options.use_statistics = false;
        }

        let track_data_crc = summary.data_section_crc != 0;
        let sink = CountingCrcWriter::resume(sink, summary.data_end_offset, summary.data_section_crc);

        let mut schemas = BiHashMap::new();
        for schema in summary.schemas.values() {
            schemas.insert(
                SchemaKey {
                    name: schema.name.clone(),
                    encoding: schema.encoding.clone(),
                    data: schema.data.to_vec(),
                },
                schema.id,
            );
        }
        let mut channels = BiHashMap::new();
        for channel in summary.channels.values() {
            channels.insert(
                ChannelKey {
                    schema_id: channel.schema.as_ref().map(|s| s.id).unwrap_or(0),
                    topic: channel.topic.clone(),
                    message_encoding: channel.message_encoding.clone(),
                    metadata: channel.metadata.clone(),
                },
                channel.id,
            );
        }

        let next_schema_id = summary.schemas.keys().next_back().map(|&id| id as u32 + 1).unwrap_or(1);
        let next_channel_id = summary
            .channels
            .keys()
            .next_back()
            .map(|&id| id as u32 + 1)
            .unwrap_or(options.start_channel_id as u32);

        Ok(Writer {
            sink: Some(sink),
            schema_values: summary.schemas.clone(),
            channel_values: summary.channels.clone(),
            emitted_schemas: summary.schemas.keys().copied().collect(),
            emitted_channels: summary.channels.keys().copied().collect(),
            schemas,
            channels,
            next_schema_id,
            next_channel_id,
            chunk: None,
            chunk_indexes: summary.chunk_indexes.clone(),
            attachment_indexes: summary.attachment_indexes.clone(),
            metadata_indexes: summary.metadata_indexes.clone(),
            message_bounds: summary.stats.as_ref().map(|s| (s.message_start_time, s.message_end_time)),
            message_count: summary.stats.as_ref().map(|s| s.message_count).unwrap_or(0),
            channel_message_counts: summary
                .stats
                .as_ref()
                .map(|s| s.channel_message_counts.clone())
                .unwrap_or_default(),
            attachment_count: summary.attachment_indexes.len() as u32,
            metadata_count: summary.metadata_indexes.len() as u32,
            chunk_count: summary.chunk_indexes.len() as u32,
            track_data_crc,
            current_attachment: None,
            finished: false,
            options,
        })
    }
}

impl<W: Write + Seek> Drop for Writer<W> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

fn push_group(
    summary_buf: &mut Vec<u8>,
    offsets: &mut Vec<records::SummaryOffset>,
    summary_start: u64,
    opcode: u8,
    write_records: impl FnOnce(&mut Vec<u8>) -> McapResult<()>,
) -> McapResult<()> {
    let start_len = summary_buf.len();
    write_records(summary_buf)?;
    if summary_buf.len() > start_len {
        offsets.push(records::SummaryOffset {
            group_opcode: opcode,
            group_start: summary_start + start_len as u64,
            group_length: (summary_buf.len() - start_len) as u64,
        });
    }
    Ok(())
}

fn emit<T: Write>(w: &mut T, opcode: u8, content: &[u8]) -> McapResult<()> {
    op_and_len(w, opcode, content.len() as u64)?;
    w.write_all(content)?;
    Ok(())
}

fn serialize<T>(value: &T) -> McapResult<Vec<u8>>
where
    T: binrw::BinWrite,
    for<'a> T::Args<'a>: Default,
{
    let mut buf = Vec::new();
    {
        let mut cur = std::io::Cursor::new(&mut buf);
        value.write_le(&mut cur)?;
    }
    Ok(buf)
}

fn serialize_schema(header: &records::SchemaHeader, data: &[u8]) -> McapResult<Vec<u8>> {
    let mut buf = serialize(header)?;
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
    Ok(buf)
}

fn serialize_message(header: &records::MessageHeader, data: &[u8]) -> McapResult<Vec<u8>> {
    let mut buf = serialize(header)?;
    buf.extend_from_slice(data);
    Ok(buf)
}

fn serialize_chunk(header: &records::ChunkHeader, compressed: &[u8]) -> McapResult<Vec<u8>> {
    let mut buf = serialize(header)?;
    buf.extend_from_slice(compressed);
    Ok(buf)
}

fn compress(data: &[u8], compression: Compression) -> McapResult<Vec<u8>> {
    match compression {
        #[cfg(feature = "zstd")]
        Compression::Zstd => Ok(zstd::stream::encode_all(data, 0)?),
        #[cfg(feature = "lz4")]
        Compression::Lz4 => {
            let mut encoder = lz4::EncoderBuilder::new().build(Vec::new())?;
            std::io::Write::write_all(&mut encoder, data)?;
            let (buf, result) = encoder.finish();
            result?;
            Ok(buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn writes_messages_on_a_registered_channel() {
        let mut writer = WriteOptions::new()
            .create(Cursor::new(Vec::new()))
            .unwrap();
        let schema_id = writer.add_schema("s", "jsonschema", b"{}").unwrap();
        let channel_id = writer
            .add_channel(schema_id, "/topic", "json", &BTreeMap::new())
            .unwrap();
        let channel = Arc::new(Channel {
            id: channel_id,
            topic: "/topic".into(),
            schema: writer.schema_values.get(&schema_id).cloned(),
            message_encoding: "json".into(),
            metadata: BTreeMap::new(),
        });
        for i in 0..3u32 {
            writer
                .write(&crate::Message {
                    channel: channel.clone(),
                    sequence: i,
                    log_time: i as u64,
                    publish_time: i as u64,
                    data: Cow::Owned(b"{}".to_vec()),
                })
                .unwrap();
        }
        assert_eq!(writer.message_count, 3);
        writer.finish().unwrap();
        assert!(writer.sink.is_none());
    }

    #[test]
    fn assigns_sequential_ids() {
        let mut writer = WriteOptions::new()
            .use_chunks(false)
            .create(Cursor::new(Vec::new()))
            .unwrap();
        let s1 = writer.add_schema("a", "enc", b"1").unwrap();
        let s2 = writer.add_schema("b", "enc", b"2").unwrap();
        let s1_again = writer.add_schema("a", "enc", b"1").unwrap();
        assert_eq!(s1, 1);
        assert_eq!(s2, 2);
        assert_eq!(s1_again, s1);
    }

    #[test]
    fn rejects_unknown_schema_for_channel() {
        let mut writer = WriteOptions::new()
            .use_chunks(false)
            .create(Cursor::new(Vec::new()))
            .unwrap();
        let err = writer
            .add_channel(42, "/topic", "json", &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, McapError::UnknownSchema(_, 42)));
    }

    #[test]
    fn finish_is_idempotent() {
        let mut writer = WriteOptions::new()
            .use_chunks(false)
            .create(Cursor::new(Vec::new()))
            .unwrap();
        writer.finish().unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn attachment_rejects_overflowing_bytes() {
        let mut writer = WriteOptions::new()
            .use_chunks(false)
            .create(Cursor::new(Vec::new()))
            .unwrap();
        writer.start_attachment(0, 0, "a", "text/plain", 2).unwrap();
        let err = writer.put_attachment_bytes(b"abc").unwrap_err();
        assert!(matches!(err, McapError::AttachmentTooLarge { .. }));
    }
}
