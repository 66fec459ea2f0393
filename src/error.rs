//! Error types returned by this crate.

use thiserror::Error;

/// The result type returned by fallible operations in this crate.
pub type McapResult<T> = Result<T, McapError>;

/// All failure modes that can occur while reading or writing an MCAP file.
#[derive(Error, Debug)]
pub enum McapError {
    #[error("Bad magic number")]
    BadMagic,
    #[error("Footer record is not the right length")]
    BadFooterLength,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] binrw::Error),
    #[error("record of opcode 0x{0:02X} too short")]
    RecordTooShort(u8),
    #[error("record content length ({length}) exceeds the enclosing view ({limit})")]
    RecordTooLarge { length: u64, limit: u64 },
    #[error("schema declares {header} bytes of data, but only {available} remain")]
    BadSchemaLength { header: u32, available: u32 },
    #[error("chunk declares {header} compressed bytes, but only {available} remain")]
    BadChunkLength { header: u64, available: u64 },
    #[error("attachment declares {header} bytes of data, but only {available} remain")]
    BadAttachmentLength { header: u64, available: u64 },
    #[error("string field is not valid UTF-8")]
    StringEncoding(#[from] std::str::Utf8Error),
    #[error("map contains a duplicate key")]
    DuplicateMapKey,
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("unknown opcode 0x{0:02X} found inside a chunk")]
    UnknownOpcodeInChunk(u8),
    #[error("data-section record found in the summary section")]
    DataRecordInSummary,
    #[error("summary CRC mismatch: expected {saved:08X}, computed {computed:08X}")]
    BadSummaryCrc { saved: u32, computed: u32 },
    #[error("chunk CRC mismatch: expected {saved:08X}, computed {computed:08X}")]
    BadChunkCrc { saved: u32, computed: u32 },
    #[error("attachment CRC mismatch: expected {saved:08X}, computed {computed:08X}")]
    BadAttachmentCrc { saved: u32, computed: u32 },
    #[error("data section CRC mismatch: expected {saved:08X}, computed {computed:08X}")]
    BadDataSectionCrc { saved: u32, computed: u32 },
    #[error("chunk index timestamps [{index_start}, {index_end}] disagree with its messages")]
    ChunkIndexTimesDisagree { index_start: u64, index_end: u64 },
    #[error("message at offset {offset} has log_time {actual}, but its index entry says {expected}")]
    MessageIndexMismatch {
        offset: u64,
        expected: u64,
        actual: u64,
    },
    #[error("channel {0} was redeclared with conflicting content")]
    ConflictingChannels(String),
    #[error("schema {0} was redeclared with conflicting content")]
    ConflictingSchemas(String),
    #[error("chunk claims zero message index length but nonzero time range [{0}, {1}]")]
    InvalidEmptyChunk(u64, u64),
    #[error("no decompressor registered for compression {0:?}")]
    UnsupportedCompression(String),
    #[error("message on channel {1} has unknown schema id {0}")]
    UnknownSchema(String, u16),
    #[error("message with sequence {0} references unknown channel id {1}")]
    UnknownChannel(u32, u16),
    #[error("schema id must be nonzero")]
    InvalidSchemaId,
    #[error("too many channels: max 65535 channel ids are supported")]
    TooManyChannels,
    #[error("too many schemas: max 65535 schema ids are supported")]
    TooManySchemas,
    #[error("chunk buffer size {0} overflowed available memory")]
    ChunkBufferTooLarge(u64),
    #[error("duplicate Statistics record found in summary")]
    DuplicateStatistics,
    #[error("file is not indexed: footer summary_start is 0")]
    NotIndexed,
    #[error("file is too small to be a valid MCAP file")]
    TooSmall,
    #[error("attachment is not in progress")]
    AttachmentNotInProgress,
    #[error("an attachment is already in progress; finish it before starting another")]
    AttachmentAlreadyInProgress,
    #[error("attachment exceeds its declared length by {excess} bytes (declared {attachment_length})")]
    AttachmentTooLarge { excess: u64, attachment_length: u64 },
    #[error("attachment incomplete: expected {expected} bytes, wrote {current}")]
    AttachmentIncomplete { expected: u64, current: u64 },
    #[error("writer method called before start() or after end()")]
    WriterNotStarted,
    #[error("cannot append: source file is not indexed")]
    CannotAppendUnindexed,
    #[error("compared a reverse cursor with a forward cursor")]
    MismatchedCursorDirection,
    #[error("called pop_message or has_more_messages before load_message_indexes")]
    MessageIndexesNotLoaded,
}
