//! A library for reading and writing [MCAP](https://mcap.dev) files: a
//! self-describing, binary container format for heterogeneous, timestamped
//! log data, designed for multi-gigabyte recordings from robotics and
//! similar systems.
//!
//! The core data model is four kinds of domain records layered on top of a
//! length-prefixed, opcode-tagged byte stream (see [`records`] for the wire
//! shapes and [`Record`](records::Record) for the decoded form):
//!
//! - [`Schema`]: a named, encoded description of a message's shape.
//! - [`Channel`]: a named, encoded stream of messages, optionally tied to a
//!   schema.
//! - [`Message`]: one timestamped blob of data on a channel.
//! - [`Attachment`]: an arbitrary named blob not tied to any channel.
//!
//! [`write::Writer`] produces files; [`read::LinearReader`] consumes them
//! forward-only; [`indexed_reader::Summary`] ingests a file's index and
//! supports random-access, time-ordered iteration.

use std::{borrow::Cow, collections::BTreeMap, sync::Arc};

pub mod buffer;
pub mod channels;
pub(crate) mod chunk_builder;
pub mod error;
pub mod indexed_reader;
pub mod io;
pub mod read;
pub mod records;
pub mod write;

pub use error::{McapError, McapResult};
pub use indexed_reader::{ReadMessageOptions, Summary};
pub use write::{WriteOptions, Writer};

/// The eight magic bytes that open and close every MCAP file (spec §3).
pub const MAGIC: &[u8; 8] = b"\x89MCAP0\r\n";

/// A named, encoded description of the shape of messages on one or more
/// channels (spec §3, "Schema").
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub id: u16,
    pub name: String,
    pub encoding: String,
    pub data: Cow<'static, [u8]>,
}

/// A named stream of messages, optionally typed by a [`Schema`] (spec §3,
/// "Channel").
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: u16,
    pub topic: String,
    pub schema: Option<Arc<Schema>>,
    pub message_encoding: String,
    pub metadata: BTreeMap<String, String>,
}

/// One timestamped message on a [`Channel`] (spec §3, "Message").
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub channel: Arc<Channel>,
    pub sequence: u32,
    pub log_time: u64,
    pub publish_time: u64,
    pub data: Cow<'static, [u8]>,
}

/// An arbitrary named blob, not associated with any channel (spec §3,
/// "Attachment").
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub log_time: u64,
    pub create_time: u64,
    pub name: String,
    pub media_type: String,
    pub data: Cow<'static, [u8]>,
}

/// The compression algorithms a chunk may be written with (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    #[cfg(feature = "zstd")]
    Zstd,
    #[cfg(feature = "lz4")]
    Lz4,
}

impl Compression {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            #[cfg(feature = "zstd")]
            Compression::Zstd => "zstd",
            #[cfg(feature = "lz4")]
            Compression::Lz4 => "lz4",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_is_eight_bytes() {
        assert_eq!(MAGIC.len(), 8);
        assert_eq!(MAGIC[0], 0x89);
        assert_eq!(&MAGIC[1..], b"MCAP0\r\n");
    }
}
