//! Accumulates one chunk's message index state (spec §4.4): per-channel
//! `(log_time, offset)` entries and the chunk's min/max `log_time`, using an
//! `Option` to track "no messages yet" rather than a zero sentinel.

use std::collections::BTreeMap;

use crate::records::MessageIndexEntry;

#[derive(Debug, Default)]
pub(crate) struct ChunkBuilder {
    /// `(start, end)` log_time bounds, or `None` if no message has been
    /// added yet. Zero is a valid bound once set.
    bounds: Option<(u64, u64)>,
    indexes: BTreeMap<u16, Vec<MessageIndexEntry>>,
}

impl ChunkBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bounds(&self) -> Option<(u64, u64)> {
        self.bounds
    }

    /// Ensures a (possibly empty) MessageIndex exists for `channel_id`, so
    /// readers see a deterministic set of channels present in the chunk.
    pub(crate) fn add_channel(&mut self, channel_id: u16) {
        self.indexes.entry(channel_id).or_default();
    }

    /// Records that a message for `channel_id` with `log_time` was just
    /// serialized at `offset` within the chunk's payload.
    pub(crate) fn add_message(&mut self, channel_id: u16, log_time: u64, offset: u64) {
        self.bounds = Some(match self.bounds {
            None => (log_time, log_time),
            Some((start, end)) => (start.min(log_time), end.max(log_time)),
        });
        self.indexes
            .entry(channel_id)
            .or_default()
            .push(MessageIndexEntry { log_time, offset });
    }

    pub(crate) fn into_indexes(self) -> BTreeMap<u16, Vec<MessageIndexEntry>> {
        self.indexes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_no_messages_yet_with_zero_log_time() {
        let mut b = ChunkBuilder::new();
        assert_eq!(b.bounds(), None);
        b.add_message(0, 0, 0);
        assert_eq!(b.bounds(), Some((0, 0)));
        b.add_message(0, 42, 10);
        assert_eq!(b.bounds(), Some((0, 42)));
    }

    #[test]
    fn add_channel_creates_empty_index() {
        let mut b = ChunkBuilder::new();
        b.add_channel(7);
        let indexes = b.into_indexes();
        assert_eq!(indexes.get(&7), Some(&Vec::new()));
    }
}
