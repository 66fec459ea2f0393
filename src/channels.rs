//! Wires decoded [`records::SchemaHeader`]/[`records::Channel`] records
//! together into owned [`Schema`]/[`Channel`] values, rejecting conflicting
//! re-declarations of the same id (spec §3, "Channel" invariant).

use std::{borrow::Cow, collections::HashMap, sync::Arc};

use crate::{records, Channel, McapError, McapResult, Schema};

/// Accumulates schemas and channels seen while reading, deduplicating
/// identical re-declarations by returning the existing `Arc` instead of
/// allocating a new one.
#[derive(Debug, Default)]
pub struct ChannelAccumulator {
    pub(crate) schemas: HashMap<u16, Arc<Schema>>,
    pub(crate) channels: HashMap<u16, Arc<Channel>>,
}

impl ChannelAccumulator {
    /// Register a schema, to be referenced by later channels. Call before
    /// [`Self::add_channel`] for channels that reference it.
    pub fn add_schema(&mut self, header: records::SchemaHeader, data: Cow<'_, [u8]>) -> McapResult<()> {
        if header.id == 0 {
            return Err(McapError::InvalidSchemaId);
        }

        let schema = Schema {
            id: header.id,
            name: header.name,
            encoding: header.encoding,
            data: Cow::Owned(data.into_owned()),
        };

        if let Some(preexisting) = self.schemas.get(&header.id) {
            if **preexisting != schema {
                return Err(McapError::ConflictingSchemas(schema.name));
            }
            return Ok(());
        }

        self.schemas.insert(header.id, Arc::new(schema));
        Ok(())
    }

    /// Register a channel, wiring it up to its previously-registered schema.
    pub fn add_channel(&mut self, chan: records::Channel) -> McapResult<()> {
        let schema = if chan.schema_id == 0 {
            None
        } else {
            match self.schemas.get(&chan.schema_id) {
                Some(s) => Some(s.clone()),
                None => return Err(McapError::UnknownSchema(chan.topic, chan.schema_id)),
            }
        };

        let channel = Channel {
            id: chan.id,
            topic: chan.topic.clone(),
            schema,
            message_encoding: chan.message_encoding,
            metadata: chan.metadata,
        };

        if let Some(preexisting) = self.channels.get(&chan.id) {
            if **preexisting != channel {
                return Err(McapError::ConflictingChannels(chan.topic));
            }
            return Ok(());
        }

        self.channels.insert(chan.id, Arc::new(channel));
        Ok(())
    }

    pub fn get(&self, chan_id: u16) -> Option<Arc<Channel>> {
        self.channels.get(&chan_id).cloned()
    }

    pub fn get_schema(&self, schema_id: u16) -> Option<Arc<Schema>> {
        self.schemas.get(&schema_id).cloned()
    }

    pub fn channels(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.channels.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reinserting_identical_schema_reuses_the_arc() {
        let mut accumulator = ChannelAccumulator::default();
        let header = records::SchemaHeader {
            id: 1,
            name: "great_schema".into(),
            encoding: "great_encoding".into(),
        };
        accumulator.add_schema(header.clone(), Cow::from(vec![])).unwrap();
        let first = accumulator.schemas.get(&1).unwrap().clone();
        accumulator.add_schema(header, Cow::from(vec![])).unwrap();
        let second = accumulator.schemas.get(&1).unwrap().clone();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn conflicting_channel_redeclaration_errors() {
        let mut accumulator = ChannelAccumulator::default();
        accumulator
            .add_channel(records::Channel {
                id: 1,
                schema_id: 0,
                topic: "a".into(),
                message_encoding: "json".into(),
                metadata: Default::default(),
            })
            .unwrap();
        let err = accumulator
            .add_channel(records::Channel {
                id: 1,
                schema_id: 0,
                topic: "b".into(),
                message_encoding: "json".into(),
                metadata: Default::default(),
            })
            .unwrap_err();
        assert!(matches!(err, McapError::ConflictingChannels(_)));
    }
}
