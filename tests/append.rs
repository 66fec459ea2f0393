use std::{
    borrow::Cow,
    collections::BTreeMap,
    fs::OpenOptions,
    sync::Arc,
};

use anyhow::Result;
use mcap::{io::FileSink, Channel, Message, WriteOptions};
use tempfile::NamedTempFile;

fn channel(id: u16) -> Arc<Channel> {
    Arc::new(Channel {
        id,
        topic: "/topic".into(),
        schema: None,
        message_encoding: "json".into(),
        metadata: BTreeMap::new(),
    })
}

#[test]
fn appending_resumes_ids_and_extends_the_data_section() -> Result<()> {
    let tmp = NamedTempFile::new()?;
    let path = tmp.path().to_path_buf();

    {
        let mut file = OpenOptions::new().write(true).read(true).open(&path)?;
        let mut writer = WriteOptions::new().create(FileSink(&mut file))?;
        let channel_id = writer.add_channel(0, "/topic", "json", &BTreeMap::new())?;
        let ch = channel(channel_id);
        for i in 0..5u32 {
            writer.write(&Message {
                channel: ch.clone(),
                sequence: i,
                log_time: i as u64,
                publish_time: i as u64,
                data: Cow::Owned(b"{}".to_vec()),
            })?;
        }
        writer.finish()?;
    }

    let existing = std::fs::read(&path)?;

    {
        let mut file = OpenOptions::new().write(true).read(true).open(&path)?;
        let mut writer =
            mcap::Writer::create_appending(&existing, FileSink(&mut file), WriteOptions::new())?;
        // Re-declaring the same channel content should resolve to the same id,
        // not allocate a fresh one.
        let channel_id = writer.add_channel(0, "/topic", "json", &BTreeMap::new())?;
        let ch = channel(channel_id);
        for i in 5..8u32 {
            writer.write(&Message {
                channel: ch.clone(),
                sequence: i,
                log_time: i as u64,
                publish_time: i as u64,
                data: Cow::Owned(b"{}".to_vec()),
            })?;
        }
        writer.finish()?;
    }

    let full = std::fs::read(&path)?;
    let summary = mcap::Summary::read(&full)?.expect("file should be indexed");
    assert_eq!(summary.stats.as_ref().unwrap().message_count, 8);
    assert_eq!(summary.channels.len(), 1);

    let messages: Result<Vec<Message>, _> = summary
        .read_messages(&full, &mcap::ReadMessageOptions::default())?
        .collect();
    let messages = messages?;
    assert_eq!(messages.len(), 8);
    for (i, m) in messages.iter().enumerate() {
        assert_eq!(m.log_time, i as u64);
    }
    Ok(())
}
