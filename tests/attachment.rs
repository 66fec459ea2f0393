use std::{borrow::Cow, collections::BTreeMap, io::Cursor};

use anyhow::Result;
use assert_matches::assert_matches;
use mcap::{Attachment, WriteOptions};

#[test]
fn attach_then_read_back() -> Result<()> {
    let mut buf = Vec::new();
    let mut writer = WriteOptions::new().create(Cursor::new(&mut buf))?;

    let attachment = Attachment {
        log_time: 2,
        create_time: 1,
        name: "myFile".into(),
        media_type: "application/octet-stream".into(),
        data: Cow::Owned(vec![1, 2, 3]),
    };
    writer.attach(&attachment)?;
    writer.finish()?;
    drop(writer);

    let summary = mcap::Summary::read(&buf)?.expect("file should be indexed");
    assert_eq!(summary.attachment_indexes.len(), 1);
    assert_eq!(summary.stats.as_ref().unwrap().attachment_count, 1);

    let index = &summary.attachment_indexes[0];
    assert_eq!(index.name, "myFile");
    assert_eq!(index.data_size, 3);

    let read_back = mcap::read::attachment(&buf, index)?;
    assert_eq!(read_back, attachment);
    Ok(())
}

#[test]
fn streamed_attachment_rejects_short_write() -> Result<()> {
    let mut buf = Vec::new();
    let mut writer = WriteOptions::new().create(Cursor::new(&mut buf))?;

    writer.start_attachment(0, 0, "a", "text/plain", 10)?;
    writer.put_attachment_bytes(b"short")?;
    let err = writer.finish_attachment().unwrap_err();
    assert_matches!(err, mcap::McapError::AttachmentIncomplete { expected: 10, current: 5 });
    Ok(())
}

#[test]
fn cannot_start_two_attachments_at_once() -> Result<()> {
    let mut buf = Vec::new();
    let mut writer = WriteOptions::new().create(Cursor::new(&mut buf))?;

    writer.start_attachment(0, 0, "a", "text/plain", 1)?;
    let err = writer.start_attachment(0, 0, "b", "text/plain", 1).unwrap_err();
    assert_matches!(err, mcap::McapError::AttachmentAlreadyInProgress);
    Ok(())
}

#[test]
fn metadata_round_trips_through_its_index() -> Result<()> {
    let mut buf = Vec::new();
    let mut writer = WriteOptions::new().create(Cursor::new(&mut buf))?;

    let mut fields = BTreeMap::new();
    fields.insert("key".to_string(), "value".to_string());
    writer.write_metadata("my metadata", &fields)?;
    writer.finish()?;
    drop(writer);

    let summary = mcap::Summary::read(&buf)?.expect("file should be indexed");
    assert_eq!(summary.metadata_indexes.len(), 1);
    assert_eq!(summary.metadata_indexes[0].name, "my metadata");

    let metadata = mcap::read::metadata(&buf, &summary.metadata_indexes[0])?;
    assert_eq!(metadata.name, "my metadata");
    assert_eq!(metadata.metadata.get("key"), Some(&"value".to_string()));
    Ok(())
}
