use std::{borrow::Cow, collections::BTreeMap, io::Cursor, sync::{Arc, Once}};

use anyhow::Result;
use mcap::{Channel, Message, WriteOptions};

static LOGGER: Once = Once::new();

fn init_logger() {
    LOGGER.call_once(|| {
        simplelog::SimpleLogger::init(simplelog::LevelFilter::Debug, simplelog::Config::default())
            .expect("logger should only be initialized once per process");
    });
}

fn write_demo(opts: WriteOptions) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut writer = opts.create(Cursor::new(&mut buf))?;

    let schema_id = writer.add_schema("Pose", "jsonschema", b"{\"type\":\"object\"}")?;
    let channel_id =
        writer.add_channel(schema_id, "/pose", "json", &BTreeMap::new())?;
    let channel = Arc::new(Channel {
        id: channel_id,
        topic: "/pose".into(),
        schema: None,
        message_encoding: "json".into(),
        metadata: BTreeMap::new(),
    });

    for i in 0..50u32 {
        writer.write(&Message {
            channel: channel.clone(),
            sequence: i,
            log_time: i as u64 * 10,
            publish_time: i as u64 * 10,
            data: Cow::Owned(format!("{{\"i\":{i}}}").into_bytes()),
        })?;
    }

    writer.finish()?;
    drop(writer);
    Ok(buf)
}

#[test]
fn writer_output_opens_with_magic_and_header() -> Result<()> {
    let buf = write_demo(WriteOptions::new())?;
    assert_eq!(&buf[..8], mcap::MAGIC);
    assert_eq!(&buf[buf.len() - 8..], mcap::MAGIC);
    Ok(())
}

#[test]
fn summary_statistics_match_what_was_written() -> Result<()> {
    let buf = write_demo(WriteOptions::new())?;
    let summary = mcap::Summary::read(&buf)?.expect("file should be indexed");
    let stats = summary.stats.as_ref().expect("statistics enabled by default");
    assert_eq!(stats.message_count, 50);
    assert_eq!(stats.message_start_time, 0);
    assert_eq!(stats.message_end_time, 490);
    assert_eq!(stats.channel_count, 1);
    assert_eq!(stats.schema_count, 1);
    Ok(())
}

#[test]
fn chunks_round_trip_through_stream_chunk() -> Result<()> {
    let buf = write_demo(WriteOptions::new())?;
    let summary = mcap::Summary::read(&buf)?.expect("file should be indexed");
    assert!(!summary.chunk_indexes.is_empty());

    let mut seen = 0;
    for chunk_index in &summary.chunk_indexes {
        for message in summary.stream_chunk(&buf, chunk_index)? {
            message?;
            seen += 1;
        }
    }
    assert_eq!(seen, 50);
    Ok(())
}

#[test]
fn indexed_read_messages_matches_write_order() -> Result<()> {
    let buf = write_demo(WriteOptions::new())?;
    let summary = mcap::Summary::read(&buf)?.expect("file should be indexed");

    let messages: Result<Vec<Message>, _> = summary
        .read_messages(&buf, &mcap::ReadMessageOptions::default())?
        .collect();
    let messages = messages?;

    assert_eq!(messages.len(), 50);
    for (i, m) in messages.iter().enumerate() {
        assert_eq!(m.log_time, i as u64 * 10);
        assert_eq!(m.sequence, i as u32);
    }
    Ok(())
}

#[test]
fn reverse_iteration_is_the_exact_reverse_of_forward() -> Result<()> {
    let buf = write_demo(WriteOptions::new())?;
    let summary = mcap::Summary::read(&buf)?.expect("file should be indexed");

    let forward: Result<Vec<Message>, _> = summary
        .read_messages(&buf, &mcap::ReadMessageOptions::default())?
        .collect();
    let mut forward = forward?;

    let reverse_opts = mcap::ReadMessageOptions {
        reverse: true,
        ..Default::default()
    };
    let reverse: Result<Vec<Message>, _> = summary.read_messages(&buf, &reverse_opts)?.collect();
    let reverse = reverse?;

    forward.reverse();
    assert_eq!(forward.len(), reverse.len());
    for (a, b) in forward.iter().zip(reverse.iter()) {
        assert_eq!(a.log_time, b.log_time);
        assert_eq!(a.sequence, b.sequence);
    }
    Ok(())
}

#[test]
fn time_range_filter_clips_to_bounds() -> Result<()> {
    let buf = write_demo(WriteOptions::new())?;
    let summary = mcap::Summary::read(&buf)?.expect("file should be indexed");

    let opts = mcap::ReadMessageOptions {
        start_time: Some(100),
        end_time: Some(200),
        ..Default::default()
    };
    let messages: Result<Vec<Message>, _> = summary.read_messages(&buf, &opts)?.collect();
    let messages = messages?;

    assert!(messages.iter().all(|m| m.log_time >= 100 && m.log_time <= 200));
    assert_eq!(messages.len(), 11);
    Ok(())
}

#[test]
fn unchunked_writer_still_produces_a_readable_summary() -> Result<()> {
    let buf = write_demo(WriteOptions::new().use_chunks(false))?;
    let summary = mcap::Summary::read(&buf)?.expect("file should be indexed");
    assert!(summary.chunk_indexes.is_empty());
    assert_eq!(summary.stats.as_ref().unwrap().message_count, 50);

    let messages: Result<Vec<Message>, _> = summary
        .read_messages(&buf, &mcap::ReadMessageOptions::default())?
        .collect();
    assert_eq!(messages?.len(), 50);
    Ok(())
}

#[test]
fn summary_offsets_point_at_groups_of_their_own_opcode() -> Result<()> {
    let buf = write_demo(WriteOptions::new())?;
    let footer = mcap::read::footer(&buf)?;
    assert_ne!(footer.summary_offset_start, 0);

    let summary_offset_end = buf.len() - mcap::read::FOOTER_RECORD_LEN - mcap::MAGIC.len();
    for rec in mcap::read::LinearReader::sans_magic(
        &buf[footer.summary_offset_start as usize..summary_offset_end],
    ) {
        let mcap::records::Record::SummaryOffset(so) = rec? else {
            panic!("expected only SummaryOffset records in this region");
        };
        for group_rec in mcap::read::LinearReader::sans_magic(
            &buf[so.group_start as usize..(so.group_start + so.group_length) as usize],
        ) {
            assert_eq!(group_rec?.opcode(), so.group_opcode);
        }
    }
    Ok(())
}

#[test]
fn unknown_opcode_is_logged_and_skipped_not_fatal() -> Result<()> {
    init_logger();

    // opcode 0x7F is unassigned; a conforming reader must pass it through
    // as `Record::Unknown` and keep going, logging the occurrence (spec §4.2).
    let mut record = vec![0x7Fu8];
    record.extend_from_slice(&3u64.to_le_bytes());
    record.extend_from_slice(b"abc");

    let records: Result<Vec<_>, _> =
        mcap::read::LinearReader::sans_magic(&record).collect();
    let records = records?;
    assert_eq!(records.len(), 1);
    assert!(matches!(
        &records[0],
        mcap::records::Record::Unknown { opcode: 0x7F, .. }
    ));
    Ok(())
}
