//! MCAP-backed log source.
//!
//! Opens a recorded MCAP file, reads the topic list and recording duration
//! from its summary section, and scans the data section exactly once,
//! decoding ROS 2 `CompressedImage` payloads on the way. Messages that are
//! not camera images, or whose CDR payload fails to decode, are skipped with
//! a debug log — they never reach the pipeline.
//!
//! The scan runs on a dedicated reader thread feeding a small bounded
//! channel: the mmap-borrowing message stream stays on that thread while
//! [`LogSource::next_message`] pulls decoded messages out the other end. The
//! file is still read exactly once, with only the channel's worth of
//! prefetch in flight.

use std::path::Path;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::JoinHandle;

use memmap2::Mmap;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::source::{ImageMessage, LogSource, SchemaKind, TimedMessage, TopicInfo};

/// Messages decoded ahead of the consumer.
const PREFETCH: usize = 64;

/// `builtin_interfaces/msg/Time`
#[derive(Debug, Deserialize)]
#[cfg_attr(test, derive(serde::Serialize))]
struct RosTime {
    sec: i32,
    nanosec: u32,
}

/// `std_msgs/msg/Header`
#[derive(Debug, Deserialize)]
#[cfg_attr(test, derive(serde::Serialize))]
struct RosHeader {
    stamp: RosTime,
    frame_id: String,
}

/// `sensor_msgs/msg/CompressedImage`
#[derive(Debug, Deserialize)]
#[cfg_attr(test, derive(serde::Serialize))]
struct RosCompressedImage {
    header: RosHeader,
    format: String,
    data: Vec<u8>,
}

/// A [`LogSource`] over an MCAP file.
pub struct McapSource {
    topics: Vec<TopicInfo>,
    duration_ns: u64,
    messages: Receiver<TimedMessage>,
    // Held so the scan isn't detached; it exits on its own once the file
    // ends or the receiver is dropped.
    _scan: JoinHandle<()>,
}

impl McapSource {
    /// Open an MCAP file and start its single forward scan.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        // Safety: the mapped file is not mutated while the map is alive.
        let mapped = unsafe { Mmap::map(&file)? };

        let summary = mcap::Summary::read(&mapped)?
            .ok_or_else(|| Error::Open(format!("{}: no summary section", path.display())))?;
        let stats = summary
            .stats
            .as_ref()
            .ok_or_else(|| Error::Open(format!("{}: no statistics record", path.display())))?;
        let duration_ns = stats.message_end_time.saturating_sub(stats.message_start_time);

        let topics = summary
            .channels
            .values()
            .map(|channel| {
                let schema_name = channel
                    .schema
                    .as_ref()
                    .map(|schema| schema.name.clone())
                    .unwrap_or_default();
                TopicInfo::new(channel.topic.clone(), schema_name)
            })
            .collect();

        let (tx, rx) = sync_channel(PREFETCH);
        let scan = std::thread::spawn(move || scan_messages(mapped, tx));

        tracing::debug!(path = %path.display(), duration_ns, "opened MCAP log");
        Ok(Self {
            topics,
            duration_ns,
            messages: rx,
            _scan: scan,
        })
    }
}

impl LogSource for McapSource {
    fn topics(&mut self) -> Result<Vec<TopicInfo>> {
        Ok(self.topics.clone())
    }

    fn duration_ns(&mut self) -> Result<u64> {
        Ok(self.duration_ns)
    }

    fn next_message(&mut self) -> Result<Option<TimedMessage>> {
        // A closed channel means the scan finished (or failed and logged).
        Ok(self.messages.recv().ok())
    }
}

/// The reader thread: walk the data section once, decode camera payloads,
/// push them into the channel until the file or the consumer is done.
fn scan_messages(mapped: Mmap, tx: SyncSender<TimedMessage>) {
    let stream = match mcap::MessageStream::new(&mapped) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("failed to start log scan: {e}");
            return;
        }
    };

    for message in stream {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("log scan aborted: {e}");
                return;
            }
        };

        let schema_name = message
            .channel
            .schema
            .as_ref()
            .map(|schema| schema.name.as_str())
            .unwrap_or("");
        if SchemaKind::from_schema_name(schema_name) != SchemaKind::Image {
            tracing::trace!(topic = %message.channel.topic, "skipping non-image message");
            continue;
        }

        let decoded: RosCompressedImage = match cdr::deserialize(&message.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::debug!(topic = %message.channel.topic, "failed to decode message: {e}");
                continue;
            }
        };

        let timed = TimedMessage {
            topic: message.channel.topic.clone(),
            message: ImageMessage {
                format: decoded.format,
                data: decoded.data,
            },
            timestamp_ns: message.log_time,
        };
        if tx.send(timed).is_err() {
            // Consumer dropped; stop scanning.
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::io::BufWriter;
    use std::sync::Arc;

    fn ros_image(red: u8, stamp_ns: u64) -> RosCompressedImage {
        let img = image::RgbImage::from_pixel(16, 16, image::Rgb([red, 0, 0]));
        let mut jpeg = Vec::new();
        let mut enc = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 90);
        enc.encode_image(&img).unwrap();
        RosCompressedImage {
            header: RosHeader {
                stamp: RosTime {
                    sec: (stamp_ns / 1_000_000_000) as i32,
                    nanosec: (stamp_ns % 1_000_000_000) as u32,
                },
                frame_id: "camera".into(),
            },
            format: "jpeg".into(),
            data: jpeg,
        }
    }

    fn write_test_mcap(path: &std::path::Path, timestamps: &[u64]) {
        let out = BufWriter::new(std::fs::File::create(path).unwrap());
        let mut writer = mcap::Writer::new(out).unwrap();

        let schema = Arc::new(mcap::Schema {
            name: "sensor_msgs/msg/CompressedImage".into(),
            encoding: "ros2msg".into(),
            data: Cow::Borrowed(b"unused"),
        });
        let channel = mcap::Channel {
            topic: "/cam/image/compressed".into(),
            schema: Some(schema),
            message_encoding: "cdr".into(),
            metadata: Default::default(),
        };
        let channel_id = writer.add_channel(&channel).unwrap();

        for (i, &ts) in timestamps.iter().enumerate() {
            let msg = ros_image(((i * 40) % 255) as u8, ts);
            let payload = cdr::serialize::<_, _, cdr::CdrLe>(&msg, cdr::Infinite).unwrap();
            writer
                .write_to_known_channel(
                    &mcap::records::MessageHeader {
                        channel_id,
                        sequence: i as u32,
                        log_time: ts,
                        publish_time: ts,
                    },
                    &payload,
                )
                .unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_roundtrip_through_mcap_file() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("bagcast-test-{}.mcap", std::process::id()));
        let timestamps = [1_000_000_000, 1_100_000_000, 1_250_000_000];
        write_test_mcap(&path, &timestamps);

        let mut source = McapSource::open(&path).unwrap();

        let topics = source.topics().unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].name, "/cam/image/compressed");
        assert_eq!(topics[0].kind, SchemaKind::Image);
        assert_eq!(source.duration_ns().unwrap(), 250_000_000);

        for &expected_ts in &timestamps {
            let msg = source.next_message().unwrap().expect("message");
            assert_eq!(msg.topic, "/cam/image/compressed");
            assert_eq!(msg.timestamp_ns, expected_ts);
            assert_eq!(msg.message.format, "jpeg");
            // The payload survives the CDR roundtrip byte for byte.
            let decoded = image::load_from_memory(&msg.message.data).unwrap();
            assert_eq!(decoded.width(), 16);
        }
        assert!(source.next_message().unwrap().is_none());

        std::fs::remove_file(&path).ok();
    }
}
