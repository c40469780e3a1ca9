//! Log source collaborator interface and the message model.
//!
//! A [`LogSource`] is the seam between the segmenting pipeline and whatever
//! on-disk format the recording lives in. It exposes the topic list, the raw
//! recording duration, and a single forward pass over the decoded messages in
//! time order. Decode failures are the source's problem: a message that
//! cannot be decoded is skipped and never surfaces here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;

/// Schema classification for a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaKind {
    /// Compressed camera images — the only kind that produces segments.
    Image,
    /// Camera calibration parameters.
    CameraInfo,
    /// LiDAR / point cloud data. Recognized but not yet segmentable.
    PointCloud,
    /// Anything else recorded in the log.
    Unsupported,
}

impl SchemaKind {
    /// Classify a ROS 2 schema name.
    pub fn from_schema_name(name: &str) -> Self {
        match name {
            "sensor_msgs/msg/CompressedImage" => Self::Image,
            "sensor_msgs/msg/CameraInfo" => Self::CameraInfo,
            "sensor_msgs/msg/PointCloud2" => Self::PointCloud,
            _ => Self::Unsupported,
        }
    }
}

/// A named channel discovered in a log. Immutable once discovered.
#[derive(Debug, Clone)]
pub struct TopicInfo {
    /// Topic name, unique within a log.
    pub name: String,
    /// Schema name as recorded (e.g. `sensor_msgs/msg/CompressedImage`).
    pub schema_name: String,
    /// Classification derived from the schema name.
    pub kind: SchemaKind,
}

impl TopicInfo {
    pub fn new(name: impl Into<String>, schema_name: impl Into<String>) -> Self {
        let schema_name = schema_name.into();
        let kind = SchemaKind::from_schema_name(&schema_name);
        Self {
            name: name.into(),
            schema_name,
            kind,
        }
    }
}

/// One decoded compressed-image payload.
#[derive(Debug, Clone)]
pub struct ImageMessage {
    /// Compression format as recorded (e.g. `jpeg`).
    pub format: String,
    /// Compressed pixel data.
    pub data: Vec<u8>,
}

/// A decoded message tagged with its topic and log timestamp.
#[derive(Debug, Clone)]
pub struct TimedMessage {
    pub topic: String,
    pub message: ImageMessage,
    /// Nanoseconds since the Unix epoch, as recorded in the log.
    pub timestamp_ns: u64,
}

/// A readable recording.
///
/// `next_message` is the single forward iterator over the log: timestamps are
/// non-decreasing, the sequence is finite, and it cannot be rewound — a fresh
/// open is required to scan again.
pub trait LogSource: Send {
    /// All topics present in the log, with their schema classification.
    fn topics(&mut self) -> Result<Vec<TopicInfo>>;

    /// Raw recording duration in nanoseconds (no margin applied).
    fn duration_ns(&mut self) -> Result<u64>;

    /// The next decoded message in time order, or `None` once the log ends.
    fn next_message(&mut self) -> Result<Option<TimedMessage>>;
}

/// In-memory [`LogSource`] over a prepared message sequence.
///
/// The reference implementation of the contract, and the collaborator the
/// tests use: it counts how many messages have been pulled so the
/// single-pass guarantee can be asserted.
pub struct MemorySource {
    topics: Vec<TopicInfo>,
    duration_ns: u64,
    messages: std::vec::IntoIter<TimedMessage>,
    pulled: Arc<AtomicU64>,
}

impl MemorySource {
    /// `messages` must already be in non-decreasing timestamp order.
    pub fn new(topics: Vec<TopicInfo>, duration_ns: u64, messages: Vec<TimedMessage>) -> Self {
        Self {
            topics,
            duration_ns,
            messages: messages.into_iter(),
            pulled: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared counter of messages handed out so far. Clone it before moving
    /// the source into a pipeline.
    pub fn pull_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.pulled)
    }
}

impl LogSource for MemorySource {
    fn topics(&mut self) -> Result<Vec<TopicInfo>> {
        Ok(self.topics.clone())
    }

    fn duration_ns(&mut self) -> Result<u64> {
        Ok(self.duration_ns)
    }

    fn next_message(&mut self) -> Result<Option<TimedMessage>> {
        let next = self.messages.next();
        if next.is_some() {
            self.pulled.fetch_add(1, Ordering::Relaxed);
        }
        Ok(next)
    }
}
