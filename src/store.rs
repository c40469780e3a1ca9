//! In-memory segment store and the driver that fills it.
//!
//! The store is append-only: indices are assigned in append order and stay
//! stable, nothing is ever removed or reordered. A delivery layer polls
//! `get(topic, index)` and treats `None` as "not available" — it cannot
//! distinguish "not yet produced" from "will never exist", so consumers
//! either wait for the driver to finish or poll.

use std::collections::HashMap;

use bytes::Bytes;

use crate::catalog::ExecutionPlan;
use crate::error::Result;

/// One fixed-duration slice of encoded video, independently playable.
///
/// The sequence index is implicit: it is the segment's position in its
/// topic's store, 0-based in append order.
#[derive(Debug, Clone)]
pub struct Segment {
    pub data: Bytes,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Per-topic ordered collections of produced segments.
#[derive(Default)]
pub struct SegmentStore {
    topics: HashMap<String, Vec<Segment>>,
}

impl SegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a segment to a topic's sequence. Always succeeds.
    pub fn append(&mut self, topic: &str, segment: Segment) {
        self.topics.entry(topic.to_string()).or_default().push(segment);
    }

    /// The segment at `index` for `topic`, or `None` if the topic is unknown
    /// or the index is beyond what has been produced.
    pub fn get(&self, topic: &str, index: usize) -> Option<&Segment> {
        self.topics.get(topic)?.get(index)
    }

    /// Number of segments produced so far for `topic` (0 if unknown).
    pub fn segment_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, Vec::len)
    }

    /// Topics that have at least one segment.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }
}

/// Pulls every plan to completion, depositing segments into a store.
pub struct Driver {
    plans: Vec<ExecutionPlan>,
}

impl Driver {
    pub fn new(plans: Vec<ExecutionPlan>) -> Self {
        Self { plans }
    }

    /// Round-robin over the plans in their original order, one segment per
    /// plan per turn, until every plan has reported exhaustion.
    pub fn run(mut self, store: &mut SegmentStore) -> Result<()> {
        let mut idx = 0;
        while !self.plans.is_empty() {
            if idx >= self.plans.len() {
                idx = 0;
            }
            match self.plans[idx].next()? {
                Some(segment) => {
                    tracing::debug!(
                        topic = %self.plans[idx].topic().name,
                        bytes = segment.len(),
                        "produced segment"
                    );
                    store.append(&self.plans[idx].topic().name, segment);
                    idx += 1;
                }
                None => {
                    let plan = self.plans.remove(idx);
                    tracing::debug!(topic = %plan.topic().name, "topic exhausted");
                    // The next plan slides into `idx`; the rotation order of
                    // the remaining plans is preserved.
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::source::{ImageMessage, MemorySource, TimedMessage, TopicInfo};
    use std::sync::atomic::Ordering;

    fn segment(byte: u8) -> Segment {
        Segment {
            data: Bytes::from(vec![byte; 4]),
        }
    }

    #[test]
    fn test_store_append_get_bounds() {
        let mut store = SegmentStore::new();
        store.append("/cam", segment(1));
        store.append("/cam", segment(2));

        assert_eq!(store.segment_count("/cam"), 2);
        assert_eq!(store.get("/cam", 0).unwrap().data[0], 1);
        assert_eq!(store.get("/cam", 1).unwrap().data[0], 2);
        // Beyond the last produced index, and for unknown topics: unavailable.
        assert!(store.get("/cam", 2).is_none());
        assert!(store.get("/other", 0).is_none());
        assert_eq!(store.segment_count("/other"), 0);
    }

    #[test]
    fn test_store_get_is_idempotent() {
        let mut store = SegmentStore::new();
        store.append("/cam", segment(7));

        let a = store.get("/cam", 0).unwrap().clone();
        let b = store.get("/cam", 0).unwrap().clone();
        assert_eq!(a.data, b.data);
        // Bit-identical and backed by the same buffer.
        assert_eq!(a.data.as_ptr(), b.data.as_ptr());
    }

    fn jpeg_payload(r: u8) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(32, 32, image::Rgb([r, 60, 60]));
        let mut out = Vec::new();
        let mut enc = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90);
        enc.encode_image(&img).unwrap();
        out
    }

    /// Two camera topics interleaved in one log; the driver must fill both
    /// topics' sequences from a single scan.
    #[test]
    fn test_driver_fills_all_topics_single_pass() {
        let topics = vec![
            TopicInfo::new("/left", "sensor_msgs/msg/CompressedImage"),
            TopicInfo::new("/right", "sensor_msgs/msg/CompressedImage"),
        ];
        let mut messages = Vec::new();
        for i in 0..6u64 {
            for name in ["/left", "/right"] {
                messages.push(TimedMessage {
                    topic: name.into(),
                    message: ImageMessage {
                        format: "jpeg".into(),
                        data: jpeg_payload(if name == "/left" { 200 } else { 40 }),
                    },
                    timestamp_ns: i * 500_000_000,
                });
            }
        }
        // 2.5 s of data + 1 s margin → two 2 s segments per topic.
        let source = MemorySource::new(topics, 2_500_000_000, messages);
        let pulls = source.pull_counter();

        let catalog = Catalog::new(Box::new(source));
        let plans = catalog.into_execution_plans().unwrap();
        assert_eq!(plans.len(), 2);

        let mut store = SegmentStore::new();
        Driver::new(plans).run(&mut store).unwrap();

        assert_eq!(store.segment_count("/left"), 2);
        assert_eq!(store.segment_count("/right"), 2);
        assert!(store.get("/left", 0).is_some());
        assert!(store.get("/left", 2).is_none());
        // Every message read exactly once across both plans.
        assert_eq!(pulls.load(Ordering::Relaxed), 12);
    }
}
