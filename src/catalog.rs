//! Log catalog and per-topic execution-plan construction.
//!
//! The catalog opens a log lazily, learns its topics and duration, and
//! builds one execution plan per camera topic. A plan is a short ownership
//! chain of stages — each stage exclusively owns its single child — with the
//! resampler at the head pulling messages from a reader view of the one
//! shared demultiplexer. Building the plans consumes the catalog: the log
//! source moves into the demultiplexer, so a second scan cannot exist.

use std::collections::HashSet;

use crate::demux::{TopicDemux, TopicReader};
use crate::error::{Error, Result};
use crate::resample::{ResamplerStage, SegmentSettings};
use crate::source::{ImageMessage, LogSource, SchemaKind, TopicInfo};
use crate::store::Segment;

/// Safety margin added to the raw recording duration.
///
/// Message timestamps snap to the *nearest* frame-grid slot, so a message at
/// the very end of the log can round to a slot one period past the raw
/// duration. The margin keeps that slot inside a valid segment window; a few
/// held frames at the tail beat losing a real one.
pub const DURATION_MARGIN_NS: u64 = 1_000_000_000;

/// What a stage hands to its parent.
pub enum StageOutput {
    /// A raw camera message with its log timestamp.
    Message(ImageMessage, u64),
    /// An encoded, independently playable segment.
    Segment(Segment),
}

/// One processing step in an execution plan.
///
/// Stages form a tagged enum rather than a trait object: the set of stages
/// is closed and small, and the chain is a simple ownership line, not a
/// graph. All variants answer `next(topic)`.
pub enum Stage {
    /// Pulls this topic's messages from the shared demultiplexer.
    Reader(TopicReader),
    /// Resamples messages onto the frame grid and encodes segments.
    Resampler(ResamplerStage),
    /// Extension point for a future recompression step; forwards its
    /// child's output untouched so chains stay composable.
    Passthrough(Box<Stage>),
}

impl Stage {
    pub fn next(&mut self, topic: &str) -> Result<Option<StageOutput>> {
        match self {
            Stage::Reader(reader) => Ok(reader
                .next()?
                .map(|(message, ts)| StageOutput::Message(message, ts))),
            Stage::Resampler(stage) => Ok(stage.next(topic)?.map(StageOutput::Segment)),
            Stage::Passthrough(child) => child.next(topic),
        }
    }
}

/// A stage chain bound to exactly one topic, ready for the driver.
pub struct ExecutionPlan {
    topic: TopicInfo,
    head: Stage,
}

impl ExecutionPlan {
    pub fn topic(&self) -> &TopicInfo {
        &self.topic
    }

    /// The next segment for this plan's topic, or `None` once exhausted.
    pub fn next(&mut self) -> Result<Option<Segment>> {
        match self.head.next(&self.topic.name)? {
            Some(StageOutput::Segment(segment)) => Ok(Some(segment)),
            Some(StageOutput::Message(..)) => {
                Err(Error::InvalidPlan("plan head must produce segments"))
            }
            None => Ok(None),
        }
    }
}

/// Reads a log's metadata and builds execution plans for its camera topics.
pub struct Catalog {
    source: Option<Box<dyn LogSource>>,
    topics: Vec<TopicInfo>,
    duration_ns: u64,
    include: HashSet<String>,
    settings: SegmentSettings,
    loaded: bool,
}

impl Catalog {
    pub fn new(source: Box<dyn LogSource>) -> Self {
        Self::with_settings(source, SegmentSettings::default())
    }

    pub fn with_settings(source: Box<dyn LogSource>, settings: SegmentSettings) -> Self {
        Self {
            source: Some(source),
            topics: Vec::new(),
            duration_ns: 0,
            include: HashSet::new(),
            settings,
            loaded: false,
        }
    }

    /// Restrict which topics receive plans. An empty set (the default)
    /// means every eligible topic; names not present in the log are
    /// silently ignored.
    pub fn set_include_topics(&mut self, names: impl IntoIterator<Item = String>) {
        self.include = names.into_iter().collect();
    }

    fn ensure_loaded(&mut self) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        let source = self
            .source
            .as_mut()
            .ok_or(Error::Open("log source already consumed".into()))?;
        self.topics = source.topics()?;
        self.duration_ns = source.duration_ns()? + DURATION_MARGIN_NS;
        self.loaded = true;
        Ok(())
    }

    /// All topics discovered in the log, of every schema kind.
    pub fn topics(&mut self) -> Result<&[TopicInfo]> {
        self.ensure_loaded()?;
        Ok(&self.topics)
    }

    /// Total duration the frame grid must cover: the raw recording duration
    /// plus [`DURATION_MARGIN_NS`].
    pub fn duration_ns(&mut self) -> Result<u64> {
        self.ensure_loaded()?;
        Ok(self.duration_ns)
    }

    /// Build one plan per included camera topic.
    ///
    /// Consumes the catalog: the log source moves into the shared
    /// demultiplexer and every plan gets a per-topic reader view of it,
    /// preserving the single-scan guarantee structurally.
    pub fn into_execution_plans(mut self) -> Result<Vec<ExecutionPlan>> {
        self.ensure_loaded()?;
        let source = self
            .source
            .take()
            .ok_or(Error::Open("log source already consumed".into()))?;
        let demux = TopicDemux::new(source).into_shared();

        let mut plans = Vec::new();
        for topic in &self.topics {
            if !self.include.is_empty() && !self.include.contains(&topic.name) {
                continue;
            }
            match topic.kind {
                SchemaKind::Image => {
                    let reader = Stage::Reader(TopicReader::new(&demux, &topic.name));
                    let resampler =
                        ResamplerStage::new(Box::new(reader), self.duration_ns, &self.settings);
                    plans.push(ExecutionPlan {
                        topic: topic.clone(),
                        head: Stage::Resampler(resampler),
                    });
                }
                SchemaKind::PointCloud => {
                    tracing::debug!(topic = %topic.name, "point cloud topics are not segmentable yet, skipping");
                }
                SchemaKind::CameraInfo | SchemaKind::Unsupported => {}
            }
        }
        tracing::info!(plans = plans.len(), "built execution plans");
        Ok(plans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemorySource, TimedMessage};

    fn jpeg_payload() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(32, 32, image::Rgb([10, 200, 10]));
        let mut out = Vec::new();
        let mut enc = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90);
        enc.encode_image(&img).unwrap();
        out
    }

    fn mixed_source() -> MemorySource {
        let topics = vec![
            TopicInfo::new("/front/image/compressed", "sensor_msgs/msg/CompressedImage"),
            TopicInfo::new("/front/camera_info", "sensor_msgs/msg/CameraInfo"),
            TopicInfo::new("/lidar/points", "sensor_msgs/msg/PointCloud2"),
            TopicInfo::new("/diagnostics", "diagnostic_msgs/msg/DiagnosticArray"),
        ];
        let payload = jpeg_payload();
        let messages = (0..4)
            .map(|i| TimedMessage {
                topic: "/front/image/compressed".into(),
                message: ImageMessage {
                    format: "jpeg".into(),
                    data: payload.clone(),
                },
                timestamp_ns: i * 100_000_000,
            })
            .collect();
        MemorySource::new(topics, 300_000_000, messages)
    }

    #[test]
    fn test_catalog_loads_lazily_and_adds_margin() {
        let mut catalog = Catalog::new(Box::new(mixed_source()));
        assert_eq!(catalog.topics().unwrap().len(), 4);
        assert_eq!(catalog.duration_ns().unwrap(), 300_000_000 + DURATION_MARGIN_NS);
    }

    #[test]
    fn test_plans_only_for_image_topics() {
        let catalog = Catalog::new(Box::new(mixed_source()));
        let plans = catalog.into_execution_plans().unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].topic().name, "/front/image/compressed");
        assert_eq!(plans[0].topic().kind, SchemaKind::Image);
    }

    #[test]
    fn test_include_filter_restricts_and_ignores_unknown() {
        let mut catalog = Catalog::new(Box::new(mixed_source()));
        catalog.set_include_topics(["/does/not/exist".to_string()]);
        assert!(catalog.into_execution_plans().unwrap().is_empty());

        let mut catalog = Catalog::new(Box::new(mixed_source()));
        catalog.set_include_topics(["/front/image/compressed".to_string()]);
        assert_eq!(catalog.into_execution_plans().unwrap().len(), 1);
    }

    #[test]
    fn test_plan_produces_segments_then_exhausts() {
        let catalog = Catalog::new(Box::new(mixed_source()));
        let mut plans = catalog.into_execution_plans().unwrap();
        let plan = &mut plans[0];

        // 0.3 s of data + 1 s margin fits one 2 s segment.
        let segment = plan.next().unwrap().expect("one segment");
        assert_eq!(&segment.data[4..8], b"ftyp");
        assert!(plan.next().unwrap().is_none());
        assert!(plan.next().unwrap().is_none());
    }

    #[test]
    fn test_passthrough_forwards_child_output() {
        let catalog = Catalog::new(Box::new(mixed_source()));
        let mut plans = catalog.into_execution_plans().unwrap();
        let plan = plans.remove(0);

        // Wrap the plan head in the no-op stage; behavior is unchanged.
        let mut wrapped = Stage::Passthrough(Box::new(plan.head));
        let out = wrapped.next("/front/image/compressed").unwrap();
        assert!(matches!(out, Some(StageOutput::Segment(_))));
        assert!(wrapped.next("/front/image/compressed").unwrap().is_none());
    }
}
