//! bagcast — turn recorded multi-topic sensor logs into independently
//! playable H.264 video segments.
//!
//! A recording interleaves messages from many sensors at whatever rates
//! they produced them. bagcast scans such a log exactly once, fans the
//! stream out per camera topic, resamples each topic's irregular frame
//! arrivals onto a fixed frame grid (repeating the last frame across gaps),
//! and encodes fixed-duration, self-contained fMP4 segments that an HLS/MSE
//! style delivery layer can serve straight from memory.
//!
//! # Quick start
//!
//! ```ignore
//! use bagcast::{Catalog, Driver, McapSource, SegmentStore};
//!
//! let source = McapSource::open("drive.mcap")?;
//! let mut catalog = Catalog::new(Box::new(source));
//! catalog.set_include_topics(["/front/image/compressed".to_string()]);
//!
//! let mut store = SegmentStore::new();
//! Driver::new(catalog.into_execution_plans()?).run(&mut store)?;
//!
//! // Hand segments to the delivery layer on demand.
//! let segment = store.get("/front/image/compressed", 0);
//! ```
//!
//! # Architecture
//!
//! Data flows source → demultiplexer → resampler → store, orchestrated by
//! the [`Driver`]'s round-robin over one [`ExecutionPlan`] per topic:
//!
//! - [`LogSource`] is the seam to the on-disk format; [`McapSource`] reads
//!   MCAP recordings, [`MemorySource`] serves tests.
//! - [`TopicDemux`] owns the log's single forward scan and buffers other
//!   topics' messages so no plan ever triggers a re-read.
//! - [`ResamplerStage`] snaps messages to the frame grid and emits one
//!   encoded [`Segment`] per fixed-duration window.
//! - [`SegmentStore`] is the append-only, index-stable buffer the delivery
//!   layer queries.

pub mod catalog;
pub mod demux;
pub mod encode;
pub mod error;
pub mod fmp4;
pub mod mcap_source;
pub mod resample;
pub mod source;
pub mod store;

pub use catalog::{Catalog, ExecutionPlan, Stage, StageOutput, DURATION_MARGIN_NS};
pub use demux::{TopicDemux, TopicReader};
pub use encode::{RgbFrame, SegmentEncoder};
pub use error::{Error, Result};
pub use mcap_source::McapSource;
pub use resample::{ResamplerStage, SegmentSettings};
pub use source::{ImageMessage, LogSource, MemorySource, SchemaKind, TimedMessage, TopicInfo};
pub use store::{Driver, Segment, SegmentStore};
