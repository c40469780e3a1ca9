//! Temporal resampling of irregular camera messages onto a fixed frame grid.
//!
//! Camera messages arrive whenever the sensor produced them; video wants one
//! frame every `1/fps` seconds. This stage pulls raw messages for one topic
//! from its child stage, snaps each message to the nearest slot on the frame
//! grid anchored at the first message's timestamp, repeats the last known
//! frame across gaps, and hands each fixed-duration window of frames to the
//! encoder as one segment.
//!
//! The stage moves through three phases: uninitialized (no message seen
//! yet), streaming (producing one segment per call), and exhausted (the
//! frame grid has passed the end of the recording).

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use crate::catalog::{Stage, StageOutput};
use crate::encode::{RgbFrame, SegmentEncoder};
use crate::error::{Error, Result};
use crate::source::ImageMessage;
use crate::store::Segment;

pub const DEFAULT_FPS: u32 = 30;
pub const DEFAULT_SEGMENT_SECS: u64 = 2;
pub const DEFAULT_BITRATE_BPS: u32 = 2_000_000;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Output tuning for produced segments.
#[derive(Debug, Clone)]
pub struct SegmentSettings {
    /// Output frame rate of the resampled video.
    pub fps: u32,
    /// Duration of each segment in seconds.
    pub segment_secs: u64,
    /// Encoder bitrate target in bits per second.
    pub bitrate_bps: u32,
}

impl Default for SegmentSettings {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            segment_secs: DEFAULT_SEGMENT_SECS,
            bitrate_bps: DEFAULT_BITRATE_BPS,
        }
    }
}

/// Decode a compressed camera payload into RGB pixels.
fn decode_frame(message: &ImageMessage) -> Result<RgbFrame> {
    let img = image::ImageReader::new(Cursor::new(&message.data))
        .with_guessed_format()?
        .decode()?
        .to_rgb8();
    Ok(RgbFrame {
        width: img.width(),
        height: img.height(),
        data: img.into_raw(),
    })
}

/// Resamples one topic's messages onto the frame grid and emits segments.
pub struct ResamplerStage {
    child: Box<Stage>,
    frame_period_ns: u64,
    segment_duration_ns: u64,
    /// Total duration to cover, including the catalog's safety margin.
    total_duration_ns: u64,
    encoder: SegmentEncoder,

    initialized: bool,
    /// Timestamp of the first message; anchors the frame grid.
    recording_start_ns: u64,
    /// Dimensions of the first decoded frame.
    dims: (u32, u32),
    /// Most recent frame assigned to a grid slot, for temporal hold.
    last_frame: Option<Arc<RgbFrame>>,
    /// A message pulled but not yet consumed: it belongs to a later segment.
    pending: Option<(ImageMessage, u64)>,
    /// Absolute grid index of the next segment's first frame.
    next_frame_index: u64,
    messages_consumed: u64,
}

impl ResamplerStage {
    pub fn new(child: Box<Stage>, total_duration_ns: u64, settings: &SegmentSettings) -> Self {
        Self {
            child,
            frame_period_ns: NANOS_PER_SEC / u64::from(settings.fps.max(1)),
            segment_duration_ns: settings.segment_secs * NANOS_PER_SEC,
            total_duration_ns,
            encoder: SegmentEncoder::new(settings.fps, settings.bitrate_bps),
            initialized: false,
            recording_start_ns: 0,
            dims: (0, 0),
            last_frame: None,
            pending: None,
            next_frame_index: 0,
            messages_consumed: 0,
        }
    }

    /// Raw messages consumed so far, for diagnostics and tests.
    pub fn messages_consumed(&self) -> u64 {
        self.messages_consumed
    }

    /// Produce the next encoded segment, or `None` once the grid has covered
    /// the whole recording (or the topic never had a message).
    pub fn next(&mut self, topic: &str) -> Result<Option<Segment>> {
        let Some(frames) = self.collect_frames(topic)? else {
            return Ok(None);
        };
        let frame_count = frames.len() as u64;
        let data = self.encoder.encode_segment(&frames)?;
        self.next_frame_index += frame_count;
        Ok(Some(Segment { data }))
    }

    fn pull(&mut self, topic: &str) -> Result<Option<(ImageMessage, u64)>> {
        match self.child.next(topic)? {
            Some(StageOutput::Message(message, ts)) => Ok(Some((message, ts))),
            Some(StageOutput::Segment(_)) => {
                Err(Error::InvalidPlan("resampler child must produce messages"))
            }
            None => Ok(None),
        }
    }

    /// Assemble the next segment's frames: pull messages into grid slots,
    /// then fill every slot of the window, holding the last known frame
    /// across gaps.
    fn collect_frames(&mut self, topic: &str) -> Result<Option<Vec<Arc<RgbFrame>>>> {
        if !self.initialized {
            let Some((message, ts)) = self.pull(topic)? else {
                // Empty topic: exhausted before it began.
                return Ok(None);
            };
            let first = Arc::new(decode_frame(&message)?);
            self.dims = (first.width, first.height);
            self.recording_start_ns = ts;
            self.last_frame = Some(first);
            // The first message still has to land in the first segment.
            self.pending = Some((message, ts));
            self.initialized = true;
        }

        let recording_end = self.recording_start_ns + self.total_duration_ns;
        let segment_start = self.recording_start_ns + self.next_frame_index * self.frame_period_ns;
        if segment_start >= recording_end {
            return Ok(None);
        }
        let segment_end = (segment_start + self.segment_duration_ns).min(recording_end);
        let frames_to_generate = (segment_end - segment_start).div_ceil(self.frame_period_ns);
        if frames_to_generate == 0 {
            return Err(Error::EmptyWindow {
                frame_index: self.next_frame_index,
            });
        }

        // Snap every message ahead of the segment boundary to its nearest
        // grid slot; later messages overwrite earlier ones on collision.
        let mut slots: HashMap<u64, Arc<RgbFrame>> = HashMap::new();
        while let Some((message, ts)) = self.pending.take() {
            if ts >= segment_end {
                // Belongs to a later segment; keep it buffered, unconsumed.
                self.pending = Some((message, ts));
                break;
            }
            let offset = ts - self.recording_start_ns;
            let index = (offset + self.frame_period_ns / 2) / self.frame_period_ns;
            slots.insert(index, Arc::new(decode_frame(&message)?));
            self.messages_consumed += 1;
            self.pending = self.pull(topic)?;
        }

        let mut frames = Vec::with_capacity(frames_to_generate as usize);
        for pts in 0..frames_to_generate {
            let slot = self.next_frame_index + pts;
            let frame = match slots.get(&slot) {
                Some(frame) => {
                    self.last_frame = Some(Arc::clone(frame));
                    Arc::clone(frame)
                }
                None => match &self.last_frame {
                    Some(frame) => Arc::clone(frame),
                    // A gap before any frame was ever assigned: black frame
                    // sized like the first-seen image.
                    None => {
                        let blank = Arc::new(RgbFrame::black(self.dims.0, self.dims.1));
                        self.last_frame = Some(Arc::clone(&blank));
                        blank
                    }
                },
            };
            frames.push(frame);
        }

        Ok(Some(frames))
    }
}
