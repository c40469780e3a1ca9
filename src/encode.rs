//! Per-segment H.264 encoding on top of openh264.
//!
//! Each call to [`SegmentEncoder::encode_segment`] spins up a fresh encoder,
//! feeds it one segment's worth of RGB frames, and muxes the resulting NAL
//! units into a standalone fMP4 buffer. Starting from a clean encoder means
//! every segment opens with an IDR frame and fresh SPS/PPS, which is what
//! makes segments independently decodable; it also makes "flush at the end
//! of every segment" trivial, since openh264 emits one access unit per
//! submitted frame and buffers nothing.

use std::sync::Arc;

use bytes::Bytes;
use openh264::encoder::{Encoder, EncoderConfig};
use openh264::formats::{RgbSliceU8, YUVBuffer};
use openh264::OpenH264API;

use crate::error::{Error, Result};
use crate::fmp4::SegmentMuxer;

/// H.264 NAL unit type constants.
pub mod nal_unit_type {
    /// Non-IDR slice (P frame).
    pub const NON_IDR_SLICE: u8 = 1;
    /// IDR slice (keyframe).
    pub const IDR_SLICE: u8 = 5;
    /// Sequence parameter set.
    pub const SPS: u8 = 7;
    /// Picture parameter set.
    pub const PPS: u8 = 8;
}

/// A single H.264 NAL unit without its start code.
#[derive(Debug, Clone)]
pub struct NalUnit {
    pub data: Vec<u8>,
    /// NAL unit type, from the first byte & 0x1F.
    pub kind: u8,
}

impl NalUnit {
    pub fn is_idr(&self) -> bool {
        self.kind == nal_unit_type::IDR_SLICE
    }

    pub fn is_slice(&self) -> bool {
        self.kind == nal_unit_type::IDR_SLICE || self.kind == nal_unit_type::NON_IDR_SLICE
    }
}

/// One encoded frame, parsed out of the encoder's Annex B output.
#[derive(Debug, Default)]
pub struct AnnexBFrame {
    /// Slice and other non-parameter-set NAL units, in stream order.
    pub nals: Vec<NalUnit>,
    /// SPS payload if the frame carried one.
    pub sps: Option<Vec<u8>>,
    /// PPS payload if the frame carried one.
    pub pps: Option<Vec<u8>>,
    /// Whether an IDR slice is present.
    pub is_keyframe: bool,
}

/// Split Annex B data into NAL unit payloads, handling both 3-byte
/// (`000001`) and 4-byte (`00000001`) start codes.
fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut current: Option<usize> = None;
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if let Some(start) = current {
                // The zero ahead of a 4-byte start code belongs to the code,
                // not to the unit that precedes it.
                let mut end = i;
                while end > start && data[end - 1] == 0 {
                    end -= 1;
                }
                if end > start {
                    units.push(&data[start..end]);
                }
            }
            current = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    if let Some(start) = current {
        if start < data.len() {
            units.push(&data[start..]);
        }
    }
    units
}

/// Parse one frame of Annex B output into classified NAL units.
pub fn parse_annex_b(data: &[u8]) -> AnnexBFrame {
    let mut frame = AnnexBFrame::default();
    for unit in split_nal_units(data) {
        let kind = unit[0] & 0x1F;
        match kind {
            nal_unit_type::SPS => frame.sps = Some(unit.to_vec()),
            nal_unit_type::PPS => frame.pps = Some(unit.to_vec()),
            _ => {
                if kind == nal_unit_type::IDR_SLICE {
                    frame.is_keyframe = true;
                }
                frame.nals.push(NalUnit {
                    data: unit.to_vec(),
                    kind,
                });
            }
        }
    }
    frame
}

/// Convert slice NAL units to AVCC framing (4-byte length prefixes) for mdat.
pub fn nal_units_to_avcc(nals: &[NalUnit]) -> Vec<u8> {
    let total: usize = nals
        .iter()
        .filter(|n| n.is_slice())
        .map(|n| 4 + n.data.len())
        .sum();
    let mut buf = Vec::with_capacity(total);
    for nal in nals.iter().filter(|n| n.is_slice()) {
        buf.extend_from_slice(&(nal.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&nal.data);
    }
    buf
}

/// A decoded video frame in RGB8, row-major.
#[derive(Debug, Clone)]
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    /// 3 bytes per pixel.
    pub data: Vec<u8>,
}

impl RgbFrame {
    /// An all-black frame, used to fill a gap before the first real frame.
    pub fn black(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * 3],
        }
    }
}

/// Encodes successive segments of one topic into standalone fMP4 buffers.
pub struct SegmentEncoder {
    fps: u32,
    bitrate_bps: u32,
    /// Dimensions locked in by the first encoded frame.
    dims: Option<(u32, u32)>,
    muxer: SegmentMuxer,
}

impl SegmentEncoder {
    pub fn new(fps: u32, bitrate_bps: u32) -> Self {
        Self {
            fps,
            bitrate_bps,
            dims: None,
            muxer: SegmentMuxer::new(fps),
        }
    }

    /// Encode one segment's frames at the fixed frame rate and return the
    /// finalized container bytes. All frames must share the dimensions of
    /// the first frame ever encoded by this instance.
    pub fn encode_segment(&mut self, frames: &[Arc<RgbFrame>]) -> Result<Bytes> {
        let Some(first) = frames.first() else {
            return Err(Error::EmptyBitstream);
        };
        let (width, height) = *self
            .dims
            .get_or_insert((first.width, first.height));

        let config = EncoderConfig::new()
            .set_bitrate_bps(self.bitrate_bps)
            .max_frame_rate(self.fps as f32)
            .enable_skip_frame(false);
        let mut encoder = Encoder::with_api_config(OpenH264API::from_source(), config)?;

        for frame in frames {
            if (frame.width, frame.height) != (width, height) {
                return Err(Error::DimensionMismatch {
                    expected_width: width,
                    expected_height: height,
                    width: frame.width,
                    height: frame.height,
                });
            }
            let rgb = RgbSliceU8::new(&frame.data, (width as usize, height as usize));
            let yuv = YUVBuffer::from_rgb_source(rgb);
            let bitstream = encoder.encode(&yuv)?;
            let parsed = parse_annex_b(&bitstream.to_vec());
            if let (Some(sps), Some(pps)) = (&parsed.sps, &parsed.pps) {
                self.muxer.set_parameter_sets(sps, pps, width, height);
            }
            let sample = nal_units_to_avcc(&parsed.nals);
            if sample.is_empty() {
                return Err(Error::EmptyBitstream);
            }
            self.muxer.push_sample(sample, parsed.is_keyframe);
        }

        Ok(self.muxer.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_annex_b_keyframe() {
        let mut data = Vec::new();
        // SPS, 4-byte start code
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        data.extend_from_slice(&[0x67, 0x42, 0xc0, 0x1f, 0xac]);
        // PPS
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        data.extend_from_slice(&[0x68, 0xee, 0x3c, 0x80]);
        // IDR slice
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        data.extend_from_slice(&[0x65, 0x88, 0x80, 0x40]);

        let parsed = parse_annex_b(&data);
        assert!(parsed.is_keyframe);
        assert_eq!(parsed.sps.unwrap(), vec![0x67, 0x42, 0xc0, 0x1f, 0xac]);
        assert_eq!(parsed.pps.unwrap(), vec![0x68, 0xee, 0x3c, 0x80]);
        assert_eq!(parsed.nals.len(), 1);
        assert!(parsed.nals[0].is_idr());
    }

    #[test]
    fn test_parse_annex_b_3byte_start_codes() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0x00, 0x00, 0x01]);
        data.extend_from_slice(&[0x41, 0x9a, 0x00, 0x10]);

        let parsed = parse_annex_b(&data);
        assert!(!parsed.is_keyframe);
        assert!(parsed.sps.is_none());
        assert_eq!(parsed.nals.len(), 1);
        assert_eq!(parsed.nals[0].kind, nal_unit_type::NON_IDR_SLICE);
        assert_eq!(parsed.nals[0].data, vec![0x41, 0x9a, 0x00, 0x10]);
    }

    #[test]
    fn test_parse_annex_b_mixed_start_codes() {
        // A 3-byte code followed by a 4-byte code: the trailing zero of the
        // second code must not leak into the first unit.
        let mut data = Vec::new();
        data.extend_from_slice(&[0x00, 0x00, 0x01]);
        data.extend_from_slice(&[0x41, 0x9a]);
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        data.extend_from_slice(&[0x41, 0x9b]);

        let parsed = parse_annex_b(&data);
        assert_eq!(parsed.nals.len(), 2);
        assert_eq!(parsed.nals[0].data, vec![0x41, 0x9a]);
        assert_eq!(parsed.nals[1].data, vec![0x41, 0x9b]);
    }

    #[test]
    fn test_parse_annex_b_empty() {
        let parsed = parse_annex_b(&[]);
        assert!(parsed.nals.is_empty());
        assert!(parsed.sps.is_none());
        assert!(parsed.pps.is_none());
        assert!(!parsed.is_keyframe);
    }

    #[test]
    fn test_nal_units_to_avcc_filters_and_prefixes() {
        let nals = vec![
            NalUnit {
                data: vec![0x65, 0xaa, 0xbb],
                kind: nal_unit_type::IDR_SLICE,
            },
            NalUnit {
                data: vec![0x06, 0x01],
                kind: 6, // SEI — not a slice, dropped from mdat
            },
        ];
        let avcc = nal_units_to_avcc(&nals);
        assert_eq!(avcc, vec![0, 0, 0, 3, 0x65, 0xaa, 0xbb]);
    }

    #[test]
    fn test_encode_segment_produces_standalone_fmp4() {
        let mut encoder = SegmentEncoder::new(30, 500_000);
        let frames: Vec<Arc<RgbFrame>> =
            (0..3).map(|_| Arc::new(RgbFrame::black(32, 32))).collect();

        let first = encoder.encode_segment(&frames).unwrap();
        assert_eq!(&first[4..8], b"ftyp");
        assert!(first.windows(4).any(|w| w == b"moov"));
        assert!(first.windows(4).any(|w| w == b"moof"));
        assert!(first.windows(4).any(|w| w == b"mdat"));

        // The next segment keeps the container timeline moving.
        let second = encoder.encode_segment(&frames).unwrap();
        let seq = |seg: &[u8]| {
            let pos = seg.windows(4).position(|w| w == b"mfhd").unwrap();
            u32::from_be_bytes(seg[pos + 8..pos + 12].try_into().unwrap())
        };
        assert_eq!(seq(&first), 1);
        assert_eq!(seq(&second), 2);
    }

    #[test]
    fn test_encode_segment_rejects_dimension_change() {
        let mut encoder = SegmentEncoder::new(30, 500_000);
        let frames = vec![Arc::new(RgbFrame::black(32, 32))];
        encoder.encode_segment(&frames).unwrap();

        let grown = vec![Arc::new(RgbFrame::black(64, 64))];
        assert!(matches!(
            encoder.encode_segment(&grown),
            Err(Error::DimensionMismatch { .. })
        ));
    }
}
