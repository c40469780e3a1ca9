//! Self-initializing fragmented-MP4 muxer for H.264 segments.
//!
//! Every buffer produced here is a complete, standalone fMP4: `ftyp` and
//! `moov` (carrying the avcC codec configuration) followed by one
//! `moof`+`mdat` fragment holding the segment's frames. A player can fetch
//! any segment in isolation, and because fragment sequence numbers and base
//! decode times increase monotonically across segments, appending them in
//! order also plays back progressively (MSE / DASH style delivery).
//!
//! Layout per segment:
//!
//! ```text
//! ftyp                      file type + brands
//! moov                      track header, avc1/avcC (SPS/PPS), mvex
//! moof                      fragment header (mfhd, tfhd, tfdt, trun)
//! mdat                      AVCC-framed slice data
//! ```

use bytes::Bytes;

/// 90 kHz, the conventional video timescale.
const TIMESCALE: u32 = 90_000;

const TRACK_ID: u32 = 1;

/// Identity transform matrix for mvhd/tkhd.
const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// Write `size | kind | body` and backpatch the size.
fn mp4_box(buf: &mut Vec<u8>, kind: &[u8; 4], body: impl FnOnce(&mut Vec<u8>)) {
    let start = buf.len();
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(kind);
    body(buf);
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

/// An mp4 "full box": version byte plus 24-bit flags ahead of the body.
fn full_box(buf: &mut Vec<u8>, kind: &[u8; 4], version: u8, flags: u32, body: impl FnOnce(&mut Vec<u8>)) {
    mp4_box(buf, kind, |b| {
        b.push(version);
        b.extend_from_slice(&flags.to_be_bytes()[1..]);
        body(b);
    });
}

/// One encoded frame queued for the current fragment.
struct Sample {
    /// AVCC (length-prefixed) slice data destined for mdat.
    data: Vec<u8>,
    /// Sync sample (IDR).
    is_sync: bool,
}

/// Accumulates one segment's frames and emits a standalone fMP4 buffer.
///
/// The muxer persists across a topic's segments so that sequence numbers and
/// base decode times keep advancing; samples are cleared on every
/// [`finalize`](Self::finalize).
pub struct SegmentMuxer {
    width: u32,
    height: u32,
    sps: Vec<u8>,
    pps: Vec<u8>,
    /// Fixed duration of every sample, in timescale units.
    sample_duration: u32,
    samples: Vec<Sample>,
    sequence_number: u32,
    base_decode_time: u64,
}

impl SegmentMuxer {
    pub fn new(fps: u32) -> Self {
        Self {
            width: 0,
            height: 0,
            sps: Vec::new(),
            pps: Vec::new(),
            sample_duration: TIMESCALE / fps.max(1),
            samples: Vec::new(),
            sequence_number: 1,
            base_decode_time: 0,
        }
    }

    /// Record the codec configuration carried in every segment's `moov`.
    /// Must be called before the first [`finalize`](Self::finalize); calling
    /// it again (e.g. on each keyframe) just refreshes the stored sets.
    pub fn set_parameter_sets(&mut self, sps: &[u8], pps: &[u8], width: u32, height: u32) {
        self.sps = sps.to_vec();
        self.pps = pps.to_vec();
        self.width = width;
        self.height = height;
    }

    pub fn is_configured(&self) -> bool {
        !self.sps.is_empty() && !self.pps.is_empty()
    }

    /// Queue one AVCC-framed frame for the current segment.
    pub fn push_sample(&mut self, data: Vec<u8>, is_sync: bool) {
        self.samples.push(Sample { data, is_sync });
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Emit the queued frames as one standalone segment and advance the
    /// fragment sequence number and base decode time past them.
    pub fn finalize(&mut self) -> Bytes {
        let mut out = Vec::new();
        self.write_ftyp(&mut out);
        self.write_moov(&mut out);
        out.extend_from_slice(&self.build_moof());
        mp4_box(&mut out, b"mdat", |b| {
            for sample in &self.samples {
                b.extend_from_slice(&sample.data);
            }
        });

        self.base_decode_time += self.samples.len() as u64 * u64::from(self.sample_duration);
        self.sequence_number += 1;
        self.samples.clear();
        Bytes::from(out)
    }

    fn write_ftyp(&self, buf: &mut Vec<u8>) {
        mp4_box(buf, b"ftyp", |b| {
            b.extend_from_slice(b"isom"); // major brand
            b.extend_from_slice(&0u32.to_be_bytes()); // minor version
            for brand in [b"isom", b"iso6", b"cmfc", b"cmfv", b"avc1", b"mp41"] {
                b.extend_from_slice(brand);
            }
        });
    }

    fn write_moov(&self, buf: &mut Vec<u8>) {
        mp4_box(buf, b"moov", |b| {
            self.write_mvhd(b);
            self.write_trak(b);
            // mvex marks the movie as fragmented
            mp4_box(b, b"mvex", |b| {
                full_box(b, b"trex", 0, 0, |b| {
                    b.extend_from_slice(&TRACK_ID.to_be_bytes());
                    b.extend_from_slice(&1u32.to_be_bytes()); // default sample description
                    b.extend_from_slice(&0u32.to_be_bytes()); // default sample duration
                    b.extend_from_slice(&0u32.to_be_bytes()); // default sample size
                    b.extend_from_slice(&0u32.to_be_bytes()); // default sample flags
                });
            });
        });
    }

    fn write_mvhd(&self, buf: &mut Vec<u8>) {
        full_box(buf, b"mvhd", 0, 0, |b| {
            b.extend_from_slice(&0u32.to_be_bytes()); // creation time
            b.extend_from_slice(&0u32.to_be_bytes()); // modification time
            b.extend_from_slice(&TIMESCALE.to_be_bytes());
            b.extend_from_slice(&0u32.to_be_bytes()); // duration unknown (fragmented)
            b.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
            b.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
            b.extend_from_slice(&[0; 10]); // reserved
            for m in UNITY_MATRIX {
                b.extend_from_slice(&m.to_be_bytes());
            }
            b.extend_from_slice(&[0; 24]); // pre_defined
            b.extend_from_slice(&(TRACK_ID + 1).to_be_bytes()); // next track id
        });
    }

    fn write_trak(&self, buf: &mut Vec<u8>) {
        mp4_box(buf, b"trak", |b| {
            // flags: track enabled + in movie
            full_box(b, b"tkhd", 0, 0x000003, |b| {
                b.extend_from_slice(&0u32.to_be_bytes()); // creation time
                b.extend_from_slice(&0u32.to_be_bytes()); // modification time
                b.extend_from_slice(&TRACK_ID.to_be_bytes());
                b.extend_from_slice(&0u32.to_be_bytes()); // reserved
                b.extend_from_slice(&0u32.to_be_bytes()); // duration unknown
                b.extend_from_slice(&[0; 8]); // reserved
                b.extend_from_slice(&0u16.to_be_bytes()); // layer
                b.extend_from_slice(&0u16.to_be_bytes()); // alternate group
                b.extend_from_slice(&0u16.to_be_bytes()); // volume (video)
                b.extend_from_slice(&0u16.to_be_bytes()); // reserved
                for m in UNITY_MATRIX {
                    b.extend_from_slice(&m.to_be_bytes());
                }
                // width/height as 16.16 fixed point
                b.extend_from_slice(&(self.width << 16).to_be_bytes());
                b.extend_from_slice(&(self.height << 16).to_be_bytes());
            });
            self.write_mdia(b);
        });
    }

    fn write_mdia(&self, buf: &mut Vec<u8>) {
        mp4_box(buf, b"mdia", |b| {
            full_box(b, b"mdhd", 0, 0, |b| {
                b.extend_from_slice(&0u32.to_be_bytes()); // creation time
                b.extend_from_slice(&0u32.to_be_bytes()); // modification time
                b.extend_from_slice(&TIMESCALE.to_be_bytes());
                b.extend_from_slice(&0u32.to_be_bytes()); // duration
                b.extend_from_slice(&0x55c4u16.to_be_bytes()); // language: und
                b.extend_from_slice(&0u16.to_be_bytes()); // pre_defined
            });
            full_box(b, b"hdlr", 0, 0, |b| {
                b.extend_from_slice(&0u32.to_be_bytes()); // pre_defined
                b.extend_from_slice(b"vide");
                b.extend_from_slice(&[0; 12]); // reserved
                b.extend_from_slice(b"VideoHandler\0");
            });
            self.write_minf(b);
        });
    }

    fn write_minf(&self, buf: &mut Vec<u8>) {
        mp4_box(buf, b"minf", |b| {
            full_box(b, b"vmhd", 0, 0x000001, |b| {
                b.extend_from_slice(&0u16.to_be_bytes()); // graphics mode
                b.extend_from_slice(&[0; 6]); // opcolor
            });
            mp4_box(b, b"dinf", |b| {
                full_box(b, b"dref", 0, 0, |b| {
                    b.extend_from_slice(&1u32.to_be_bytes()); // entry count
                    full_box(b, b"url ", 0, 0x000001, |_| {}); // self-contained
                });
            });
            self.write_stbl(b);
        });
    }

    fn write_stbl(&self, buf: &mut Vec<u8>) {
        mp4_box(buf, b"stbl", |b| {
            full_box(b, b"stsd", 0, 0, |b| {
                b.extend_from_slice(&1u32.to_be_bytes()); // entry count
                self.write_avc1(b);
            });
            // Sample tables are empty: all samples live in fragments.
            full_box(b, b"stts", 0, 0, |b| b.extend_from_slice(&0u32.to_be_bytes()));
            full_box(b, b"stsc", 0, 0, |b| b.extend_from_slice(&0u32.to_be_bytes()));
            full_box(b, b"stsz", 0, 0, |b| b.extend_from_slice(&[0; 8]));
            full_box(b, b"stco", 0, 0, |b| b.extend_from_slice(&0u32.to_be_bytes()));
        });
    }

    fn write_avc1(&self, buf: &mut Vec<u8>) {
        mp4_box(buf, b"avc1", |b| {
            b.extend_from_slice(&[0; 6]); // reserved
            b.extend_from_slice(&1u16.to_be_bytes()); // data reference index
            b.extend_from_slice(&[0; 16]); // pre_defined / reserved
            b.extend_from_slice(&(self.width as u16).to_be_bytes());
            b.extend_from_slice(&(self.height as u16).to_be_bytes());
            b.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // 72 dpi horizontal
            b.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // 72 dpi vertical
            b.extend_from_slice(&0u32.to_be_bytes()); // reserved
            b.extend_from_slice(&1u16.to_be_bytes()); // frame count
            let mut compressor = [0u8; 32];
            let name = b"bagcast";
            compressor[0] = name.len() as u8;
            compressor[1..1 + name.len()].copy_from_slice(name);
            b.extend_from_slice(&compressor);
            b.extend_from_slice(&0x0018u16.to_be_bytes()); // depth: 24-bit
            b.extend_from_slice(&(-1i16).to_be_bytes()); // pre_defined
            self.write_avcc(b);
        });
    }

    fn write_avcc(&self, buf: &mut Vec<u8>) {
        mp4_box(buf, b"avcC", |b| {
            b.push(1); // configuration version
            if self.sps.len() >= 4 {
                b.push(self.sps[1]); // profile
                b.push(self.sps[2]); // profile compatibility
                b.push(self.sps[3]); // level
            } else {
                b.extend_from_slice(&[0x42, 0xc0, 0x1f]); // constrained baseline 3.1
            }
            b.push(0xFF); // 4-byte NAL lengths
            b.push(0xE1); // one SPS
            b.extend_from_slice(&(self.sps.len() as u16).to_be_bytes());
            b.extend_from_slice(&self.sps);
            b.push(1); // one PPS
            b.extend_from_slice(&(self.pps.len() as u16).to_be_bytes());
            b.extend_from_slice(&self.pps);
        });
    }

    fn build_moof(&self) -> Vec<u8> {
        let mut moof = Vec::new();
        let mut offset_pos = 0usize;
        mp4_box(&mut moof, b"moof", |b| {
            full_box(b, b"mfhd", 0, 0, |b| {
                b.extend_from_slice(&self.sequence_number.to_be_bytes());
            });
            mp4_box(b, b"traf", |b| {
                // flags: default-base-is-moof | default-sample-duration present
                full_box(b, b"tfhd", 0, 0x020008, |b| {
                    b.extend_from_slice(&TRACK_ID.to_be_bytes());
                    b.extend_from_slice(&self.sample_duration.to_be_bytes());
                });
                full_box(b, b"tfdt", 1, 0, |b| {
                    b.extend_from_slice(&self.base_decode_time.to_be_bytes());
                });
                // flags: data-offset | sample-size | sample-flags present
                full_box(b, b"trun", 0, 0x000601, |b| {
                    b.extend_from_slice(&(self.samples.len() as u32).to_be_bytes());
                    offset_pos = b.len();
                    b.extend_from_slice(&0u32.to_be_bytes()); // data offset, patched below
                    for sample in &self.samples {
                        b.extend_from_slice(&(sample.data.len() as u32).to_be_bytes());
                        let flags: u32 = if sample.is_sync {
                            0x0200_0000 // depends on nothing
                        } else {
                            0x0101_0000 // depends on prior samples
                        };
                        b.extend_from_slice(&flags.to_be_bytes());
                    }
                });
            });
        });
        // From the start of moof to the first mdat payload byte.
        let data_offset = (moof.len() + 8) as u32;
        moof[offset_pos..offset_pos + 4].copy_from_slice(&data_offset.to_be_bytes());
        moof
    }
}
