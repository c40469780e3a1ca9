//! Error types for the segmenting pipeline.

use thiserror::Error;

/// Errors that can occur while cataloging a log or producing segments.
#[derive(Debug, Error)]
pub enum Error {
    /// The log could not be opened or is missing required metadata.
    #[error("failed to open log: {0}")]
    Open(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the MCAP reader.
    #[error("MCAP error: {0}")]
    Mcap(#[from] mcap::McapError),

    /// A camera payload could not be decoded into pixels.
    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),

    /// Error from the H.264 encoder.
    #[error("encoder error: {0}")]
    Encode(#[from] openh264::Error),

    /// The encoder returned no slice data for a frame.
    #[error("encoder returned an empty bitstream")]
    EmptyBitstream,

    /// A decoded frame does not match the stream's established dimensions.
    #[error("frame size changed mid-stream: expected {expected_width}x{expected_height}, got {width}x{height}")]
    DimensionMismatch {
        expected_width: u32,
        expected_height: u32,
        width: u32,
        height: u32,
    },

    /// A segment window produced zero frames. The duration margin makes this
    /// unreachable; hitting it means the frame-grid arithmetic is broken.
    #[error("empty frame window for segment starting at frame {frame_index}")]
    EmptyWindow { frame_index: u64 },

    /// A stage chain was assembled in an order its stages do not support.
    #[error("invalid execution plan: {0}")]
    InvalidPlan(&'static str),
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
