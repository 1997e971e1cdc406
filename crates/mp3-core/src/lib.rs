//! MPEG audio frame parsing for the audiocast project
//!
//! Synchronizes on MPEG-1/2/2.5 Layer I/II/III frame boundaries in an
//! incoming byte stream, validates headers across consecutive frames and
//! emits whole frames downstream. Also provides a standalone buffer
//! classifier that decides whether a chunk of bytes is MP3 data.

mod header;
mod id3;
mod parser;

pub use header::{
    ChannelMode, Emphasis, FrameHeader, FrameReason, MpegLayer, MpegVersion, find_frame_sync,
};
pub use id3::{Id3Callback, Id3Field, Id3MetaData, Id3v1Parser, Id3v2Parser, ID3_GENRES};
pub use parser::{is_valid_mp3, FrameSink, Mp3FrameParser};

/// Result type for MP3 operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for MP3 frame operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No valid frame sync was found within the search distance
    #[error("No MPEG frame sync within {0} bytes")]
    Sync(usize),

    /// A frame header failed validation
    #[error("Invalid frame header: {0:?}")]
    InvalidHeader(FrameReason),
}
