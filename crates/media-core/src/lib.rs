//! Decoder pipeline for the audiocast receive path
//!
//! RTP payloads arrive tagged with a MIME type; the [`DecoderRegistry`]
//! routes them to a registered [`AudioDecoder`]. Raw PCM payloads go
//! through [`NetworkOrderDecoder`] (L16 big-endian to host order) or
//! [`L8Decoder`] (8 bit to 16 bit expansion); a linear [`Resampler`]
//! can compensate clock drift between sender and receiver.

mod decoder;
mod registry;
mod resample;

pub use decoder::{
    shared_sink, AudioDecoder, L8Decoder, Mp3FrameDecoder, NetworkOrderDecoder, SharedPcmSink,
};
pub use registry::DecoderRegistry;
pub use resample::Resampler;

/// Result type for media operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the decoder pipeline
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No decoder is registered for the MIME type
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}
