use thiserror::Error;

/// Error type for RTP operations
#[derive(Debug, Error)]
pub enum Error {
    /// Error when decoding an RTP packet
    #[error("Invalid RTP packet: {0}")]
    InvalidPacket(String),

    /// Buffer too small for the requested operation
    #[error("Buffer too small: need {required} but have {available}")]
    BufferTooSmall { required: usize, available: usize },

    /// UDP socket problem
    #[error("Transport error: {0}")]
    Transport(String),

    /// The RTP/RTCP port scan range is exhausted
    #[error("No free UDP port pair: {0}")]
    ResourceExhausted(String),

    /// Streamer lifecycle misuse
    #[error("Streamer error: {0}")]
    Streamer(String),

    /// IO error when sending or receiving packets
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
