use thiserror::Error;

/// Error type for RTSP operations
#[derive(Debug, Error)]
pub enum Error {
    /// TCP connect to the RTSP peer failed
    #[error("Connect failed: {0}")]
    Connect(String),

    /// A read or write exceeded the configured timeout
    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    /// The peer closed the control connection
    #[error("Connection closed by peer")]
    Disconnected,

    /// Malformed RTSP line or header
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer answered with a non-2xx status
    #[error("Request rejected with status {0}")]
    Status(u16),

    /// Local UDP port scan failed
    #[error("No free UDP port: {0}")]
    ResourceExhausted(String),

    /// Session state does not allow the operation
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// RTP layer failure
    #[error(transparent)]
    Rtp(#[from] audiocast_rtp_core::Error),

    /// Decoder pipeline failure
    #[error(transparent)]
    Media(#[from] audiocast_media_core::Error),

    /// IO error on a socket
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
