//! RTSP server, client and RTP audio streaming glue for audiocast
//!
//! The server side accepts RTSP control connections, negotiates a
//! session (DESCRIBE/SETUP/PLAY) and drives an
//! [`audiocast_rtp_core::RtpStreamer`] that delivers the audio over
//! UDP. The client side runs the complementary handshake, receives the
//! RTP payload stream and routes it into a decoder pipeline from
//! `audiocast-media-core`.

mod client;
mod error;
mod message;
mod sdp;
mod server;
mod session;

pub use client::{RtspClient, RtspClientConfig};
pub use error::Error;
pub use message::{date_header, parse_status_line, RtspMethod, RtspRequest};
pub use sdp::{build_sdp, SdpInfo};
pub use server::{RtspServer, RtspServerConfig, RtspServerLoop, ServerPathCallback};
pub use session::{RtspSession, SessionPathCallback, SessionState, SharedStreamer};

/// Default RTSP listening port
pub const DEFAULT_RTSP_PORT: u16 = 8554;

/// Default session idle timeout while streaming
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 60_000;

/// Keepalive interval for client sessions
pub const KEEPALIVE_INTERVAL_MS: u64 = 25_000;

/// First local port probed for client side RTP reception
pub const CLIENT_RTP_PORT_SCAN_START: u16 = 5004;

/// Result type for RTSP operations
pub type Result<T> = std::result::Result<T, Error>;
