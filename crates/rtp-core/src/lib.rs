//! RTP core library for the audiocast project
//!
//! Provides RTP packet encoding/decoding, audio payload format
//! descriptors with their SDP representations, a reference counted UDP
//! transport for RTP/RTCP socket pairs and a periodic [`RtpStreamer`]
//! that packetizes audio from an [`AudioSource`].

mod error;
mod packet;
mod payload;
mod source;
mod streamer;
mod transport;

pub use error::Error;
pub use packet::{RtpHeader, RtpPacket, RTP_MIN_HEADER_SIZE, RTP_VERSION};
pub use payload::{AudioFormat, PcmInfo, RtpAudioFormat};
pub use source::{AudioSource, PcmBufferSource, QueueAudioSource, QueueWriter};
pub use streamer::{Pacing, RtpStreamer, StreamerConfig};
pub use transport::{RtpTransport, TransportHandle};

/// Typedef for RTP timestamp values
pub type RtpTimestamp = u32;

/// Typedef for RTP sequence numbers
pub type RtpSequenceNumber = u16;

/// Typedef for the RTP synchronization source identifier
pub type RtpSsrc = u32;

/// Default synchronization source carried in every outgoing packet.
/// Override via [`StreamerConfig::ssrc`] when sessions need unique
/// identifiers.
pub const SSRC_AUDIOCAST: RtpSsrc = 0x13F9_7E67;

/// Size of the streaming buffer: one fragment plus the RTP header
pub const STREAMING_BUFFER_SIZE: usize = 2048;

/// First server port probed for the RTP/RTCP pair
pub const RTP_PORT_SCAN_START: u16 = 6970;

/// Result type for RTP operations
pub type Result<T> = std::result::Result<T, Error>;
