//! Streaming HTTP for the audiocast project
//!
//! This crate provides the HTTP side of the streaming pipeline: a URL
//! parser, an ordered case-insensitive header store, a chunked
//! transfer decoder, a request engine and a high level [`UrlStream`]
//! that exposes an HTTP response body as a readable byte stream.
//! [`IcyStream`] layers Icecast/Shoutcast metadata demuxing on top,
//! [`BufferedUrlStream`] prefetches the body on a background task and
//! [`HttpAudioServer`] serves an audio stream to HTTP clients.

mod audio_server;
mod buffered;
mod chunked;
mod connection;
mod error;
mod header;
mod icy;
mod request;
mod url;
mod url_stream;

pub use audio_server::{AudioDataProvider, HttpAudioServer};
pub use buffered::BufferedUrlStream;
pub use chunked::ChunkReader;
pub use connection::{AsyncStream, HttpConnection};
pub use error::Error;
pub use header::{
    HeaderLine, HttpHeader, Method, ReplyHeader, RequestHeader, ACCEPT, ACCEPT_ENCODING,
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, CON_CLOSE, CON_KEEP_ALIVE, HOST, LOCATION,
    TRANSFER_ENCODING, USER_AGENT,
};
pub use icy::{IcyMetaData, IcyStream, MetaKind, MetadataCallback};
pub use request::{ConnectCallback, HttpRequest};
pub use url::Url;
pub use url_stream::{UrlStream, UrlStreamConfig};

/// Maximum length of a single header or status line
pub const HTTP_MAX_LEN: usize = 1024;

/// Maximum length of a chunked transfer size line (hex digits + CRLF)
pub const HTTP_CHUNKED_SIZE_MAX_LEN: usize = 16;

/// Default client timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;
