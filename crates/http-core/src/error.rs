use thiserror::Error;

/// Error type for HTTP client operations
#[derive(Debug, Error)]
pub enum Error {
    /// The URL could not be parsed
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// TCP connect or TLS handshake failed
    #[error("Connect failed: {0}")]
    Connect(String),

    /// A read or write exceeded the configured timeout
    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    /// Malformed HTTP line or chunk length
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Too many redirects, or a redirect loop
    #[error("Redirect limit exceeded after {0} hops")]
    RedirectLimit(usize),

    /// TLS configuration problem
    #[error("TLS error: {0}")]
    Tls(String),

    /// The request is not in a state where the operation is possible
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO error on the underlying socket
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
