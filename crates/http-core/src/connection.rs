use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::Error;
use crate::Result;

/// Marker trait for the byte streams the HTTP client can run over:
/// plain TCP, TLS, or an in-memory stream in tests.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A buffered, timeout-bounded connection to an HTTP server.
///
/// All reads and writes are wrapped in the configured timeout. Line
/// reads stop at `\n` or at the requested maximum, NUL-free; the
/// newline (and a preceding `\r`) can be stripped on request.
pub struct HttpConnection {
    inner: BufReader<Box<dyn AsyncStream>>,
    timeout: Duration,
    open: bool,
}

impl HttpConnection {
    /// Open a plain TCP connection
    pub async fn connect(host: &str, port: u16, read_timeout: Duration) -> Result<Self> {
        debug!(host, port, "connecting");
        let stream = timeout(read_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Connect(format!("connect to {}:{} timed out", host, port)))?
            .map_err(|e| Error::Connect(format!("connect to {}:{} failed: {}", host, port, e)))?;
        stream.set_nodelay(true).ok();
        Ok(Self::from_stream(Box::new(stream), read_timeout))
    }

    /// Open a TLS connection. When no CA certificate is configured the
    /// server certificate is not verified, matching the insecure client
    /// behaviour of typical embedded radio streamers.
    #[cfg(feature = "tls")]
    pub async fn connect_tls(
        host: &str,
        port: u16,
        read_timeout: Duration,
        ca_cert_pem: Option<&str>,
    ) -> Result<Self> {
        use std::sync::Arc;

        let config = match ca_cert_pem {
            Some(pem) => {
                let mut roots = rustls::RootCertStore::empty();
                let certs = rustls_pemfile::certs(&mut pem.as_bytes())
                    .map_err(|e| Error::Tls(format!("invalid CA pem: {}", e)))?;
                for cert in certs {
                    roots
                        .add(&rustls::Certificate(cert))
                        .map_err(|e| Error::Tls(format!("invalid CA cert: {}", e)))?;
                }
                rustls::ClientConfig::builder()
                    .with_safe_defaults()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
            None => {
                let mut config = rustls::ClientConfig::builder()
                    .with_safe_defaults()
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth();
                config
                    .dangerous()
                    .set_certificate_verifier(Arc::new(insecure::NoVerify));
                config
            }
        };

        let server_name = rustls::ServerName::try_from(host)
            .map_err(|_| Error::Tls(format!("invalid server name '{}'", host)))?;
        let tcp = timeout(read_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Connect(format!("connect to {}:{} timed out", host, port)))?
            .map_err(|e| Error::Connect(format!("connect to {}:{} failed: {}", host, port, e)))?;
        tcp.set_nodelay(true).ok();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let tls = timeout(read_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| Error::Connect(format!("TLS handshake with {} timed out", host)))?
            .map_err(|e| Error::Connect(format!("TLS handshake with {} failed: {}", host, e)))?;
        Ok(Self::from_stream(Box::new(tls), read_timeout))
    }

    /// Wrap an already established stream
    pub fn from_stream(stream: Box<dyn AsyncStream>, read_timeout: Duration) -> Self {
        Self {
            inner: BufReader::new(stream),
            timeout: read_timeout,
            open: true,
        }
    }

    /// Change the read/write timeout
    pub fn set_timeout(&mut self, read_timeout: Duration) {
        self.timeout = read_timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True until the connection has been shut down
    pub fn connected(&self) -> bool {
        self.open
    }

    /// Read into `buf`, returning 0 on a closed connection
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.open || buf.is_empty() {
            return Ok(0);
        }
        timeout(self.timeout, self.inner.read(buf))
            .await
            .map_err(|_| Error::Timeout(self.timeout.as_millis() as u64))?
            .map_err(Error::Io)
    }

    /// Fill `buf` completely or fail
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        timeout(self.timeout, self.inner.read_exact(buf))
            .await
            .map_err(|_| Error::Timeout(self.timeout.as_millis() as u64))?
            .map_err(Error::Io)?;
        Ok(())
    }

    /// Read a single line, up to `max - 1` bytes or the next `\n`.
    ///
    /// With `include_newline` the terminating `\r\n` is preserved;
    /// otherwise both `\r` and `\n` are stripped. Returns an empty
    /// vector on a closed connection.
    pub async fn read_line(&mut self, max: usize, include_newline: bool) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            if out.len() + 1 >= max {
                break;
            }
            let mut byte = [0u8; 1];
            let n = self.read(&mut byte).await?;
            if n == 0 {
                break;
            }
            out.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
        }
        if !include_newline {
            while matches!(out.last(), Some(b'\n') | Some(b'\r')) {
                out.pop();
            }
        }
        Ok(out)
    }

    /// Peek at the next byte without consuming it; `None` at EOF
    pub async fn peek(&mut self) -> Result<Option<u8>> {
        let buf = timeout(self.timeout, self.inner.fill_buf())
            .await
            .map_err(|_| Error::Timeout(self.timeout.as_millis() as u64))?
            .map_err(Error::Io)?;
        Ok(buf.first().copied())
    }

    /// Discard `n` buffered bytes (after a successful peek)
    pub fn consume(&mut self, n: usize) {
        self.inner.consume(n);
    }

    /// Number of bytes already buffered from the socket
    pub fn buffered(&self) -> usize {
        self.inner.buffer().len()
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        timeout(self.timeout, self.inner.write_all(data))
            .await
            .map_err(|_| Error::Timeout(self.timeout.as_millis() as u64))?
            .map_err(Error::Io)
    }

    pub async fn flush(&mut self) -> Result<()> {
        timeout(self.timeout, self.inner.flush())
            .await
            .map_err(|_| Error::Timeout(self.timeout.as_millis() as u64))?
            .map_err(Error::Io)
    }

    /// Shut down the write side and mark the connection closed.
    /// Safe to call more than once.
    pub async fn stop(&mut self) {
        if self.open {
            self.open = false;
            let _ = self.inner.shutdown().await;
        }
    }
}

#[cfg(feature = "tls")]
mod insecure {
    use std::time::SystemTime;

    pub struct NoVerify;

    impl rustls::client::ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::Certificate,
            _intermediates: &[rustls::Certificate],
            _server_name: &rustls::ServerName,
            _scts: &mut dyn Iterator<Item = &[u8]>,
            _ocsp_response: &[u8],
            _now: SystemTime,
        ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::ServerCertVerified::assertion())
        }
    }
}
