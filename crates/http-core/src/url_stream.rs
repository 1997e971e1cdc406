use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::connection::HttpConnection;
use crate::error::Error;
use crate::header::{Method, CON_CLOSE, CON_KEEP_ALIVE, LOCATION};
use crate::request::HttpRequest;
use crate::url::Url;
use crate::{Result, DEFAULT_TIMEOUT_MS};

const ICY_METADATA_HEADER: &str = "Icy-MetaData";

/// Configuration for a [`UrlStream`]
#[derive(Debug, Clone)]
pub struct UrlStreamConfig {
    /// Buffer backing single byte `read`/`peek`
    pub read_buffer_size: usize,
    /// Client timeout applied to connect, read and write
    pub timeout: Duration,
    /// Wait for body data to arrive before `begin` returns
    pub wait_for_data: bool,
    /// Maximum number of redirect hops before giving up
    pub max_redirects: usize,
    /// Wi-Fi power save hint; stored only, no effect on socket IO
    pub power_save: bool,
    /// PEM encoded CA certificate for TLS connections. Without it the
    /// server certificate is accepted unverified.
    pub ca_cert: Option<String>,
}

impl Default for UrlStreamConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            wait_for_data: true,
            max_redirects: 8,
            power_save: false,
            ca_cert: None,
        }
    }
}

/// Represents the content of a URL as a readable byte stream.
///
/// `begin` issues the request and follows redirects; afterwards the
/// body is available via `read_bytes` (bulk) or `read`/`peek` (single
/// byte, via a small internal buffer).
pub struct UrlStream {
    request: HttpRequest,
    cfg: UrlStreamConfig,
    url: Option<Url>,
    size: Option<usize>,
    total_read: u64,
    read_buffer: Vec<u8>,
    read_pos: usize,
    read_size: usize,
    active: bool,
}

impl Default for UrlStream {
    fn default() -> Self {
        Self::new(UrlStreamConfig::default())
    }
}

impl UrlStream {
    pub fn new(cfg: UrlStreamConfig) -> Self {
        Self {
            request: HttpRequest::new(),
            cfg,
            url: None,
            size: None,
            total_read: 0,
            read_buffer: Vec::new(),
            read_pos: 0,
            read_size: 0,
            active: false,
        }
    }

    /// Execute the http request; by default a GET request. Returns true
    /// when the server answered with 200 and the body can be read.
    pub async fn begin(
        &mut self,
        url_str: &str,
        accept_mime: Option<&str>,
        method: Method,
        request_mime: Option<&str>,
        body: Option<&[u8]>,
    ) -> Result<bool> {
        info!(url = url_str, "begin");
        let mut url = Url::parse(url_str)?;

        if self.active {
            self.end().await;
        }
        if let Some(mime) = accept_mime {
            self.request.set_accept_mime(mime);
        }
        self.request.set_timeout(self.cfg.timeout);

        let conn = self.open_connection(&url).await?;
        self.request.set_client(conn);
        let mut status = self.request.process(method, &url, request_mime, body).await?;

        // follow redirects; the Icy-MetaData request header survives hops
        let mut hops = 0usize;
        while self.request.reply().is_redirect() {
            let Some(location) = self.request.reply_header(LOCATION).map(str::to_string) else {
                warn!("redirect reply without Location header");
                break;
            };
            hops += 1;
            if hops > self.cfg.max_redirects {
                return Err(Error::RedirectLimit(hops));
            }
            warn!(%location, "redirected");
            let icy = self
                .request
                .request()
                .header
                .get(ICY_METADATA_HEADER)
                .map(str::to_string);
            url = Url::parse(&location)?;
            self.request.stop().await;
            let conn = self.open_connection(&url).await?;
            self.request.set_client(conn);
            if let Some(icy) = icy {
                self.request.request_mut().header.put(ICY_METADATA_HEADER, &icy);
            }
            status = self.request.process(method, &url, request_mime, body).await?;
        }

        self.size = self.request.content_length();
        self.total_read = 0;
        self.active = status == 200;
        info!(status, "http status");

        if self.active && self.cfg.wait_for_data {
            self.wait_for_data(self.cfg.timeout).await;
        }

        self.url = Some(url);
        Ok(self.active)
    }

    /// Stop the request but keep the buffers for reuse
    pub async fn end(&mut self) {
        if self.active {
            self.request.stop().await;
        }
        self.active = false;
        self.clear();
    }

    /// Release the internal buffers
    pub fn clear(&mut self) {
        self.read_buffer = Vec::new();
        self.read_pos = 0;
        self.read_size = 0;
    }

    pub fn is_active(&self) -> bool {
        self.active && self.request.is_ready()
    }

    pub fn available(&self) -> usize {
        if !self.active {
            return 0;
        }
        self.request.available()
    }

    /// Bulk read of body bytes
    pub async fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.active {
            return Ok(0);
        }
        // a known content length ends the stream without waiting for EOF
        if let Some(size) = self.size {
            if self.total_read >= size as u64 && self.read_pos >= self.read_size {
                return Ok(0);
            }
        }
        // serve any remainder of the single byte buffer first
        if self.read_pos < self.read_size {
            let n = (self.read_size - self.read_pos).min(buf.len());
            buf[..n].copy_from_slice(&self.read_buffer[self.read_pos..self.read_pos + n]);
            self.read_pos += n;
            self.total_read += n as u64;
            return Ok(n);
        }
        let n = self.request.read(buf).await?;
        self.total_read += n as u64;
        Ok(n)
    }

    /// Buffered single byte read; `None` at end of stream
    pub async fn read(&mut self) -> Result<Option<u8>> {
        if !self.active {
            return Ok(None);
        }
        self.fill_buffer().await?;
        if self.is_eos() {
            return Ok(None);
        }
        let byte = self.read_buffer[self.read_pos];
        self.read_pos += 1;
        self.total_read += 1;
        Ok(Some(byte))
    }

    /// Buffered single byte peek
    pub async fn peek(&mut self) -> Result<Option<u8>> {
        if !self.active {
            return Ok(None);
        }
        self.fill_buffer().await?;
        if self.is_eos() {
            return Ok(None);
        }
        Ok(Some(self.read_buffer[self.read_pos]))
    }

    pub fn content_length(&self) -> Option<usize> {
        self.size
    }

    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// Access to the underlying request, e.g. for additional headers
    pub fn http_request(&mut self) -> &mut HttpRequest {
        &mut self.request
    }

    pub fn reply_header(&self, key: &str) -> Option<&str> {
        self.request.reply_header(key)
    }

    /// Power save hint; retained for configuration symmetry only
    pub fn set_power_save(&mut self, flag: bool) {
        self.cfg.power_save = flag;
    }

    /// PEM CA certificate for https connections
    pub fn set_ca_cert(&mut self, pem: &str) {
        self.cfg.ca_cert = Some(pem.to_string());
    }

    pub fn set_wait_for_data(&mut self, flag: bool) {
        self.cfg.wait_for_data = flag;
    }

    /// Whether the connection should be closed by the server after the reply
    pub fn set_connection_close(&mut self, close: bool) {
        self.request
            .set_connection(if close { CON_CLOSE } else { CON_KEEP_ALIVE });
    }

    /// Waits until body data is available, polling in bounded steps.
    /// Returns false when the request failed or nothing arrived in time.
    pub async fn wait_for_data(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.request.available() == 0 {
            if Instant::now() >= deadline {
                break;
            }
            if self.request.reply().status_code() >= 300 {
                warn!("error code received, stop waiting for data");
                break;
            }
            sleep(Duration::from_millis(500)).await;
        }
        self.request.available() > 0
    }

    async fn open_connection(&self, url: &Url) -> Result<HttpConnection> {
        #[cfg(feature = "tls")]
        if url.is_secure() {
            return HttpConnection::connect_tls(
                url.host(),
                url.port(),
                self.cfg.timeout,
                self.cfg.ca_cert.as_deref(),
            )
            .await;
        }
        #[cfg(not(feature = "tls"))]
        if url.is_secure() {
            warn!("https url without tls feature, using plain TCP");
        }
        HttpConnection::connect(url.host(), url.port(), self.cfg.timeout).await
    }

    async fn fill_buffer(&mut self) -> Result<()> {
        if self.is_eos() {
            if let Some(size) = self.size {
                if self.total_read >= size as u64 {
                    self.read_pos = 0;
                    self.read_size = 0;
                    return Ok(());
                }
            }
            if self.read_buffer.len() < self.cfg.read_buffer_size {
                self.read_buffer.resize(self.cfg.read_buffer_size, 0);
            }
            let size = self.cfg.read_buffer_size;
            self.read_size = self.request.read(&mut self.read_buffer[..size]).await?;
            self.read_pos = 0;
        }
        Ok(())
    }

    fn is_eos(&self) -> bool {
        self.read_pos >= self.read_size
    }
}
