use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

use crate::chunked::ChunkReader;
use crate::connection::HttpConnection;
use crate::error::Error;
use crate::header::{
    Method, ReplyHeader, RequestHeader, ACCEPT, ACCEPT_ALL, ACCEPT_ENCODING, CONNECTION,
    CONTENT_LENGTH, CONTENT_TYPE, CON_KEEP_ALIVE, DEFAULT_AGENT, HOST, IDENTITY, USER_AGENT,
};
use crate::url::Url;
use crate::{Result, DEFAULT_TIMEOUT_MS};

/// Callback invoked right before the request header is written, allowing
/// additional parameters to be injected dynamically
pub type ConnectCallback = Box<dyn Fn(&Url, &mut RequestHeader) + Send + Sync>;

/// Simple API to process GET, POST, PUT and DELETE requests and to read
/// the reply body, transparently de-chunking when the server uses
/// `Transfer-Encoding: chunked`.
///
/// The request does not follow redirects itself; [`crate::UrlStream`]
/// handles those by re-issuing the request against the new location.
pub struct HttpRequest {
    conn: Option<HttpConnection>,
    request: RequestHeader,
    reply: ReplyHeader,
    chunk_reader: ChunkReader,
    agent: String,
    connection: String,
    accept: String,
    accept_encoding: String,
    timeout: Duration,
    is_ready: bool,
    consumed: usize,
    on_connect: Option<ConnectCallback>,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            conn: None,
            request: RequestHeader::new(),
            reply: ReplyHeader::new(),
            chunk_reader: ChunkReader::new(),
            agent: DEFAULT_AGENT.to_string(),
            connection: CON_KEEP_ALIVE.to_string(),
            accept: ACCEPT_ALL.to_string(),
            accept_encoding: IDENTITY.to_string(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            is_ready: false,
            consumed: 0,
            on_connect: None,
        }
    }

    /// (Re-)define the connection the request runs over
    pub fn set_client(&mut self, mut conn: HttpConnection) {
        conn.set_timeout(self.timeout);
        self.conn = Some(conn);
    }

    pub fn set_agent(&mut self, agent: &str) {
        self.agent = agent.to_string();
    }

    /// `keep-alive` or `close`
    pub fn set_connection(&mut self, connection: &str) {
        self.connection = connection.to_string();
    }

    pub fn set_accept_mime(&mut self, mime: &str) {
        self.accept = mime.to_string();
    }

    pub fn set_accept_encoding(&mut self, enc: &str) {
        self.accept_encoding = enc.to_string();
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        if let Some(conn) = self.conn.as_mut() {
            conn.set_timeout(timeout);
        }
    }

    /// Callback which allows additional parameters to be added dynamically
    pub fn set_on_connect(&mut self, callback: ConnectCallback) {
        self.on_connect = Some(callback);
    }

    pub fn connected(&self) -> bool {
        self.conn.as_ref().map(|c| c.connected()).unwrap_or(false)
    }

    /// True when the reply header has been received and the body can be read
    pub fn is_ready(&self) -> bool {
        self.is_ready
    }

    /// Adds/updates a request header
    pub fn add_request_header(&mut self, key: &str, value: &str) {
        self.request.header.put(key, value);
    }

    /// Access to the request header
    pub fn request(&self) -> &RequestHeader {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut RequestHeader {
        &mut self.request
    }

    /// Head information of the reply
    pub fn reply(&self) -> &ReplyHeader {
        &self.reply
    }

    /// Reply header value lookup
    pub fn reply_header(&self, key: &str) -> Option<&str> {
        self.reply.header.get(key)
    }

    pub fn content_length(&self) -> Option<usize> {
        self.reply
            .header
            .get(CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
    }

    /// http get
    pub async fn get(&mut self, url: &Url, accept_mime: Option<&str>) -> Result<u16> {
        if let Some(mime) = accept_mime {
            self.accept = mime.to_string();
        }
        self.process(Method::Get, url, None, None).await
    }

    /// http head
    pub async fn head(&mut self, url: &Url, accept_mime: Option<&str>) -> Result<u16> {
        if let Some(mime) = accept_mime {
            self.accept = mime.to_string();
        }
        self.process(Method::Head, url, None, None).await
    }

    /// http post
    pub async fn post(&mut self, url: &Url, mime: &str, data: &[u8]) -> Result<u16> {
        self.process(Method::Post, url, Some(mime), Some(data)).await
    }

    /// http put
    pub async fn put(&mut self, url: &Url, mime: &str, data: &[u8]) -> Result<u16> {
        self.process(Method::Put, url, Some(mime), Some(data)).await
    }

    /// http delete
    pub async fn delete(&mut self, url: &Url) -> Result<u16> {
        self.process(Method::Delete, url, None, None).await
    }

    /// Process the request and read the reply header from the server,
    /// returning the HTTP status code. A header read timeout yields the
    /// synthetic status 401 with an empty body.
    pub async fn process(
        &mut self,
        method: Method,
        url: &Url,
        mime: Option<&str>,
        body: Option<&[u8]>,
    ) -> Result<u16> {
        let body_len = body.map(|b| b.len()).filter(|l| *l > 0);
        self.process_begin(method, url, mime, body_len).await?;
        if let Some(data) = body {
            if !data.is_empty() {
                info!("writing {} body bytes", data.len());
                let conn = self.conn_mut()?;
                conn.write_all(data).await?;
            }
        }
        self.process_end().await
    }

    /// Like [`process`](Self::process), but pumps the body from a stream
    /// in 512 byte blocks until EOF
    pub async fn process_stream<R>(
        &mut self,
        method: Method,
        url: &Url,
        mime: Option<&str>,
        body: &mut R,
        len: Option<usize>,
    ) -> Result<u16>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.process_begin(method, url, mime, len).await?;
        let conn = self.conn_mut()?;
        let mut buf = [0u8; 512];
        let mut total = 0usize;
        loop {
            let n = body.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            conn.write_all(&buf[..n]).await?;
            total += n;
        }
        info!("written body: {} bytes", total);
        self.process_end().await
    }

    /// Read reply body bytes, de-chunking when necessary
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(0);
        };
        let n = if self.reply.header.is_chunked() {
            self.chunk_reader.read(conn, &mut self.reply, buf).await?
        } else {
            conn.read(buf).await?
        };
        self.consumed += n;
        Ok(n)
    }

    /// Read the reply body up to the next newline
    pub async fn read_line(&mut self, max: usize, include_newline: bool) -> Result<Vec<u8>> {
        let conn = self.conn_mut()?;
        let line = conn.read_line(max, include_newline).await?;
        self.consumed += line.len();
        Ok(line)
    }

    /// Bytes that can be read without waiting for the network. For
    /// chunked bodies this is the remainder of the current chunk; for
    /// plain bodies the content length minus the consumed bytes.
    pub fn available(&self) -> usize {
        if self.reply.header.is_chunked() {
            return self.chunk_reader.available();
        }
        match self.content_length() {
            Some(len) => len.saturating_sub(self.consumed),
            None => self.conn.as_ref().map(|c| c.buffered()).unwrap_or(0),
        }
    }

    /// Close the connection. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            if conn.connected() {
                info!("stop");
                conn.stop().await;
            }
        }
        self.conn = None;
        self.is_ready = false;
    }

    async fn process_begin(
        &mut self,
        method: Method,
        url: &Url,
        mime: Option<&str>,
        body_len: Option<usize>,
    ) -> Result<()> {
        self.is_ready = false;
        self.consumed = 0;

        if !self.connected() {
            info!("connecting to host {} port {}", url.host(), url.port());
            let conn = HttpConnection::connect(url.host(), url.port(), self.timeout).await?;
            self.conn = Some(conn);
        } else {
            debug!("already connected");
        }

        if let Some(callback) = &self.on_connect {
            callback(url, &mut self.request);
        }

        self.reply.header.set_processed();

        self.request.set_values(method, url.path());
        if let Some(len) = body_len {
            self.request.header.put(CONTENT_LENGTH, &len.to_string());
        }
        let connection = self.connection.clone();
        let agent = self.agent.clone();
        let accept_encoding = self.accept_encoding.clone();
        let accept = self.accept.clone();
        self.request.header.put(HOST, url.host());
        self.request.header.put(CONNECTION, &connection);
        self.request.header.put(USER_AGENT, &agent);
        self.request.header.put(ACCEPT_ENCODING, &accept_encoding);
        self.request.header.put(ACCEPT, &accept);
        if let Some(mime) = mime {
            self.request.header.put(CONTENT_TYPE, mime);
        }

        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::InvalidState("the client has not been defined".into()))?;
        self.request.write(conn).await
    }

    async fn process_end(&mut self) -> Result<u16> {
        debug!("request written, waiting for reply");
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::InvalidState("no client".into()))?;
        match self.reply.read(conn).await {
            Ok(()) => {}
            // a header timeout surfaces as status 401 with an empty body
            Err(Error::Timeout(_)) => return Ok(self.reply.status_code()),
            Err(e) => return Err(e),
        }

        if self.reply.header.is_chunked() {
            self.chunk_reader.open(conn, &mut self.reply).await?;
        }

        self.is_ready = true;
        Ok(self.reply.status_code())
    }

    fn conn_mut(&mut self) -> Result<&mut HttpConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::InvalidState("the client has not been defined".into()))
    }
}
