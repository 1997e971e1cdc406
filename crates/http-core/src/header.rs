use tracing::{debug, error, info, warn};

use crate::connection::HttpConnection;
use crate::error::Error;
use crate::{Result, HTTP_MAX_LEN};

pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONNECTION: &str = "Connection";
pub const CON_CLOSE: &str = "close";
pub const CON_KEEP_ALIVE: &str = "keep-alive";
pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub const CHUNKED: &str = "chunked";
pub const ACCEPT: &str = "Accept";
pub const ACCEPT_ALL: &str = "*/*";
pub const USER_AGENT: &str = "User-Agent";
pub const DEFAULT_AGENT: &str =
    "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";
pub const HOST: &str = "Host";
pub const ACCEPT_ENCODING: &str = "Accept-Encoding";
pub const IDENTITY: &str = "identity";
pub const LOCATION: &str = "Location";

const CRLF: &str = "\r\n";

/// HTTP request methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Undefined,
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
    Options,
    Connect,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Undefined => "?",
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Options => "OPTIONS",
            Method::Connect => "CONNECT",
            Method::Patch => "PATCH",
        }
    }

    /// Determine the method from the start of a request line
    pub fn from_line(line: &str) -> Method {
        const ALL: [Method; 9] = [
            Method::Get,
            Method::Head,
            Method::Post,
            Method::Put,
            Method::Delete,
            Method::Trace,
            Method::Options,
            Method::Connect,
            Method::Patch,
        ];
        for m in ALL {
            if line.starts_with(m.as_str()) {
                return m;
            }
        }
        Method::Undefined
    }
}

/// An individual key-value header line
#[derive(Debug, Clone)]
pub struct HeaderLine {
    pub key: String,
    pub value: String,
    pub active: bool,
}

/// Ordered, case-insensitive header store shared by requests and replies.
///
/// Lines keep their insertion order across `write`. Updating a line marks
/// it active again; `set_processed` deactivates everything without
/// deallocating, so a reused request does not leak stale values.
#[derive(Debug, Default)]
pub struct HttpHeader {
    lines: Vec<HeaderLine>,
    chunked: bool,
    auto_create: bool,
}

impl HttpHeader {
    pub fn new() -> Self {
        Self {
            lines: Vec::new(),
            chunked: false,
            auto_create: true,
        }
    }

    /// Insert or update a header line. Empty values are ignored.
    pub fn put(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            debug!(key, "ignoring empty header value");
            return;
        }
        if key.eq_ignore_ascii_case(TRANSFER_ENCODING) && value.eq_ignore_ascii_case(CHUNKED) {
            debug!("reply is chunked");
            self.chunked = true;
        }
        if let Some(line) = self.line_mut(key) {
            line.value = value.to_string();
            line.active = true;
        } else if self.may_create(key) {
            self.lines.push(HeaderLine {
                key: key.to_string(),
                value: value.to_string(),
                active: true,
            });
        } else {
            debug!(key, "not storing unknown header");
        }
    }

    /// Parse and store a received `Key: Value` line, tolerating one
    /// optional space after the colon.
    pub fn put_line(&mut self, raw: &str) {
        let Some(pos) = raw.find(':') else {
            warn!(line = raw, "header line without ':'");
            return;
        };
        let key = raw[..pos].trim();
        let value = raw[pos + 1..].strip_prefix(' ').unwrap_or(&raw[pos + 1..]);
        self.put(key, value.trim_end_matches(['\r', '\n']));
    }

    /// Case-insensitive lookup; inactive lines are invisible
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|l| l.key.trim().eq_ignore_ascii_case(key))
            .filter(|l| l.active)
            .map(|l| l.value.as_str())
    }

    /// Drop all lines
    pub fn clear(&mut self) {
        self.lines.clear();
        self.chunked = false;
    }

    /// Mark all lines inactive without deallocating
    pub fn set_processed(&mut self) {
        for line in &mut self.lines {
            line.active = false;
        }
        self.chunked = false;
    }

    /// When false, only Content-Length and Content-Type may be created
    /// for unknown keys
    pub fn set_auto_create(&mut self, flag: bool) {
        self.auto_create = flag;
    }

    /// The value is set automatically when `Transfer-Encoding: chunked`
    /// is stored
    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn lines(&self) -> &[HeaderLine] {
        &self.lines
    }

    /// Write all active lines followed by the terminating blank line
    pub(crate) async fn write_lines(&self, conn: &mut HttpConnection) -> Result<()> {
        for line in &self.lines {
            if !line.active || line.value.is_empty() {
                continue;
            }
            let msg = format!("{}: {}{}", line.key, line.value, CRLF);
            conn.write_all(msg.as_bytes()).await?;
            info!(" -> {}: {}", line.key, line.value);
        }
        conn.write_all(CRLF.as_bytes()).await?;
        conn.flush().await
    }

    /// Read header lines until the blank line
    pub(crate) async fn read_lines(&mut self, conn: &mut HttpConnection) -> Result<()> {
        loop {
            let line = conn.read_line(HTTP_MAX_LEN, false).await?;
            if line.is_empty() {
                break;
            }
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim_start();
            if trimmed.is_empty() {
                break;
            }
            self.put_line(trimmed);
        }
        Ok(())
    }

    fn line_mut(&mut self, key: &str) -> Option<&mut HeaderLine> {
        self.lines
            .iter_mut()
            .find(|l| l.key.trim().eq_ignore_ascii_case(key))
    }

    fn may_create(&self, key: &str) -> bool {
        self.auto_create
            || key.eq_ignore_ascii_case(CONTENT_LENGTH)
            || key.eq_ignore_ascii_case(CONTENT_TYPE)
    }
}

/// Request side header: method, path and protocol plus the header store
#[derive(Debug)]
pub struct RequestHeader {
    pub header: HttpHeader,
    method: Method,
    path: String,
    protocol: String,
}

impl Default for RequestHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestHeader {
    pub fn new() -> Self {
        Self {
            header: HttpHeader::new(),
            method: Method::Undefined,
            path: "/".to_string(),
            protocol: "HTTP/1.1".to_string(),
        }
    }

    pub fn set_values(&mut self, method: Method, path: &str) {
        self.method = method;
        self.path = path.to_string();
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Request-Line = Method SP Request-URI SP HTTP-Version CRLF
    pub async fn write(&self, conn: &mut HttpConnection) -> Result<()> {
        let first = format!("{} {} {}{}", self.method.as_str(), self.path, self.protocol, CRLF);
        info!("-> {} {} {}", self.method.as_str(), self.path, self.protocol);
        conn.write_all(first.as_bytes()).await?;
        self.header.write_lines(conn).await
    }

    /// Parse a received request line
    pub fn parse_first_line(&mut self, line: &str) -> Result<()> {
        let mut parts = line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| Error::Protocol(format!("empty request line '{}'", line)))?;
        self.method = Method::from_line(method);
        self.path = parts
            .next()
            .ok_or_else(|| Error::Protocol(format!("request line without path '{}'", line)))?
            .to_string();
        if let Some(proto) = parts.next() {
            self.protocol = proto.to_string();
        }
        Ok(())
    }
}

/// Reply side header: status line plus the header store
#[derive(Debug)]
pub struct ReplyHeader {
    pub header: HttpHeader,
    status_code: u16,
    status_msg: String,
    protocol: String,
}

impl Default for ReplyHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyHeader {
    pub fn new() -> Self {
        Self {
            header: HttpHeader::new(),
            status_code: 0,
            status_msg: String::new(),
            protocol: "HTTP/1.1".to_string(),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn status_message(&self) -> &str {
        &self.status_msg
    }

    pub fn set_values(&mut self, status_code: u16, msg: &str) {
        self.status_code = status_code;
        self.status_msg = msg.to_string();
    }

    /// Status code in 200..300
    pub fn is_valid(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Status code in 300..400
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status_code)
    }

    /// Read the status line and all header lines. A timeout while
    /// waiting for the reply marks the status as 401.
    pub async fn read(&mut self, conn: &mut HttpConnection) -> Result<()> {
        self.header.clear();
        let line = match conn.read_line(HTTP_MAX_LEN, false).await {
            Ok(line) => line,
            Err(Error::Timeout(ms)) => {
                error!("reply timed out after {} ms", ms);
                self.status_code = 401;
                return Err(Error::Timeout(ms));
            }
            Err(e) => return Err(e),
        };
        if line.is_empty() {
            return Err(Error::Protocol("connection closed before reply".into()));
        }
        self.parse_first_line(&String::from_utf8_lossy(&line))?;
        if self.is_valid() || self.is_redirect() {
            self.header.read_lines(conn).await?;
        } else {
            // drain the header block of an error reply without storing it
            loop {
                let line = conn.read_line(HTTP_MAX_LEN, false).await?;
                if line.is_empty() || line.iter().all(|b| b.is_ascii_whitespace()) {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Read trailing headers after the final chunk of a chunked body
    pub(crate) async fn read_trailers(&mut self, conn: &mut HttpConnection) -> Result<()> {
        self.header.read_lines(conn).await
    }

    /// Status-Line = HTTP-Version SP Status-Code SP Reason-Phrase CRLF
    pub async fn write(&self, conn: &mut HttpConnection) -> Result<()> {
        let first = format!(
            "{} {} {}{}",
            self.protocol, self.status_code, self.status_msg, CRLF
        );
        conn.write_all(first.as_bytes()).await?;
        self.header.write_lines(conn).await
    }

    fn parse_first_line(&mut self, line: &str) -> Result<()> {
        let mut parts = line.splitn(3, ' ');
        self.protocol = parts
            .next()
            .ok_or_else(|| Error::Protocol(format!("empty status line '{}'", line)))?
            .to_string();
        let code = parts
            .next()
            .ok_or_else(|| Error::Protocol(format!("status line without code '{}'", line)))?;
        self.status_code = code
            .parse()
            .map_err(|_| Error::Protocol(format!("invalid status code '{}'", code)))?;
        self.status_msg = parts.next().unwrap_or("").to_string();
        Ok(())
    }
}
