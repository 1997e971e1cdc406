use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::Error;
use crate::Result;

/// URL parser which breaks a full url string up into its individual parts.
///
/// `http://radio.example.com:8000/stream/hits`
/// -> protocol: `http`
/// -> host: `radio.example.com`
/// -> port: `8000`
/// -> path: `/stream/hits`
/// -> root: `http://radio.example.com:8000`
///
/// The port is inferred from the scheme when absent (http=80, https=443,
/// rtsp=554, ftp=21). A missing path defaults to `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    url: String,
    protocol: String,
    host: String,
    path: String,
    root: String,
    port: u16,
}

impl Url {
    /// Parse a URL of the shape `scheme://host[:port][/path]`
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        let protocol_end = url
            .find("://")
            .ok_or_else(|| Error::InvalidUrl(format!("missing '://' in '{}'", url)))?;
        let protocol = url[..protocol_end].to_string();
        let rest_start = protocol_end + 3;
        if rest_start >= url.len() {
            return Err(Error::InvalidUrl(format!("missing host in '{}'", url)));
        }

        let rest = &url[rest_start..];
        let path_start = rest.find('/');
        // a colon is only a port separator when it comes before the path
        let port_start = match (rest.find(':'), path_start) {
            (Some(c), Some(p)) if c < p => Some(c),
            (Some(c), None) => Some(c),
            _ => None,
        };

        let host_end = port_start.or(path_start).unwrap_or(rest.len());
        let host = rest[..host_end].to_string();
        if host.is_empty() {
            return Err(Error::InvalidUrl(format!("missing host in '{}'", url)));
        }

        let port = match port_start {
            Some(c) => {
                let port_str = &rest[c + 1..path_start.unwrap_or(rest.len())];
                port_str
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidUrl(format!("invalid port in '{}'", url)))?
            }
            None => default_port(&protocol)
                .ok_or_else(|| Error::InvalidUrl(format!("unknown scheme '{}'", protocol)))?,
        };

        let (path, root) = match path_start {
            Some(p) => (
                rest[p..].trim().to_string(),
                url[..rest_start + p].to_string(),
            ),
            None => ("/".to_string(), url.to_string()),
        };

        debug!(%protocol, %host, port, %path, "parsed url");

        Ok(Self {
            url: url.to_string(),
            protocol,
            host,
            path,
            root,
            port,
        })
    }

    /// Full url as provided
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Scheme, e.g. `http`
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Host name or dotted IPv4 address
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Path starting with `/`
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Prefix without path: `scheme://host:port`
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Explicit or scheme-inferred port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// True when this url points at a TLS endpoint
    pub fn is_secure(&self) -> bool {
        self.port == 443
    }
}

fn default_port(protocol: &str) -> Option<u16> {
    if protocol.starts_with("https") {
        Some(443)
    } else if protocol.starts_with("http") {
        Some(80)
    } else if protocol.starts_with("rtsp") {
        Some(554)
    } else if protocol.starts_with("ftp") {
        Some(21)
    } else {
        None
    }
}

impl FromStr for Url {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Url::parse(s)
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}{}",
            self.protocol, self.host, self.port, self.path
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_url() {
        let url = Url::parse("http://radio.example.com:8000/stream/hits").unwrap();
        assert_eq!(url.protocol(), "http");
        assert_eq!(url.host(), "radio.example.com");
        assert_eq!(url.port(), 8000);
        assert_eq!(url.path(), "/stream/hits");
        assert_eq!(url.root(), "http://radio.example.com:8000");
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(Url::parse("http://a.example.com").unwrap().port(), 80);
        assert_eq!(Url::parse("https://a.example.com").unwrap().port(), 443);
        assert_eq!(Url::parse("rtsp://a.example.com/x").unwrap().port(), 554);
        assert_eq!(Url::parse("ftp://a.example.com").unwrap().port(), 21);
    }

    #[test]
    fn test_no_path() {
        let url = Url::parse("http://example.com").unwrap();
        assert_eq!(url.path(), "/");
        assert_eq!(url.root(), "http://example.com");
    }

    #[test]
    fn test_ipv4_host_without_path() {
        let url = Url::parse("http://192.168.1.10:8080").unwrap();
        assert_eq!(url.host(), "192.168.1.10");
        assert_eq!(url.port(), 8080);
        assert_eq!(url.path(), "/");
    }

    #[test]
    fn test_colon_in_path_is_not_a_port() {
        let url = Url::parse("http://example.com/a:b/c").unwrap();
        assert_eq!(url.host(), "example.com");
        assert_eq!(url.port(), 80);
        assert_eq!(url.path(), "/a:b/c");
    }

    #[test]
    fn test_is_secure() {
        assert!(Url::parse("https://example.com").unwrap().is_secure());
        assert!(!Url::parse("http://example.com").unwrap().is_secure());
    }

    #[test]
    fn test_malformed() {
        assert!(Url::parse("example.com/path").is_err());
        assert!(Url::parse("http://").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let url = Url::parse("http://example.com:80/path").unwrap();
        assert_eq!(url.to_string(), "http://example.com:80/path");
        let again = Url::parse(&url.to_string()).unwrap();
        assert_eq!(again.host(), url.host());
        assert_eq!(again.port(), url.port());
        assert_eq!(again.path(), url.path());
    }
}
