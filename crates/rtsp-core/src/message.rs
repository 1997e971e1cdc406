use chrono::Utc;
use nom::{
    bytes::complete::{tag, take_till, take_till1},
    character::complete::{digit1, space1},
    combinator::map_res,
    IResult,
};
use tracing::warn;

use crate::error::Error;
use crate::Result;

/// The RTSP methods understood by the session handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspMethod {
    Options,
    Describe,
    Setup,
    Play,
    Pause,
    Teardown,
}

impl RtspMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RtspMethod::Options => "OPTIONS",
            RtspMethod::Describe => "DESCRIBE",
            RtspMethod::Setup => "SETUP",
            RtspMethod::Play => "PLAY",
            RtspMethod::Pause => "PAUSE",
            RtspMethod::Teardown => "TEARDOWN",
        }
    }

    pub fn from_token(token: &str) -> Option<RtspMethod> {
        match token {
            "OPTIONS" => Some(RtspMethod::Options),
            "DESCRIBE" => Some(RtspMethod::Describe),
            "SETUP" => Some(RtspMethod::Setup),
            "PLAY" => Some(RtspMethod::Play),
            "PAUSE" => Some(RtspMethod::Pause),
            "TEARDOWN" => Some(RtspMethod::Teardown),
            _ => None,
        }
    }
}

/// A parsed RTSP request: method, URL parts and the relevant headers
#[derive(Debug, Clone)]
pub struct RtspRequest {
    pub method: RtspMethod,
    pub url: String,
    /// `host[:port]` part of the request URL
    pub host_port: String,
    /// Path of the request URL without the leading slash
    pub path: String,
    /// Path portion before the final `=`, e.g. `trackID`
    pub pre_suffix: String,
    /// Path portion after the final `=`, e.g. `0`
    pub suffix: String,
    /// CSeq value, stored verbatim for the echo in the reply
    pub cseq: String,
    pub session: Option<String>,
    /// Client RTP port from the SETUP Transport header
    pub client_rtp_port: Option<u16>,
    pub content_length: Option<usize>,
}

// Request-Line = Method SP Request-URI SP RTSP-Version CRLF
fn request_line(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, method) = take_till1(|c| c == ' ' || c == '\t')(input)?;
    let (input, _) = space1(input)?;
    let (input, url) = take_till1(|c| c == ' ' || c == '\t')(input)?;
    let (input, _) = space1(input)?;
    let (input, _) = tag("RTSP/")(input)?;
    Ok((input, (method, url)))
}

/// Parse a full RTSP request (first line plus headers).
///
/// Unknown methods yield a protocol error; the caller logs and ignores
/// those requests without tearing the session down.
pub fn parse_request(text: &str) -> Result<RtspRequest> {
    let first_line = text
        .lines()
        .next()
        .ok_or_else(|| Error::Protocol("empty request".into()))?;
    let (_, (method_token, url)) = request_line(first_line)
        .map_err(|_| Error::Protocol(format!("malformed request line '{}'", first_line)))?;
    let method = RtspMethod::from_token(method_token)
        .ok_or_else(|| Error::Protocol(format!("unsupported method '{}'", method_token)))?;

    let (host_port, path) = split_rtsp_url(url);
    let (pre_suffix, suffix) = match path.rfind('=') {
        Some(eq) => (path[..eq].to_string(), path[eq + 1..].to_string()),
        None => (path.clone(), String::new()),
    };

    let cseq = header_value(text, "CSeq")
        .ok_or_else(|| Error::Protocol("request without CSeq".into()))?;
    let session = header_value(text, "Session").map(|s| {
        // drop any ;timeout=... parameter
        s.split(';').next().unwrap_or("").trim().to_string()
    });
    let client_rtp_port = header_value(text, "Transport").and_then(|t| parse_client_port(&t));
    let content_length = header_value(text, "Content-Length").and_then(|v| v.trim().parse().ok());

    Ok(RtspRequest {
        method,
        url: url.to_string(),
        host_port,
        path,
        pre_suffix,
        suffix,
        cseq,
        session,
        client_rtp_port,
        content_length,
    })
}

/// Split `rtsp://host[:port]/path` into host:port and the path with
/// the leading slash removed
fn split_rtsp_url(url: &str) -> (String, String) {
    let rest = url
        .strip_prefix("rtsp://")
        .or_else(|| url.strip_prefix("RTSP://"))
        .unwrap_or(url);
    match rest.find('/') {
        Some(slash) => (
            rest[..slash].to_string(),
            rest[slash + 1..].trim_end_matches('/').to_string(),
        ),
        None => (rest.to_string(), String::new()),
    }
}

/// Case-insensitive lookup of a header value in a raw message
pub fn header_value(text: &str, name: &str) -> Option<String> {
    for line in text.lines() {
        let Some(colon) = line.find(':') else {
            continue;
        };
        if line[..colon].trim().eq_ignore_ascii_case(name) {
            return Some(line[colon + 1..].trim().to_string());
        }
    }
    None
}

// Transport: RTP/AVP;unicast;client_port=A-B (RTP/AVP/UDP accepted too)
fn parse_client_port(transport: &str) -> Option<u16> {
    let start = transport.find("client_port=")?;
    let ports = &transport[start + "client_port=".len()..];
    let end = ports
        .find(|c: char| c != '-' && !c.is_ascii_digit())
        .unwrap_or(ports.len());
    let mut parts = ports[..end].split('-');
    parts.next()?.parse().ok()
}

/// `Date:` header in the GMT format RTSP peers expect
pub fn date_header() -> String {
    Utc::now()
        .format("Date: %a, %b %d %Y %H:%M:%S GMT")
        .to_string()
}

/// Parse `RTSP/1.0 200 OK`, returning the status code and message
pub fn parse_status_line(line: &str) -> Result<(u16, String)> {
    fn inner(input: &str) -> IResult<&str, u16> {
        let (input, _) = tag("RTSP/")(input)?;
        let (input, _) = take_till(|c| c == ' ')(input)?;
        let (input, _) = space1(input)?;
        let (input, code) = map_res(digit1, |s: &str| s.parse::<u16>())(input)?;
        Ok((input, code))
    }
    let (rest, code) =
        inner(line).map_err(|_| Error::Protocol(format!("malformed status line '{}'", line)))?;
    Ok((code, rest.trim().to_string()))
}

/// Reply to OPTIONS
pub fn response_options(cseq: &str) -> String {
    format!(
        "RTSP/1.0 200 OK\r\nCSeq: {}\r\nPublic: DESCRIBE, SETUP, TEARDOWN, PLAY, PAUSE\r\n\r\n",
        cseq
    )
}

/// Reply to DESCRIBE carrying the SDP body
pub fn response_describe(cseq: &str, host_port: &str, sdp: &str) -> String {
    format!(
        "RTSP/1.0 200 OK\r\nCSeq: {}\r\n{}\r\nContent-Base: rtsp://{}/\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{}",
        cseq,
        date_header(),
        host_port,
        sdp.len(),
        sdp
    )
}

/// Reply to SETUP announcing session id and the negotiated transport
#[allow(clippy::too_many_arguments)]
pub fn response_setup(
    cseq: &str,
    session_id: &str,
    destination: &str,
    source: &str,
    client_rtp_port: u16,
    client_rtcp_port: u16,
    server_rtp_port: u16,
    server_rtcp_port: u16,
) -> String {
    format!(
        "RTSP/1.0 200 OK\r\nCSeq: {}\r\n{}\r\nSession: {}\r\nTransport: RTP/AVP;unicast;destination={};source={};client_port={}-{};server_port={}-{}\r\n\r\n",
        cseq,
        date_header(),
        session_id,
        destination,
        source,
        client_rtp_port,
        client_rtcp_port,
        server_rtp_port,
        server_rtcp_port
    )
}

/// Reply to PLAY
pub fn response_play(cseq: &str, session_id: &str) -> String {
    format!(
        "RTSP/1.0 200 OK\r\nCSeq: {}\r\nRange: npt=0.000-\r\nSession: {}\r\n\r\n",
        cseq, session_id
    )
}

/// Reply to PAUSE
pub fn response_pause(cseq: &str, session_id: &str) -> String {
    format!(
        "RTSP/1.0 200 OK\r\nCSeq: {}\r\nSession: {}\r\n\r\n",
        cseq, session_id
    )
}

/// Reply to TEARDOWN
pub fn response_teardown(cseq: &str) -> String {
    format!("RTSP/1.0 200 OK\r\nCSeq: {}\r\n\r\n", cseq)
}

/// Error reply with the given status
pub fn response_error(cseq: &str, status: u16, reason: &str) -> String {
    warn!(status, reason, "rtsp error reply");
    format!("RTSP/1.0 {} {}\r\nCSeq: {}\r\n\r\n", status, reason, cseq)
}
