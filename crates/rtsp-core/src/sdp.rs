use nom::{
    bytes::complete::take_till1,
    character::complete::{char, digit1, space1},
    combinator::{map_res, opt},
    sequence::preceded,
    IResult,
};
use rand::Rng;
use tracing::debug;

use audiocast_rtp_core::RtpAudioFormat;

use crate::error::Error;
use crate::Result;

/// Build the DESCRIBE SDP body for a payload format.
///
/// The media and attribute lines come from the format itself; the
/// session level origin carries a random id and the server host.
pub fn build_sdp(format: &RtpAudioFormat, host: &str) -> String {
    let origin_id: u8 = rand::thread_rng().gen();
    format!(
        "v=0\r\no=- {} 0 IN IP4 {}\r\n{}a=control:trackID=0",
        origin_id,
        host,
        format.sdp_media_lines()
    )
}

/// The subset of SDP a receiving client needs: the first audio rtpmap
/// and the track control attribute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SdpInfo {
    pub payload_type: Option<u8>,
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: u8,
    pub control: Option<String>,
}

// a=rtpmap:<pt> <encoding>/<clock>[/<channels>]
fn rtpmap_value(input: &str) -> IResult<&str, (u8, &str, u32, Option<u8>)> {
    let (input, payload_type) = map_res(digit1, |s: &str| s.parse::<u8>())(input)?;
    let (input, _) = space1(input)?;
    let (input, encoding) = take_till1(|c| c == '/' || c == '\r' || c == '\n')(input)?;
    let (input, _) = char('/')(input)?;
    let (input, clock) = map_res(digit1, |s: &str| s.parse::<u32>())(input)?;
    let (input, channels) = opt(preceded(
        char('/'),
        map_res(digit1, |s: &str| s.parse::<u8>()),
    ))(input)?;
    Ok((input, (payload_type, encoding, clock, channels)))
}

impl SdpInfo {
    /// Parse an SDP body, capturing the first `a=rtpmap:` and the media
    /// (or session) level `a=control:`.
    pub fn parse(sdp: &str) -> SdpInfo {
        let mut info = SdpInfo::default();
        for line in sdp.lines() {
            let line = line.trim();
            if let Some(value) = line.strip_prefix("a=rtpmap:") {
                if info.payload_type.is_none() {
                    if let Ok((_, (payload_type, encoding, clock, channels))) = rtpmap_value(value)
                    {
                        info.payload_type = Some(payload_type);
                        info.encoding = encoding.to_string();
                        info.clock_rate = clock;
                        info.channels = channels.unwrap_or(1);
                        debug!(
                            payload_type,
                            encoding = %info.encoding,
                            clock,
                            channels = info.channels,
                            "rtpmap parsed"
                        );
                    }
                }
            } else if let Some(value) = line.strip_prefix("a=control:") {
                if info.control.is_none() {
                    info.control = Some(value.trim().to_string());
                }
            } else if let Some(value) = line.strip_prefix("m=audio ") {
                // a static payload type without an rtpmap line
                if info.payload_type.is_none() {
                    if let Some(pt) = value.split_whitespace().nth(2) {
                        info.payload_type = pt.parse().ok();
                    }
                }
            }
        }
        info
    }

    /// MIME for the negotiated payload, preferring the static payload
    /// type table over the SDP encoding token
    pub fn mime(&self) -> Result<&'static str> {
        if let Some(payload_type) = self.payload_type {
            if let Some(mime) = RtpAudioFormat::mime_for_payload_type(payload_type) {
                return Ok(mime);
            }
        }
        RtpAudioFormat::mime_for_encoding(&self.encoding).ok_or_else(|| {
            Error::Protocol(format!(
                "no decoder mapping for encoding '{}'",
                self.encoding
            ))
        })
    }
}
