use tracing::warn;

/// Default fragment size for PCM payloads, in bytes
pub const DEFAULT_PCM_FRAGMENT_SIZE: usize = 640;

/// Default fragment size for MP3 payloads; large enough for any frame
pub const DEFAULT_MP3_FRAGMENT_SIZE: usize = 2884;

/// Samples per MPEG Layer III frame at MPEG-1 rates
const MP3_SAMPLES_PER_FRAME: u32 = 1152;

/// Samples per AAC frame
const AAC_SAMPLES_PER_FRAME: u32 = 1024;

/// PCM parameters shared by the linear formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmInfo {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
}

impl PcmInfo {
    pub fn new(sample_rate: u32, channels: u8, bits_per_sample: u8) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        (self.bits_per_sample as usize / 8) * self.channels as usize
    }
}

/// The audio payload kinds that can be streamed over RTP.
///
/// Each kind knows its (static or dynamic) payload type, RTP clock and
/// SDP media description; see RFC 3551 for the static assignments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioFormat {
    /// Linear 16 bit PCM, big-endian on the wire
    L16(PcmInfo),
    /// Linear 8 bit PCM (dynamic payload type)
    L8 { sample_rate: u32, channels: u8 },
    /// G.711 mu-law, 8 kHz mono
    Pcmu,
    /// G.711 a-law, 8 kHz mono
    Pcma,
    /// GSM 06.10, 8 kHz mono
    Gsm,
    /// G.722, 8 kHz RTP clock
    G722,
    /// IMA ADPCM; payload type depends on the sample rate
    Dvi4 { sample_rate: u32 },
    /// MPEG audio (MP3) with the 90 kHz RTP clock
    Mp3 {
        sample_rate: u32,
        channels: u8,
        /// Prepend the 4 byte RFC 2250 MPEG audio header to each packet
        use_rfc2250: bool,
    },
    /// AAC (MPEG4-GENERIC, AAC-hbr mode)
    Aac { sample_rate: u32, channels: u8 },
    /// Opus; RTP clock is always 48 kHz
    Opus { channels: u8 },
    /// aptX
    AptX {
        sample_rate: u32,
        channels: u8,
        bits_per_sample: u8,
    },
}

/// A payload format bound to streaming parameters: the fragment size
/// (audio bytes per RTP packet) and the send period.
///
/// Defaults are derived from the kind; both values can be overridden,
/// e.g. when an encoder dictates its own frame duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpAudioFormat {
    kind: AudioFormat,
    stream_name: String,
    fragment_size: usize,
    timer_period_us: u64,
}

impl RtpAudioFormat {
    pub fn new(kind: AudioFormat) -> Self {
        let fragment_size = match kind {
            AudioFormat::Mp3 { .. } => DEFAULT_MP3_FRAGMENT_SIZE,
            _ => DEFAULT_PCM_FRAGMENT_SIZE,
        };
        let mut format = Self {
            kind,
            stream_name: "AudiocastStream".to_string(),
            fragment_size,
            timer_period_us: 20_000,
        };
        format.timer_period_us = format.derive_timer_period_us();
        format
    }

    /// L16 stereo/mono helper
    pub fn l16(sample_rate: u32, channels: u8) -> Self {
        Self::new(AudioFormat::L16(PcmInfo::new(sample_rate, channels, 16)))
    }

    pub fn kind(&self) -> &AudioFormat {
        &self.kind
    }

    /// Name used for the SDP `s=` line
    pub fn set_stream_name(&mut self, name: &str) {
        self.stream_name = name.to_string();
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Audio bytes per RTP packet
    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    pub fn set_fragment_size(&mut self, fragment_size: usize) {
        self.fragment_size = fragment_size;
        self.timer_period_us = self.derive_timer_period_us();
    }

    /// Send period in microseconds
    pub fn timer_period_us(&self) -> u64 {
        self.timer_period_us
    }

    /// Override the send period, e.g. from an encoder frame duration
    pub fn set_timer_period_us(&mut self, period_us: u64) {
        self.timer_period_us = period_us;
    }

    /// Static payload type per RFC 3551, or a dynamic one (96+)
    pub fn payload_type(&self) -> u8 {
        match &self.kind {
            AudioFormat::L16(info) => {
                // static assignments exist only for 44.1 kHz
                if info.sample_rate == 44_100 {
                    match info.channels {
                        1 => 11,
                        2 => 10,
                        _ => 96,
                    }
                } else {
                    96
                }
            }
            AudioFormat::L8 { .. } => 96,
            AudioFormat::Pcmu => 0,
            AudioFormat::Pcma => 8,
            AudioFormat::Gsm => 3,
            AudioFormat::G722 => 9,
            AudioFormat::Dvi4 { sample_rate } => match sample_rate {
                8000 => 5,
                16000 => 6,
                11025 => 16,
                22050 => 17,
                other => {
                    warn!(sample_rate = other, "unsupported DVI4 rate, using PT 5");
                    5
                }
            },
            AudioFormat::Mp3 { .. } => 14,
            AudioFormat::Aac { .. } => 96,
            AudioFormat::Opus { .. } => 101,
            AudioFormat::AptX { .. } => 98,
        }
    }

    /// RTP clock rate; 90 kHz for MPEG audio, 48 kHz for Opus
    pub fn clock_rate(&self) -> u32 {
        match &self.kind {
            AudioFormat::L16(info) => info.sample_rate,
            AudioFormat::L8 { sample_rate, .. } => *sample_rate,
            AudioFormat::Pcmu | AudioFormat::Pcma | AudioFormat::Gsm | AudioFormat::G722 => 8000,
            AudioFormat::Dvi4 { sample_rate } => *sample_rate,
            AudioFormat::Mp3 { .. } => 90_000,
            AudioFormat::Aac { sample_rate, .. } => *sample_rate,
            AudioFormat::Opus { .. } => 48_000,
            AudioFormat::AptX { sample_rate, .. } => *sample_rate,
        }
    }

    pub fn channels(&self) -> u8 {
        match &self.kind {
            AudioFormat::L16(info) => info.channels,
            AudioFormat::L8 { channels, .. } => *channels,
            AudioFormat::Pcmu | AudioFormat::Pcma | AudioFormat::Gsm | AudioFormat::G722 => 1,
            AudioFormat::Dvi4 { .. } => 1,
            AudioFormat::Mp3 { channels, .. } => *channels,
            AudioFormat::Aac { channels, .. } => *channels,
            AudioFormat::Opus { channels } => *channels,
            AudioFormat::AptX { channels, .. } => *channels,
        }
    }

    /// RTP timestamp advance per packet
    pub fn timestamp_increment(&self) -> u32 {
        match &self.kind {
            AudioFormat::L16(info) => {
                let frame = info.bytes_per_frame().max(1);
                (self.fragment_size / frame) as u32
            }
            AudioFormat::L8 { channels, .. } => {
                (self.fragment_size / (*channels).max(1) as usize) as u32
            }
            AudioFormat::Mp3 { .. } => MP3_SAMPLES_PER_FRAME,
            AudioFormat::Aac { .. } => AAC_SAMPLES_PER_FRAME,
            // for the remaining formats the increment follows the send
            // period at the RTP clock
            _ => (self.clock_rate() as u64 * self.timer_period_us / 1_000_000) as u32,
        }
    }

    /// MIME type announced to decoders
    pub fn mime(&self) -> &'static str {
        match &self.kind {
            AudioFormat::L16(_) => "audio/L16",
            AudioFormat::L8 { .. } => "audio/L8",
            AudioFormat::Pcmu => "audio/PCMU",
            AudioFormat::Pcma => "audio/PCMA",
            AudioFormat::Gsm => "audio/gsm",
            AudioFormat::G722 => "audio/g722",
            AudioFormat::Dvi4 { .. } => "audio/adpcm",
            AudioFormat::Mp3 { .. } => "audio/mpeg",
            AudioFormat::Aac { .. } => "audio/aac",
            AudioFormat::Opus { .. } => "audio/opus",
            AudioFormat::AptX { .. } => "audio/aptx",
        }
    }

    /// MIME type for a static RTP payload type, used on the receive
    /// path before any SDP information is consulted
    pub fn mime_for_payload_type(payload_type: u8) -> Option<&'static str> {
        match payload_type {
            0 => Some("audio/PCMU"),
            3 => Some("audio/gsm"),
            4 => Some("audio/g723"),
            5 | 6 | 16 | 17 => Some("audio/adpcm"),
            8 => Some("audio/PCMA"),
            9 => Some("audio/g722"),
            10 | 11 => Some("audio/L16"),
            14 => Some("audio/mpeg"),
            _ => None,
        }
    }

    /// MIME for an SDP encoding token such as `L16` or `MPA`
    pub fn mime_for_encoding(encoding: &str) -> Option<&'static str> {
        if encoding.eq_ignore_ascii_case("L16") {
            Some("audio/L16")
        } else if encoding.eq_ignore_ascii_case("L8") {
            Some("audio/L8")
        } else if encoding.eq_ignore_ascii_case("PCMU") {
            Some("audio/PCMU")
        } else if encoding.eq_ignore_ascii_case("PCMA") {
            Some("audio/PCMA")
        } else if encoding.eq_ignore_ascii_case("GSM") {
            Some("audio/gsm")
        } else if encoding.eq_ignore_ascii_case("G722") {
            Some("audio/g722")
        } else if encoding.eq_ignore_ascii_case("MPA") {
            Some("audio/mpeg")
        } else if encoding.eq_ignore_ascii_case("MPEG4-GENERIC") {
            Some("audio/aac")
        } else if encoding.eq_ignore_ascii_case("OPUS") {
            Some("audio/opus")
        } else if encoding.eq_ignore_ascii_case("DVI4") {
            Some("audio/adpcm")
        } else if encoding.eq_ignore_ascii_case("APTX") {
            Some("audio/aptx")
        } else {
            None
        }
    }

    /// Extra payload prefix bytes before the audio data
    pub fn rtp_prefix_len(&self) -> usize {
        match &self.kind {
            AudioFormat::Mp3 { use_rfc2250, .. } if *use_rfc2250 => 4,
            _ => 0,
        }
    }

    /// Convert a fragment to its on-wire representation in place and
    /// return the wire length. L16 is byte-swapped to network order;
    /// all other formats pass through.
    pub fn to_wire(&self, data: &mut [u8]) -> usize {
        match &self.kind {
            AudioFormat::L16(_) => {
                let n = data.len() & !1;
                for chunk in data[..n].chunks_exact_mut(2) {
                    let value = i16::from_ne_bytes([chunk[0], chunk[1]]);
                    let be = value.to_be_bytes();
                    chunk[0] = be[0];
                    chunk[1] = be[1];
                }
                n
            }
            _ => data.len(),
        }
    }

    /// The media and attribute lines of the SDP body for this format
    pub fn sdp_media_lines(&self) -> String {
        let payload_type = self.payload_type();
        let mut out = format!(
            "s={}\r\nc=IN IP4 0.0.0.0\r\nt=0 0\r\nm=audio 0 RTP/AVP {}\r\n",
            self.stream_name, payload_type
        );
        match &self.kind {
            AudioFormat::L16(info) => {
                out.push_str(&format!(
                    "a=rtpmap:{} L16/{}/{}\r\n",
                    payload_type, info.sample_rate, info.channels
                ));
            }
            AudioFormat::L8 {
                sample_rate,
                channels,
            } => {
                out.push_str(&format!(
                    "a=rtpmap:{} L8/{}/{}\r\n",
                    payload_type, sample_rate, channels
                ));
            }
            // static payload types carry an implicit rtpmap
            AudioFormat::Pcmu | AudioFormat::Pcma | AudioFormat::Gsm | AudioFormat::G722 => {}
            AudioFormat::Dvi4 { sample_rate } => {
                out.push_str(&format!(
                    "a=rtpmap:{} DVI4/{}\r\n",
                    payload_type, sample_rate
                ));
            }
            AudioFormat::Mp3 {
                sample_rate,
                channels,
                ..
            } => {
                if *channels == 1 {
                    out.push_str(&format!("a=rtpmap:{} MPA/90000\r\n", payload_type));
                } else {
                    out.push_str(&format!(
                        "a=rtpmap:{} MPA/90000/{}\r\n",
                        payload_type, channels
                    ));
                }
                out.push_str(&format!("a=fmtp:{} layer=3\r\n", payload_type));
                let ptime_ms = if *sample_rate > 0 {
                    (MP3_SAMPLES_PER_FRAME * 1000 / sample_rate).max(10)
                } else {
                    26
                };
                out.push_str(&format!("a=ptime:{}\r\n", ptime_ms));
            }
            AudioFormat::Aac {
                sample_rate,
                channels,
            } => {
                out.push_str(&format!(
                    "a=rtpmap:{} MPEG4-GENERIC/{}/{}\r\n",
                    payload_type, sample_rate, channels
                ));
                out.push_str(&format!(
                    "a=fmtp:{} streamtype=5; profile-level-id=1; mode=AAC-hbr;\r\n",
                    payload_type
                ));
            }
            AudioFormat::Opus { channels } => {
                out.push_str(&format!("a=rtpmap:{} opus/48000/2\r\n", payload_type));
                out.push_str(&format!(
                    "a=fmtp:{} stereo=1; sprop-stereo={}\r\n",
                    payload_type,
                    u8::from(*channels == 2)
                ));
            }
            AudioFormat::AptX {
                sample_rate,
                channels,
                bits_per_sample,
            } => {
                out.push_str(&format!(
                    "a=rtpmap:{} aptx/{}/{}\r\n",
                    payload_type, sample_rate, channels
                ));
                out.push_str(&format!(
                    "a=fmtp:{} variant=standard; bitresolution={};\r\n",
                    payload_type, bits_per_sample
                ));
            }
        }
        out
    }

    // send period so that one fragment spans exactly its playing time
    fn derive_timer_period_us(&self) -> u64 {
        match &self.kind {
            AudioFormat::L16(info) => {
                let frame = info.bytes_per_frame().max(1);
                let samples = (self.fragment_size / frame) as u64;
                if info.sample_rate > 0 {
                    samples * 1_000_000 / info.sample_rate as u64
                } else {
                    20_000
                }
            }
            AudioFormat::L8 {
                sample_rate,
                channels,
            } => {
                let samples = (self.fragment_size / (*channels).max(1) as usize) as u64;
                if *sample_rate > 0 {
                    samples * 1_000_000 / *sample_rate as u64
                } else {
                    20_000
                }
            }
            AudioFormat::Mp3 { sample_rate, .. } => {
                if *sample_rate > 0 {
                    MP3_SAMPLES_PER_FRAME as u64 * 1_000_000 / *sample_rate as u64
                } else {
                    26_122
                }
            }
            AudioFormat::Aac { sample_rate, .. } => {
                if *sample_rate > 0 {
                    AAC_SAMPLES_PER_FRAME as u64 * 1_000_000 / *sample_rate as u64
                } else {
                    23_219
                }
            }
            // 20 ms is the standard packet time for the telephony codecs
            _ => 20_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l16_static_payload_types() {
        assert_eq!(RtpAudioFormat::l16(44_100, 2).payload_type(), 10);
        assert_eq!(RtpAudioFormat::l16(44_100, 1).payload_type(), 11);
        assert_eq!(RtpAudioFormat::l16(16_000, 1).payload_type(), 96);
    }

    #[test]
    fn test_l16_timing() {
        let mut format = RtpAudioFormat::l16(44_100, 2);
        format.set_fragment_size(1764);
        // 1764 bytes = 441 stereo 16 bit samples = 10 ms
        assert_eq!(format.timestamp_increment(), 441);
        assert_eq!(format.timer_period_us(), 10_000);
    }

    #[test]
    fn test_dvi4_payload_types() {
        for (rate, pt) in [(8000, 5), (16000, 6), (11025, 16), (22050, 17)] {
            let format = RtpAudioFormat::new(AudioFormat::Dvi4 { sample_rate: rate });
            assert_eq!(format.payload_type(), pt);
        }
    }

    #[test]
    fn test_mp3_timing_and_prefix() {
        let format = RtpAudioFormat::new(AudioFormat::Mp3 {
            sample_rate: 44_100,
            channels: 2,
            use_rfc2250: true,
        });
        assert_eq!(format.payload_type(), 14);
        assert_eq!(format.clock_rate(), 90_000);
        assert_eq!(format.timestamp_increment(), 1152);
        assert_eq!(format.rtp_prefix_len(), 4);
        // 1152 samples at 44.1 kHz
        assert_eq!(format.timer_period_us(), 26_122);
    }

    #[test]
    fn test_l16_to_wire_swaps_bytes() {
        let format = RtpAudioFormat::l16(44_100, 2);
        let mut data = [0x01u8, 0x02, 0x03, 0x04];
        let n = format.to_wire(&mut data);
        assert_eq!(n, 4);
        if cfg!(target_endian = "little") {
            assert_eq!(data, [0x02, 0x01, 0x04, 0x03]);
        } else {
            assert_eq!(data, [0x01, 0x02, 0x03, 0x04]);
        }
    }

    #[test]
    fn test_sdp_l16_stereo() {
        let format = RtpAudioFormat::l16(44_100, 2);
        let sdp = format.sdp_media_lines();
        assert!(sdp.contains("m=audio 0 RTP/AVP 10\r\n"));
        assert!(sdp.contains("a=rtpmap:10 L16/44100/2\r\n"));
    }

    #[test]
    fn test_sdp_mp3() {
        let format = RtpAudioFormat::new(AudioFormat::Mp3 {
            sample_rate: 44_100,
            channels: 2,
            use_rfc2250: false,
        });
        let sdp = format.sdp_media_lines();
        assert!(sdp.contains("m=audio 0 RTP/AVP 14\r\n"));
        assert!(sdp.contains("a=rtpmap:14 MPA/90000/2\r\n"));
        assert!(sdp.contains("a=fmtp:14 layer=3\r\n"));
        assert!(sdp.contains("a=ptime:26\r\n"));
    }

    #[test]
    fn test_sdp_gsm_has_no_rtpmap() {
        let format = RtpAudioFormat::new(AudioFormat::Gsm);
        let sdp = format.sdp_media_lines();
        assert!(sdp.contains("m=audio 0 RTP/AVP 3\r\n"));
        assert!(!sdp.contains("a=rtpmap"));
    }

    #[test]
    fn test_mime_tables() {
        assert_eq!(RtpAudioFormat::mime_for_payload_type(10), Some("audio/L16"));
        assert_eq!(RtpAudioFormat::mime_for_payload_type(14), Some("audio/mpeg"));
        assert_eq!(RtpAudioFormat::mime_for_payload_type(96), None);
        assert_eq!(
            RtpAudioFormat::mime_for_encoding("mpa"),
            Some("audio/mpeg")
        );
        assert_eq!(RtpAudioFormat::mime_for_encoding("L16"), Some("audio/L16"));
        assert_eq!(RtpAudioFormat::mime_for_encoding("weird"), None);
    }
}
