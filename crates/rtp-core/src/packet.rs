use bitvec::prelude::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// RTP protocol version (always 2 in practice)
pub const RTP_VERSION: u8 = 2;

/// Minimum header size without CSRC entries
pub const RTP_MIN_HEADER_SIZE: usize = 12;

/// RTP header according to RFC 3550.
///
/// Header extensions are tolerated on parse (the extension block is
/// skipped) but never generated; the audio profile used here does not
/// carry them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: RtpSequenceNumber,
    pub timestamp: RtpTimestamp,
    pub ssrc: RtpSsrc,
    /// Contributing source identifiers
    pub csrc: Vec<u32>,
}

impl RtpHeader {
    pub fn new(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
    ) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
        }
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        RTP_MIN_HEADER_SIZE + self.csrc.len() * 4
    }

    /// Offset of the payload inside a packet with this header, with
    /// `extra` accounting for payload specific prefixes (e.g. the
    /// 4 byte RFC 2250 MPEG audio header)
    pub fn payload_offset(&self, extra: usize) -> usize {
        self.size() + extra
    }

    /// Parse an RTP header from the start of `buf`
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < RTP_MIN_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTP_MIN_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        // first byte: version (2 bits), padding, extension, CSRC count
        let first = buf.get_u8();
        let bits = first.view_bits::<Msb0>();
        let version = first >> 6;
        if version != RTP_VERSION {
            return Err(Error::InvalidPacket(format!("bad RTP version {}", version)));
        }
        let padding = bits[2];
        let extension = bits[3];
        let cc = first & 0x0F;

        // second byte: marker, payload type (7 bits)
        let second = buf.get_u8();
        let marker = second.view_bits::<Msb0>()[0];
        let payload_type = second & 0x7F;

        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        let mut csrc = Vec::with_capacity(cc as usize);
        for _ in 0..cc {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall {
                    required: 4,
                    available: buf.remaining(),
                });
            }
            csrc.push(buf.get_u32());
        }

        // skip over a header extension when present
        if extension {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall {
                    required: 4,
                    available: buf.remaining(),
                });
            }
            let _ext_id = buf.get_u16();
            let ext_len = buf.get_u16() as usize * 4;
            if buf.remaining() < ext_len {
                return Err(Error::BufferTooSmall {
                    required: ext_len,
                    available: buf.remaining(),
                });
            }
            buf.advance(ext_len);
        }

        Ok(Self {
            version,
            padding,
            extension,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
        })
    }

    /// Serialize the header into `buf`
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.reserve(self.size());

        let mut first = 0u8;
        first |= (self.version & 0x03) << 6;
        if self.padding {
            first |= 1 << 5;
        }
        first |= (self.csrc.len() as u8) & 0x0F;
        buf.put_u8(first);

        let mut second = 0u8;
        if self.marker {
            second |= 1 << 7;
        }
        second |= self.payload_type & 0x7F;
        buf.put_u8(second);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }
    }
}

/// A complete RTP packet: header plus payload bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    pub fn size(&self) -> usize {
        self.header.size() + self.payload.len()
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        self.header.serialize(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let header = RtpHeader::parse(&mut buf)?;
        let payload = Bytes::copy_from_slice(buf);
        Ok(Self { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut header = RtpHeader::new(10, 1000, 0x1234_5678, 0x13F9_7E67);
        header.marker = true;

        let mut buf = BytesMut::new();
        header.serialize(&mut buf);
        assert_eq!(buf.len(), RTP_MIN_HEADER_SIZE);

        let mut reader = buf.freeze();
        let parsed = RtpHeader::parse(&mut reader).unwrap();
        assert_eq!(parsed.version, 2);
        assert!(parsed.marker);
        assert_eq!(parsed.payload_type, 10);
        assert_eq!(parsed.sequence_number, 1000);
        assert_eq!(parsed.timestamp, 0x1234_5678);
        assert_eq!(parsed.ssrc, 0x13F9_7E67);
        assert!(parsed.csrc.is_empty());
    }

    #[test]
    fn test_packet_round_trip() {
        let mut header = RtpHeader::new(96, 7, 441, 0xABCD_EF01);
        header.marker = true;
        let payload = Bytes::from_static(b"pcm pcm pcm");
        let packet = RtpPacket::new(header, payload.clone());

        let wire = packet.serialize();
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.header.payload_type, 96);
        assert_eq!(parsed.header.sequence_number, 7);
        assert_eq!(parsed.payload, payload);
    }

    #[test]
    fn test_header_with_csrc() {
        let mut header = RtpHeader::new(14, 55, 1152, 0x1111_2222);
        header.csrc = vec![0x3333_4444, 0x5555_6666];

        let mut buf = BytesMut::new();
        header.serialize(&mut buf);
        assert_eq!(buf.len(), RTP_MIN_HEADER_SIZE + 8);

        let mut reader = buf.freeze();
        let parsed = RtpHeader::parse(&mut reader).unwrap();
        assert_eq!(parsed.csrc, vec![0x3333_4444, 0x5555_6666]);
        assert_eq!(parsed.payload_offset(4), 12 + 8 + 4);
    }

    #[test]
    fn test_wire_layout() {
        let mut header = RtpHeader::new(10, 0x0102, 0x0304_0506, 0x1314_1516);
        header.marker = true;
        let mut buf = BytesMut::new();
        header.serialize(&mut buf);

        // V=2 P=0 X=0 CC=0 -> 0x80; M=1 PT=10 -> 0x8A
        assert_eq!(&buf[..4], &[0x80, 0x8A, 0x01, 0x02]);
        assert_eq!(&buf[4..8], &[0x03, 0x04, 0x05, 0x06]);
        assert_eq!(&buf[8..12], &[0x13, 0x14, 0x15, 0x16]);
    }

    #[test]
    fn test_truncated_packet_rejected() {
        let data = [0x80u8, 0x0A, 0x00];
        assert!(RtpPacket::parse(&data).is_err());
    }

    #[test]
    fn test_bad_version_rejected() {
        let data = [0x40u8, 0x0A, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        assert!(RtpPacket::parse(&data).is_err());
    }
}
