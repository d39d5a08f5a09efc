//! RTP header encode/decode (RFC 3550 section 5.1). Only the fixed 12-byte
//! header is modeled; CSRC lists and extensions are neither emitted nor
//! expected from the providers and SIP peers this bridge talks to.

use bytes::{Bytes, BytesMut};

use crate::error::{Result, RtpError};

pub const HEADER_LEN: usize = 12;
const RTP_VERSION: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn encode(&self, out: &mut BytesMut) {
        out.extend_from_slice(&[(RTP_VERSION << 6) | 0]);
        let marker_bit = if self.marker { 0x80 } else { 0x00 };
        out.extend_from_slice(&[marker_bit | (self.payload_type & 0x7F)]);
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<(RtpHeader, &[u8])> {
        if buf.len() < HEADER_LEN {
            return Err(RtpError::PacketTooShort(buf.len()));
        }
        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::UnsupportedVersion(version));
        }
        let cc = (buf[0] & 0x0F) as usize;
        let marker = buf[1] & 0x80 != 0;
        let payload_type = buf[1] & 0x7F;
        let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let payload_offset = HEADER_LEN + cc * 4;
        let payload = buf.get(payload_offset..).unwrap_or(&[]);

        Ok((RtpHeader { marker, payload_type, sequence_number, timestamp, ssrc }, payload))
    }
}

/// An RTP packet ready to serialize or as received off the wire.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.header.encode(&mut out);
        out.extend_from_slice(&self.payload);
        out.freeze()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<RtpPacket> {
        let (header, payload) = RtpHeader::decode(buf)?;
        Ok(RtpPacket { header, payload: Bytes::copy_from_slice(payload) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let header = RtpHeader {
            marker: true,
            payload_type: 0,
            sequence_number: 4242,
            timestamp: 160_000,
            ssrc: 0xDEAD_BEEF,
        };
        let packet = RtpPacket { header, payload: Bytes::from_static(&[1, 2, 3, 4]) };
        let wire = packet.to_bytes();
        assert_eq!(wire.len(), HEADER_LEN + 4);

        let decoded = RtpPacket::from_bytes(&wire).unwrap();
        assert_eq!(decoded.header, header);
        assert_eq!(decoded.payload, packet.payload);
    }

    #[test]
    fn rejects_short_packets() {
        assert!(matches!(RtpHeader::decode(&[0u8; 4]), Err(RtpError::PacketTooShort(4))));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0] = 0x40; // version 1
        assert!(matches!(RtpHeader::decode(&buf), Err(RtpError::UnsupportedVersion(1))));
    }
}
