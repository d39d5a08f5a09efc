//! Raw-text SDP parsing, in the style of `MediaConfigConverter`: no typed SDP
//! object model, just line-by-line string matching over the handful of
//! fields a call leg actually needs (`c=`, `m=audio`, `a=rtpmap`).

use std::collections::HashMap;
use std::net::IpAddr;

use crate::error::{Result, SdpError};

#[derive(Debug, Clone)]
pub struct RtpMapEntry {
    pub encoding_name: String,
    pub clock_rate: u32,
}

/// The pieces of an offer or answer's audio media description we act on.
#[derive(Debug, Clone)]
pub struct RemoteMedia {
    pub connection_ip: IpAddr,
    pub port: u16,
    pub payload_types: Vec<u8>,
    pub rtpmap: HashMap<u8, RtpMapEntry>,
    /// `sprop-maxcapturerate` from each payload type's `a=fmtp:` line, where
    /// present (Opus only; spec 4.1's sample-rate override).
    pub sprop_maxcapturerate: HashMap<u8, u32>,
}

/// Parse the subset of an SDP body needed to pick a codec and learn where to
/// send RTP. Strips `a=rtcp:` lines before scanning, matching the original
/// implementation's defensive pre-pass (some UAs emit a stray rtcp line with
/// no matching m= section, which otherwise confuses naive parsers).
pub fn parse_media(body: &str) -> Result<RemoteMedia> {
    let lines: Vec<&str> = body.lines().filter(|l| !l.starts_with("a=rtcp:")).collect();

    let connection_ip = lines
        .iter()
        .find(|l| l.starts_with("c="))
        .ok_or(SdpError::MissingConnectionLine)
        .and_then(|l| parse_connection_line(l))?;

    let media_line = lines
        .iter()
        .find(|l| l.starts_with("m=audio"))
        .ok_or(SdpError::MissingMediaLine)?;
    let (port, payload_types) = parse_media_line(media_line)?;

    let mut rtpmap = HashMap::new();
    let mut sprop_maxcapturerate = HashMap::new();
    for line in &lines {
        if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            if let Some((pt, entry)) = parse_rtpmap_line(rest) {
                rtpmap.insert(pt, entry);
            }
        } else if let Some(rest) = line.strip_prefix("a=fmtp:") {
            if let Some((pt, rate)) = parse_fmtp_sprop_maxcapturerate(rest) {
                sprop_maxcapturerate.insert(pt, rate);
            }
        }
    }

    Ok(RemoteMedia { connection_ip, port, payload_types, rtpmap, sprop_maxcapturerate })
}

fn parse_connection_line(line: &str) -> Result<IpAddr> {
    // c=IN IP4 203.0.113.9
    let parts: Vec<&str> = line.split_whitespace().collect();
    parts
        .get(2)
        .and_then(|addr| addr.parse::<IpAddr>().ok())
        .ok_or_else(|| SdpError::MalformedConnectionLine(line.to_string()))
}

fn parse_media_line(line: &str) -> Result<(u16, Vec<u8>)> {
    // m=audio 40000 RTP/AVP 0 8 101
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return Err(SdpError::MalformedMediaLine(line.to_string()));
    }
    let port = parts[1].parse::<u16>().map_err(|_| SdpError::InvalidPort(line.to_string()))?;
    let payload_types = parts[3..].iter().filter_map(|p| p.parse::<u8>().ok()).collect();
    Ok((port, payload_types))
}

/// `"<pt> sprop-maxcapturerate=<rate>;other=params"` -> `(pt, rate)`.
fn parse_fmtp_sprop_maxcapturerate(rest: &str) -> Option<(u8, u32)> {
    let mut it = rest.splitn(2, ' ');
    let pt = it.next()?.parse::<u8>().ok()?;
    let params = it.next()?;
    let value = params
        .split(';')
        .find_map(|param| param.trim().strip_prefix("sprop-maxcapturerate="))?;
    Some((pt, value.parse().ok()?))
}

fn parse_rtpmap_line(rest: &str) -> Option<(u8, RtpMapEntry)> {
    // "<pt> <encoding>/<clock>[/<channels>]"
    let mut it = rest.splitn(2, ' ');
    let pt = it.next()?.parse::<u8>().ok()?;
    let encoding = it.next()?;
    let mut enc_parts = encoding.splitn(3, '/');
    let encoding_name = enc_parts.next()?.to_string();
    let clock_rate = enc_parts.next()?.parse::<u32>().ok()?;
    Some((pt, RtpMapEntry { encoding_name, clock_rate }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 123 456 IN IP4 203.0.113.9\r\n\
s=-\r\n\
c=IN IP4 203.0.113.9\r\n\
t=0 0\r\n\
m=audio 40000 RTP/AVP 0 8 96\r\n\
a=rtcp:40001\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:96 opus/48000/2\r\n";

    #[test]
    fn parses_connection_and_media_lines() {
        let media = parse_media(OFFER).unwrap();
        assert_eq!(media.connection_ip.to_string(), "203.0.113.9");
        assert_eq!(media.port, 40000);
        assert_eq!(media.payload_types, vec![0, 8, 96]);
    }

    #[test]
    fn parses_rtpmap_entries() {
        let media = parse_media(OFFER).unwrap();
        assert_eq!(media.rtpmap.get(&96).unwrap().encoding_name, "opus");
        assert_eq!(media.rtpmap.get(&96).unwrap().clock_rate, 48_000);
    }

    #[test]
    fn missing_media_line_errors() {
        let body = "v=0\r\nc=IN IP4 203.0.113.9\r\n";
        assert!(matches!(parse_media(body), Err(SdpError::MissingMediaLine)));
    }

    #[test]
    fn parses_sprop_maxcapturerate_from_fmtp() {
        let body = "v=0\r\n\
c=IN IP4 203.0.113.9\r\n\
m=audio 40000 RTP/AVP 96\r\n\
a=rtpmap:96 opus/48000/2\r\n\
a=fmtp:96 sprop-maxcapturerate=16000;stereo=0\r\n";
        let media = parse_media(body).unwrap();
        assert_eq!(media.sprop_maxcapturerate.get(&96), Some(&16000));
    }
}
