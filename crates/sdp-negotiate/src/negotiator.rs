//! Offer/answer negotiation built on top of the raw-text parser: picks a
//! codec from the caller's priority list and generates the matching SDP
//! body. Grounded on `MediaConfigConverter::generate_sdp_answer`.

use std::net::IpAddr;

use voicebridge_codec_core::CodecKind;

use crate::error::Result;
use crate::parse::{parse_media, RemoteMedia};

/// Dynamic payload type used for Opus in offers/answers we generate.
pub const OPUS_DYNAMIC_PT: u8 = 111;

fn payload_type_for(kind: CodecKind) -> u8 {
    kind.static_payload_type().unwrap_or(OPUS_DYNAMIC_PT)
}

fn rtpmap_name(kind: CodecKind) -> &'static str {
    match kind {
        CodecKind::Mulaw => "PCMU",
        CodecKind::Alaw => "PCMA",
        CodecKind::Opus => "opus",
    }
}

/// Decide which codec an offer's payload types support, in priority order.
fn offered_codecs(media: &RemoteMedia) -> Vec<CodecKind> {
    media
        .payload_types
        .iter()
        .filter_map(|pt| match pt {
            0 => Some(CodecKind::Mulaw),
            8 => Some(CodecKind::Alaw),
            pt => media.rtpmap.get(pt).and_then(|entry| {
                (entry.encoding_name.eq_ignore_ascii_case("opus")).then_some(CodecKind::Opus)
            }),
        })
        .collect()
}

/// Result of a successful negotiation: where to send RTP and with what
/// codec, alongside the SDP body to hand back to the signaling layer.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub codec: CodecKind,
    pub body: String,
}

/// Parse a remote offer and build the matching answer, selecting the first
/// codec in `priority` the offer also advertises.
pub fn negotiate_answer(
    offer_body: &str,
    local_ip: IpAddr,
    local_port: u16,
    priority: &[CodecKind],
) -> Result<Negotiated> {
    let media = parse_media(offer_body)?;
    let candidates = offered_codecs(&media);
    let codec = CodecKind::choose(&candidates, priority)?;

    let body = generate_answer_body(local_ip, local_port, codec);
    Ok(Negotiated { remote_ip: media.connection_ip, remote_port: media.port, codec, body })
}

/// Parse a remote answer to a locally-generated offer.
pub fn parse_remote_answer(answer_body: &str, expected: &[CodecKind]) -> Result<Negotiated> {
    let media = parse_media(answer_body)?;
    let candidates = offered_codecs(&media);
    let codec = CodecKind::choose(&candidates, expected)?;
    Ok(Negotiated {
        remote_ip: media.connection_ip,
        remote_port: media.port,
        codec,
        body: String::new(),
    })
}

/// Build an SDP offer advertising `codecs` in the given priority order.
pub fn generate_offer(local_ip: IpAddr, local_port: u16, codecs: &[CodecKind]) -> String {
    let payload_types: Vec<String> =
        codecs.iter().map(|c| payload_type_for(*c).to_string()).collect();

    let mut body = String::new();
    body.push_str("v=0\r\n");
    body.push_str(&format!("o=- 0 0 IN IP4 {local_ip}\r\n"));
    body.push_str("s=voicebridge\r\n");
    body.push_str(&format!("c=IN IP4 {local_ip}\r\n"));
    body.push_str("t=0 0\r\n");
    body.push_str(&format!("m=audio {local_port} RTP/AVP {}\r\n", payload_types.join(" ")));
    for codec in codecs {
        let clock = codec.clock_rate();
        body.push_str(&format!(
            "a=rtpmap:{} {}/{}\r\n",
            payload_type_for(*codec),
            rtpmap_name(*codec),
            clock
        ));
    }
    body.push_str("a=sendrecv\r\n");
    body
}

fn generate_answer_body(local_ip: IpAddr, local_port: u16, codec: CodecKind) -> String {
    let pt = payload_type_for(codec);
    let mut body = String::new();
    body.push_str("v=0\r\n");
    body.push_str(&format!("o=- 0 0 IN IP4 {local_ip}\r\n"));
    body.push_str("s=voicebridge\r\n");
    body.push_str(&format!("c=IN IP4 {local_ip}\r\n"));
    body.push_str("t=0 0\r\n");
    body.push_str(&format!("m=audio {local_port} RTP/AVP {pt}\r\n"));
    body.push_str(&format!("a=rtpmap:{} {}/{}\r\n", pt, rtpmap_name(codec), codec.clock_rate()));
    body.push_str("a=sendrecv\r\n");
    body
}

/// Rewrite the trailing direction attribute to reflect the call's current
/// pause state, per spec 4.4/4.6: a pause flips the answer to `recvonly` so
/// the next in-dialog reply tells the caller side to stop sending media this
/// engine would otherwise ignore; resume flips it back to `sendrecv`. The
/// chosen codec's rtpmap/fmt lines are left untouched - direction is the only
/// thing a pause/resume re-INVITE changes in the answer.
pub fn set_direction(body: &str, paused: bool) -> String {
    let direction = if paused { "a=recvonly" } else { "a=sendrecv" };
    let mut out: Vec<&str> = body
        .lines()
        .filter(|l| *l != "a=sendrecv" && *l != "a=recvonly" && *l != "a=inactive")
        .collect();
    out.push(direction);
    let mut joined = out.join("\r\n");
    joined.push_str("\r\n");
    joined
}

/// Read the direction attribute off a remote offer/answer, defaulting to
/// `sendrecv` when absent (per spec 4.6: "if direction is absent ... resume").
pub fn remote_direction_is_paused(body: &str) -> bool {
    body.lines().any(|l| l == "a=recvonly" || l == "a=inactive")
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 1 1 IN IP4 198.51.100.5\r\n\
s=-\r\n\
c=IN IP4 198.51.100.5\r\n\
t=0 0\r\n\
m=audio 12000 RTP/AVP 0 8\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n";

    #[test]
    fn negotiates_first_priority_match() {
        let local_ip: IpAddr = "192.0.2.1".parse().unwrap();
        let negotiated =
            negotiate_answer(OFFER, local_ip, 30000, &[CodecKind::Alaw, CodecKind::Mulaw])
                .unwrap();
        assert_eq!(negotiated.codec, CodecKind::Alaw);
        assert_eq!(negotiated.remote_port, 12000);
        assert!(negotiated.body.contains("m=audio 30000 RTP/AVP 8"));
        assert!(negotiated.body.contains("a=rtpmap:8 PCMA/8000"));
    }

    #[test]
    fn errors_when_no_codec_overlaps() {
        let local_ip: IpAddr = "192.0.2.1".parse().unwrap();
        let result = negotiate_answer(OFFER, local_ip, 30000, &[CodecKind::Opus]);
        assert!(result.is_err());
    }

    #[test]
    fn set_direction_toggles_recvonly_and_back() {
        let local_ip: IpAddr = "192.0.2.1".parse().unwrap();
        let answer = generate_answer_body(local_ip, 30000, CodecKind::Mulaw);
        assert!(answer.contains("a=sendrecv"));

        let paused = set_direction(&answer, true);
        assert!(paused.contains("a=recvonly"));
        assert!(!paused.contains("a=sendrecv"));

        let resumed = set_direction(&paused, false);
        assert!(resumed.contains("a=sendrecv"));
        assert!(!resumed.contains("a=recvonly"));
    }

    #[test]
    fn remote_direction_defaults_to_not_paused() {
        assert!(!remote_direction_is_paused("v=0\r\nm=audio 1 RTP/AVP 0\r\n"));
        assert!(remote_direction_is_paused("v=0\r\na=recvonly\r\n"));
    }

    #[test]
    fn generated_offer_round_trips_through_answer_parser() {
        let local_ip: IpAddr = "192.0.2.1".parse().unwrap();
        let offer = generate_offer(local_ip, 30000, &[CodecKind::Mulaw, CodecKind::Opus]);
        let media = parse_media(&offer).unwrap();
        assert_eq!(media.payload_types, vec![0, OPUS_DYNAMIC_PT]);
    }
}
