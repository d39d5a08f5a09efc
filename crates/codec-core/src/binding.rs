//! Per-call codec binding: the concrete payload type, clock rate and framing
//! state negotiated for one leg, plus the uniform `parse`/`silence` surface
//! the RTP sender drives regardless of which codec won negotiation.

use bytes::Bytes;

use crate::error::{CodecError, Result};
use crate::g711::{self, ALAW_SILENCE_BYTE, MULAW_SILENCE_BYTE};
use crate::ogg::OggPageParser;

/// The codec family selected for a call leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    Mulaw,
    Alaw,
    Opus,
}

impl CodecKind {
    pub fn name(self) -> &'static str {
        match self {
            CodecKind::Mulaw => "pcmu",
            CodecKind::Alaw => "pcma",
            CodecKind::Opus => "opus",
        }
    }

    /// RTP static payload type, where one exists (Opus is dynamic and is
    /// carried separately by the SDP negotiation result).
    pub fn static_payload_type(self) -> Option<u8> {
        match self {
            CodecKind::Mulaw => Some(0),
            CodecKind::Alaw => Some(8),
            CodecKind::Opus => None,
        }
    }

    pub fn clock_rate(self) -> u32 {
        match self {
            CodecKind::Mulaw | CodecKind::Alaw => 8_000,
            CodecKind::Opus => 48_000,
        }
    }

    /// Resolve the first codec in `priority` that also appears in
    /// `candidates`, matching `AIEngine.choose_codec`'s ordered-priority scan.
    pub fn choose(candidates: &[CodecKind], priority: &[CodecKind]) -> Result<CodecKind> {
        priority
            .iter()
            .copied()
            .find(|p| candidates.contains(p))
            .ok_or_else(|| CodecError::UnsupportedCodec {
                candidates: candidates.iter().map(|c| c.name().to_string()).collect(),
                priority: priority.iter().map(|c| c.name().to_string()).collect(),
            })
    }
}

/// Negotiated framing parameters for one call leg.
///
/// `sample_rate` defaults to `kind.clock_rate()` but can be overridden for
/// Opus when the offer advertises `sprop-maxcapturerate` (spec 4.1): the RTP
/// clock for Opus is conventionally 48 kHz regardless, but the actual
/// capture rate drives how many samples one `ptime` worth of audio is, which
/// is what `ts_increment` needs to track.
#[derive(Debug, Clone, Copy)]
pub struct CodecBinding {
    pub kind: CodecKind,
    pub ptime_ms: u32,
    pub sample_rate: u32,
}

impl CodecBinding {
    pub fn new(kind: CodecKind, ptime_ms: u32) -> Self {
        Self { kind, ptime_ms, sample_rate: kind.clock_rate() }
    }

    pub fn with_sample_rate(kind: CodecKind, ptime_ms: u32, sample_rate: u32) -> Self {
        Self { kind, ptime_ms, sample_rate }
    }

    /// Bytes per RTP payload at the negotiated ptime (G.711 only; Opus
    /// packets carry their own natural boundaries from the Ogg container).
    pub fn g711_payload_size(&self) -> usize {
        (self.sample_rate as usize * self.ptime_ms as usize) / 1000
    }

    /// RTP timestamp advance per packet sent.
    pub fn ts_increment(&self) -> u32 {
        self.sample_rate / (1000 / self.ptime_ms)
    }

    pub fn silence_byte(&self) -> u8 {
        match self.kind {
            CodecKind::Mulaw => MULAW_SILENCE_BYTE,
            CodecKind::Alaw => ALAW_SILENCE_BYTE,
            CodecKind::Opus => 0,
        }
    }

    /// A single silence packet, ready to send as-is.
    pub fn silence_packet(&self) -> Bytes {
        match self.kind {
            CodecKind::Mulaw | CodecKind::Alaw => {
                Bytes::from(vec![self.silence_byte(); self.g711_payload_size()])
            }
            // DTX comfort-noise frame (matches `codec.py`'s Opus.get_silence).
            CodecKind::Opus => Bytes::from_static(&[0xF8, 0xFF, 0xFE]),
        }
    }

    pub fn new_frame_state(&self) -> FrameState {
        match self.kind {
            CodecKind::Mulaw | CodecKind::Alaw => FrameState::G711(Vec::new()),
            CodecKind::Opus => FrameState::Opus(OggPageParser::new()),
        }
    }
}

/// Mutable per-call framing state threaded through successive `parse` calls.
#[derive(Debug, Clone)]
pub enum FrameState {
    G711(Vec<u8>),
    Opus(OggPageParser),
}

impl CodecBinding {
    /// Feed a chunk of provider audio bytes through the framing state,
    /// emitting zero or more ready-to-send RTP payloads. `data = None` flushes
    /// any G.711 remainder with silence padding; it is a no-op for Opus since
    /// an Ogg stream has no implicit terminal frame.
    pub fn parse(&self, state: &mut FrameState, data: Option<&[u8]>) -> Vec<Bytes> {
        match (state, self.kind) {
            (FrameState::G711(leftover), CodecKind::Mulaw | CodecKind::Alaw) => {
                let (packets, new_leftover) = g711::parse(
                    self.g711_payload_size(),
                    self.silence_byte(),
                    data,
                    std::mem::take(leftover),
                );
                *leftover = new_leftover;
                packets
            }
            (FrameState::Opus(parser), CodecKind::Opus) => match data {
                Some(bytes) => parser.push(bytes),
                None => Vec::new(),
            },
            _ => unreachable!("FrameState must match the binding's CodecKind"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choose_picks_first_priority_match() {
        let candidates = [CodecKind::Alaw, CodecKind::Mulaw];
        let priority = [CodecKind::Mulaw, CodecKind::Alaw];
        assert_eq!(CodecKind::choose(&candidates, &priority).unwrap(), CodecKind::Mulaw);
    }

    #[test]
    fn choose_errors_when_disjoint() {
        let candidates = [CodecKind::Opus];
        let priority = [CodecKind::Mulaw, CodecKind::Alaw];
        assert!(CodecKind::choose(&candidates, &priority).is_err());
    }

    #[test]
    fn g711_binding_round_trips_through_frame_state() {
        let binding = CodecBinding::new(CodecKind::Mulaw, 20);
        let mut state = binding.new_frame_state();
        let packets = binding.parse(&mut state, Some(&[1u8; 500]));
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].len(), 160);

        let flushed = binding.parse(&mut state, None);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].len(), 160);
    }

    #[test]
    fn opus_binding_delegates_to_ogg_parser() {
        let binding = CodecBinding::new(CodecKind::Opus, 20);
        let mut state = binding.new_frame_state();
        assert!(binding.parse(&mut state, Some(&[0u8; 3])).is_empty());
    }
}
