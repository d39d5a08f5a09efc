//! G.711 payload framing (mu-law / A-law).
//!
//! This is framing only, not companding: the caller's audio already arrives
//! in the wire format the provider streams back (see `codec.py`'s
//! `G711.process_response` in the original implementation, which never
//! touches sample values, only chunk boundaries).

use bytes::Bytes;

/// mu-law silence fill byte (ITU-T G.711, the all-ones PCM code).
pub const MULAW_SILENCE_BYTE: u8 = 0xFF;
/// A-law silence fill byte.
pub const ALAW_SILENCE_BYTE: u8 = 0xD5;

/// Deframes a byte stream into fixed-size RTP payloads.
///
/// `data = None` signals a terminal flush: any remainder is padded with
/// `silence_byte` out to `payload_size` and emitted as one final packet.
/// Returns the emitted packets and the new leftover buffer.
pub fn parse(
    payload_size: usize,
    silence_byte: u8,
    data: Option<&[u8]>,
    mut leftover: Vec<u8>,
) -> (Vec<Bytes>, Vec<u8>) {
    let mut packets = Vec::new();

    match data {
        Some(bytes) => {
            leftover.extend_from_slice(bytes);
            while leftover.len() >= payload_size {
                let chunk: Vec<u8> = leftover.drain(..payload_size).collect();
                packets.push(Bytes::from(chunk));
            }
            (packets, leftover)
        }
        None => {
            if !leftover.is_empty() {
                let mut chunk = leftover;
                chunk.resize(payload_size, silence_byte);
                packets.push(Bytes::from(chunk));
            }
            (packets, Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_full_chunks_and_keeps_remainder() {
        let (packets, leftover) = parse(160, MULAW_SILENCE_BYTE, Some(&[7u8; 350]), Vec::new());
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].len(), 160);
        assert_eq!(leftover.len(), 30);
    }

    #[test]
    fn terminal_flush_pads_with_silence() {
        let (_, leftover) = parse(160, MULAW_SILENCE_BYTE, Some(&[1u8; 100]), Vec::new());
        assert_eq!(leftover.len(), 100);

        let (packets, leftover) = parse(160, MULAW_SILENCE_BYTE, None, leftover);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 160);
        assert!(packets[0][100..].iter().all(|&b| b == MULAW_SILENCE_BYTE));
        assert!(leftover.is_empty());
    }

    #[test]
    fn flush_with_nothing_buffered_emits_nothing() {
        let (packets, leftover) = parse(160, MULAW_SILENCE_BYTE, None, Vec::new());
        assert!(packets.is_empty());
        assert!(leftover.is_empty());
    }

    /// Property 1: splitting the same input across incremental calls must
    /// equal parsing it in one call, total length rounds up to a multiple
    /// of `payload_size`, and silence padding only ever appears at the end.
    #[test]
    fn incremental_split_matches_single_call() {
        let payload_size = 160;
        let data: Vec<u8> = (0..733u32).map(|i| (i % 251) as u8).collect();

        let (single_packets, single_left) =
            parse(payload_size, MULAW_SILENCE_BYTE, Some(&data), Vec::new());

        let mut leftover = Vec::new();
        let mut split_packets = Vec::new();
        for chunk in data.chunks(37) {
            let (p, l) = parse(payload_size, MULAW_SILENCE_BYTE, Some(chunk), leftover);
            split_packets.extend(p);
            leftover = l;
        }

        assert_eq!(single_packets, split_packets);
        assert_eq!(single_left, leftover);

        let (final_packets, final_left) = parse(payload_size, MULAW_SILENCE_BYTE, None, leftover);
        assert!(final_left.is_empty());
        let total_len: usize = split_packets.iter().map(|p| p.len()).sum::<usize>()
            + final_packets.iter().map(|p| p.len()).sum::<usize>();
        assert_eq!(total_len, data.len().div_ceil(payload_size) * payload_size);
    }
}
