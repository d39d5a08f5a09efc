//! Ogg page parsing for the Opus transport.
//!
//! Providers that synthesize Opus stream it inside an Ogg container. We only
//! need the packets, not the container semantics: locate each page at its
//! `OggS` capture pattern, read the segment table, and hand back every
//! segment except the two setup packets (`OpusHead`, `OpusTags`) as one Opus
//! packet each. Grounded on `codec.py`'s `Opus.parse_page`, reworked into an
//! incremental parser driven purely by total page length (computed from the
//! segment table) instead of "wait for the next capture pattern" - this is
//! what makes parsing independent of how the caller chunks the byte stream.

use bytes::Bytes;

const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
const FIXED_HEADER_LEN: usize = 27;

/// Incremental Ogg page parser. Owns the byte accumulator across calls so
/// arbitrary chunking of the underlying stream yields identical packets.
#[derive(Debug, Default, Clone)]
pub struct OggPageParser {
    buf: Vec<u8>,
}

impl OggPageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more bytes from the provider's stream, draining every complete
    /// page found so far into Opus packets (OpusHead/OpusTags are dropped).
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        self.drain_complete_pages()
    }

    /// Bytes currently buffered (an incomplete trailing page, or garbage
    /// preceding the first capture pattern).
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    fn drain_complete_pages(&mut self) -> Vec<Bytes> {
        let mut packets = Vec::new();

        loop {
            // Discard anything before the first capture pattern.
            match find(&self.buf, CAPTURE_PATTERN) {
                Some(0) => {}
                Some(pos) => {
                    self.buf.drain(..pos);
                }
                None => {
                    // No capture pattern at all: keep at most 3 trailing
                    // bytes (a partial "OggS" could start there), drop rest.
                    let keep = self.buf.len().min(CAPTURE_PATTERN.len() - 1);
                    let drop_to = self.buf.len() - keep;
                    self.buf.drain(..drop_to);
                    break;
                }
            }

            if self.buf.len() < FIXED_HEADER_LEN {
                break;
            }

            let page_segments = self.buf[26] as usize;
            let table_end = FIXED_HEADER_LEN + page_segments;
            if self.buf.len() < table_end {
                break;
            }

            let segment_lens: Vec<usize> =
                self.buf[FIXED_HEADER_LEN..table_end].iter().map(|&b| b as usize).collect();
            let payload_len: usize = segment_lens.iter().sum();
            let page_len = table_end + payload_len;
            if self.buf.len() < page_len {
                break;
            }

            let page: Vec<u8> = self.buf.drain(..page_len).collect();
            packets.extend(Self::segments(&page, table_end, &segment_lens));
        }

        packets
    }

    fn segments(page: &[u8], table_end: usize, segment_lens: &[usize]) -> Vec<Bytes> {
        let mut out = Vec::new();
        let mut offset = table_end;
        for (idx, &len) in segment_lens.iter().enumerate() {
            let segment = &page[offset..offset + len];
            offset += len;

            if idx == 0 && (segment.starts_with(b"OpusHead") || segment.starts_with(b"OpusTags")) {
                continue;
            }
            if len == 0 {
                continue;
            }
            out.push(Bytes::copy_from_slice(segment));
        }
        out
    }
}

fn find(haystack: &[u8], needle: &[u8; 4]) -> Option<usize> {
    haystack.windows(4).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_page(segments: &[&[u8]]) -> Vec<u8> {
        let mut page = Vec::new();
        page.extend_from_slice(CAPTURE_PATTERN);
        page.push(0); // version
        page.push(0); // header type
        page.extend_from_slice(&[0u8; 8]); // granule position
        page.extend_from_slice(&[1, 0, 0, 0]); // serial number
        page.extend_from_slice(&[0, 0, 0, 0]); // page sequence
        page.extend_from_slice(&[0, 0, 0, 0]); // checksum
        page.push(segments.len() as u8);
        for s in segments {
            page.push(s.len() as u8);
        }
        for s in segments {
            page.extend_from_slice(s);
        }
        page
    }

    #[test]
    fn skips_opus_head_and_tags() {
        let mut parser = OggPageParser::new();
        let page1 = build_page(&[b"OpusHead....."]);
        let page2 = build_page(&[b"OpusTags....."]);
        let page3 = build_page(&[&[1, 2, 3], &[4, 5]]);

        let mut all = Vec::new();
        all.extend(parser.push(&page1));
        all.extend(parser.push(&page2));
        all.extend(parser.push(&page3));

        assert_eq!(all, vec![Bytes::from_static(&[1, 2, 3]), Bytes::from_static(&[4, 5])]);
    }

    #[test]
    fn discards_bytes_before_first_capture_pattern() {
        let mut parser = OggPageParser::new();
        let mut stream = vec![0xAAu8; 13];
        stream.extend_from_slice(&build_page(&[&[9, 9]]));

        let packets = parser.push(&stream);
        assert_eq!(packets, vec![Bytes::from_static(&[9, 9])]);
    }

    /// Property 2: frame-agnostic - splitting the same Ogg stream
    /// differently must yield the same sequence of Opus packets.
    #[test]
    fn parse_is_independent_of_chunking() {
        let mut stream = build_page(&[b"OpusHead........"]);
        stream.extend(build_page(&[b"OpusTags........"]));
        stream.extend(build_page(&[&[1, 2, 3, 4], &[5, 6]]));
        stream.extend(build_page(&[&[7u8; 20]]));

        let mut whole = OggPageParser::new();
        let all_at_once = whole.push(&stream);

        for chunk_size in [1usize, 2, 5, 17, 64] {
            let mut parser = OggPageParser::new();
            let mut chunked = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                chunked.extend(parser.push(chunk));
            }
            assert_eq!(chunked, all_at_once, "mismatch at chunk_size={chunk_size}");
        }
    }
}
