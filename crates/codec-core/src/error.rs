use thiserror::Error;

/// Errors surfaced while framing or deframing a codec payload stream.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no codec in {candidates:?} intersects provider priority list {priority:?}")]
    UnsupportedCodec {
        candidates: Vec<String>,
        priority: Vec<String>,
    },

    #[error("malformed Ogg page: {0}")]
    MalformedOgg(&'static str),
}

pub type Result<T> = std::result::Result<T, CodecError>;
