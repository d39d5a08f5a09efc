use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no codec in {candidates:?} intersects provider priority list {priority:?}")]
    UnsupportedCodec { candidates: Vec<String>, priority: Vec<String> },

    #[error("provider websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("provider http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed provider message: {0}")]
    Protocol(String),

    #[error("adapter is in state {state:?}, which does not accept {action}")]
    InvalidState { state: crate::state::AdapterState, action: &'static str },

    #[error("missing required configuration key {0:?}")]
    MissingConfig(&'static str),

    #[error(transparent)]
    Codec(#[from] voicebridge_codec_core::CodecError),
}

pub type Result<T> = std::result::Result<T, AdapterError>;
