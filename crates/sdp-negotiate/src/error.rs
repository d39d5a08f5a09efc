use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdpError {
    #[error("SDP body has no m=audio line")]
    MissingMediaLine,

    #[error("SDP body has no c= connection line")]
    MissingConnectionLine,

    #[error("malformed c= line: {0:?}")]
    MalformedConnectionLine(String),

    #[error("malformed m=audio line: {0:?}")]
    MalformedMediaLine(String),

    #[error("could not parse port from m=audio line: {0:?}")]
    InvalidPort(String),

    #[error(transparent)]
    UnsupportedCodec(#[from] voicebridge_codec_core::CodecError),
}

pub type Result<T> = std::result::Result<T, SdpError>;
