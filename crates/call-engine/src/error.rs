use thiserror::Error;

/// Mirrors the exception -> SIP status mapping in `engine.py`'s `handle_call`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("unknown SIP user {0:?}")]
    UnknownSipUser(String),

    #[error("management channel error: {0}")]
    ManagementChannel(String),

    #[error("no bot flavor resolved for call {0}")]
    FlavorResolutionFailed(String),

    #[error(transparent)]
    Sdp(#[from] voicebridge_sdp::SdpError),

    #[error(transparent)]
    Rtp(#[from] voicebridge_rtp::RtpError),

    #[error(transparent)]
    Adapter(#[from] voicebridge_ai_adapter::AdapterError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// SIP status code this error should be reported back as, per
    /// `engine.py`'s `handle_call` exception mapping.
    pub fn sip_status(&self) -> u16 {
        match self {
            EngineError::UnsupportedCodec(_) => 488,
            EngineError::Sdp(voicebridge_sdp::SdpError::UnsupportedCodec(_)) => 488,
            EngineError::UnknownSipUser(_) => 404,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use voicebridge_codec_core::CodecError;
    use voicebridge_sdp::SdpError;

    #[test]
    fn codec_mismatch_reaching_through_sdp_maps_to_488() {
        let codec_err = CodecError::UnsupportedCodec { candidates: vec!["g722".to_string()], priority: vec!["opus".to_string()] };
        let err = EngineError::from(SdpError::UnsupportedCodec(codec_err));
        assert_eq!(err.sip_status(), 488);
    }
}
