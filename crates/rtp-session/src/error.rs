use thiserror::Error;

#[derive(Debug, Error)]
pub enum RtpError {
    #[error("no free port in range {base}-{max}")]
    PortsExhausted { base: u16, max: u16 },

    #[error("packet too short for an RTP header: {0} bytes")]
    PacketTooShort(usize),

    #[error("unsupported RTP version {0}")]
    UnsupportedVersion(u8),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RtpError>;
