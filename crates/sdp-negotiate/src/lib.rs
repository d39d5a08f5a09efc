//! Raw-text SDP offer/answer negotiation for a single audio call leg.

pub mod error;
pub mod negotiator;
pub mod parse;

pub use error::{Result, SdpError};
pub use negotiator::{
    generate_offer, negotiate_answer, parse_remote_answer, remote_direction_is_paused,
    set_direction, Negotiated,
};
pub use parse::{parse_media, RemoteMedia, RtpMapEntry};
