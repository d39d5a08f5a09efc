//! Codec framing shared by every call leg: G.711 payload chunking and
//! Ogg/Opus page parsing, plus the `CodecBinding` that picks between them.

pub mod binding;
pub mod error;
pub mod g711;
pub mod ogg;

pub use binding::{CodecBinding, CodecKind, FrameState};
pub use error::{CodecError, Result};
