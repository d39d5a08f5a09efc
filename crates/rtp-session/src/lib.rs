//! RTP transport: header codec, bounded port allocation and the paced,
//! symmetric-RTP-learning session used by each call leg.

pub mod error;
pub mod header;
pub mod port_allocator;
pub mod session;

pub use error::{Result, RtpError};
pub use header::{RtpHeader, RtpPacket, HEADER_LEN};
pub use port_allocator::PortAllocator;
pub use session::RtpSession;
