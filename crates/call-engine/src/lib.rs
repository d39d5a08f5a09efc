//! Call lifecycle, dispatcher and configuration for the SIP-to-AI voice
//! bridge engine; `main.rs` wires these into the `voicebridge-engine` binary.

pub mod botconfig;
pub mod call;
pub mod call_log;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod headers;
pub mod mgmt;

pub use call::{Call, CallOptions};
pub use config::AppConfig;
pub use dispatcher::Dispatcher;
pub use error::{EngineError, Result};
pub use mgmt::ManagementChannel;
