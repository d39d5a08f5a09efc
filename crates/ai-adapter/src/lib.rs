//! Uniform AI provider adapter contract, lifecycle state machine, tool
//! dispatch, and the concrete provider flavors (OpenAI realtime, Deepgram
//! split STT+TTS, Deepgram native voice agent, Azure OpenAI realtime).

pub mod adapter;
pub mod config;
pub mod error;
pub mod flavor;
pub mod llm;
pub mod state;
pub mod tool;

pub use adapter::{AdapterEvent, AiAdapter};
pub use config::{AdapterConfig, HttpToolConfig, TurnDetectionConfig};
pub use error::{AdapterError, Result};
pub use state::AdapterState;
