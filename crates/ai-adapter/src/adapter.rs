//! The uniform contract every provider flavor implements, grounded on
//! `ai.py`'s `AIEngine` abstract base: a codec priority list plus
//! start/send/close, generalized into an async trait with an event channel
//! so the call engine never needs to know which flavor it is driving.

use async_trait::async_trait;
use bytes::Bytes;

use voicebridge_codec_core::CodecKind;

use crate::error::Result;
use crate::state::AdapterState;
use crate::tool::ToolEffect;

/// Emitted by a running adapter toward the call engine.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// Synthesized audio ready to frame and send over RTP.
    AudioOut(Bytes),
    /// A tool call resolved to a lifecycle effect (terminate/transfer).
    ToolEffect(ToolEffect),
    /// A transcript fragment, for logging.
    Transcript { text: String, is_final: bool },
    /// The provider indicated the caller started talking over it; the call
    /// engine should drain the outbound RTP queue.
    BargeIn,
    /// The provider finished a turn of audio; any partial codec frame still
    /// buffered should be flushed with silence padding.
    AudioFlush,
    /// A recoverable error worth logging but not fatal to the call.
    Warning(String),
    /// The provider connection ended; the call should wind down.
    Closed,
}

/// Uniform contract for an AI provider adapter. One instance per call leg.
#[async_trait]
pub trait AiAdapter: Send {
    /// Codec names this provider accepts, most preferred first, used to
    /// resolve against the SDP offer's candidate list.
    fn codec_priority(&self) -> Vec<CodecKind>;

    fn state(&self) -> AdapterState;

    /// Open the provider connection and perform the flavor's setup
    /// handshake (session config, tool manifest, optional welcome message).
    /// Events are pushed to `events` for the lifetime of the adapter.
    async fn start(&mut self, events: tokio::sync::mpsc::Sender<AdapterEvent>) -> Result<()>;

    /// Forward a chunk of caller audio (already in the negotiated codec) to
    /// the provider.
    async fn send_audio(&mut self, payload: Bytes) -> Result<()>;

    /// The caller barged in over the provider's speech; stop any in-flight
    /// response production if the flavor can (OpenAI's realtime API,
    /// DeepGram's TTS stream), generalized from `drain_queue` plus the
    /// `conversation.item.created` handling in `openai_api.py`.
    async fn barge_in(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}
