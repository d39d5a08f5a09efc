//! Azure OpenAI realtime adapter. Azure's realtime endpoint speaks the same
//! `session.update`/`response.*` protocol as OpenAI's, differing only in how
//! the connection authenticates (an `api-key` header instead of a bearer
//! token) and how the URL is built (deployment name and api-version query
//! parameters baked in by the caller). Everything past the handshake is
//! identical to [`crate::flavor::openai::OpenAiAdapter`], so this flavor
//! reuses that adapter's event handling and only swaps the connect step.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use voicebridge_codec_core::CodecKind;

use crate::adapter::{AdapterEvent, AiAdapter};
use crate::config::AdapterConfig;
use crate::error::Result;
use crate::flavor::openai::{AuthHeader, OpenAiAdapter};
use crate::state::AdapterState;

pub struct AzureAdapter {
    inner: OpenAiAdapter,
}

impl AzureAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self { inner: OpenAiAdapter::new(config) }
    }
}

#[async_trait]
impl AiAdapter for AzureAdapter {
    fn codec_priority(&self) -> Vec<CodecKind> {
        self.inner.codec_priority()
    }

    fn state(&self) -> AdapterState {
        self.inner.state()
    }

    async fn start(&mut self, events: mpsc::Sender<AdapterEvent>) -> Result<()> {
        self.inner.start_with_auth(events, AuthHeader::ApiKey).await
    }

    async fn send_audio(&mut self, payload: Bytes) -> Result<()> {
        self.inner.send_audio(payload).await
    }

    async fn barge_in(&mut self) -> Result<()> {
        self.inner.barge_in().await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}
