//! Deepgram split STT+TTS adapter, grounded on `deepgram_api.py`'s
//! `Deepgram(AIEngine)`: a Deepgram listen-websocket for transcription, an
//! LLM completion per finished sentence, and an HTTP text-to-speech call
//! whose audio is framed and handed back as one burst. `speech_lock`
//! serializes overlapping TTS bursts so two replies in flight never
//! interleave their audio on the wire.

use std::sync::{Arc, Mutex as SyncMutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::warn;

use voicebridge_codec_core::CodecKind;

use crate::adapter::{AdapterEvent, AiAdapter};
use crate::config::AdapterConfig;
use crate::error::{AdapterError, Result};
use crate::llm::{ChatMessage, Conversation, ConversationStore, LlmClient};
use crate::state::{AdapterState, StateCell};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

const SENTENCE_TERMINATORS: [char; 3] = ['.', '?', '!'];

pub struct DeepgramSplitAdapter {
    config: AdapterConfig,
    session_key: String,
    llm: LlmClient,
    conversations: ConversationStore,
    state: Arc<SyncMutex<StateCell>>,
    speech_lock: Arc<Mutex<()>>,
    write: Option<Arc<Mutex<WsWriter>>>,
    read_task: Option<JoinHandle<()>>,
}

impl DeepgramSplitAdapter {
    pub fn new(
        config: AdapterConfig,
        session_key: String,
        llm: LlmClient,
        conversations: ConversationStore,
    ) -> Self {
        Self {
            config,
            session_key,
            llm,
            conversations,
            state: Arc::new(SyncMutex::new(StateCell::new())),
            speech_lock: Arc::new(Mutex::new(())),
            write: None,
            read_task: None,
        }
    }
}

#[async_trait]
impl AiAdapter for DeepgramSplitAdapter {
    fn codec_priority(&self) -> Vec<CodecKind> {
        vec![CodecKind::Opus, CodecKind::Alaw, CodecKind::Mulaw]
    }

    fn state(&self) -> AdapterState {
        self.state.lock().unwrap().get()
    }

    async fn start(&mut self, events: mpsc::Sender<AdapterEvent>) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .transition(AdapterState::Connecting)
            .map_err(|s| AdapterError::InvalidState { state: s, action: "start" })?;

        let mut request = "wss://api.deepgram.com/v1/listen?encoding=mulaw&sample_rate=8000"
            .into_client_request()?;
        let auth_value = format!("Token {}", self.config.api_key)
            .parse()
            .map_err(|_| AdapterError::Protocol("invalid api key header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth_value);

        let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
        let (write, mut read) = ws.split();
        let write = Arc::new(Mutex::new(write));

        self.conversations
            .entry(self.session_key.clone())
            .or_insert_with(|| Conversation::with_system_prompt(self.config.instructions.as_deref()));

        self.state
            .lock()
            .unwrap()
            .transition(AdapterState::Ready)
            .map_err(|s| AdapterError::InvalidState { state: s, action: "session ready" })?;
        self.state
            .lock()
            .unwrap()
            .transition(AdapterState::Streaming)
            .map_err(|s| AdapterError::InvalidState { state: s, action: "begin streaming" })?;

        let llm = self.llm.clone();
        let state = self.state.clone();
        let conversations = self.conversations.clone();
        let session_key = self.session_key.clone();
        let speech_lock = self.speech_lock.clone();
        let tts_url = self.config.url.clone();
        let tts_api_key = self.config.api_key.clone();
        let voice = self.config.voice.clone();
        let events_for_task = events.clone();
        let welcome_message = self.config.welcome_message.clone();

        if let Some(intro) = welcome_message {
            if let Some(mut conversation) = conversations.get_mut(&session_key) {
                conversation.push_assistant(&intro);
            }
            let speech_lock = speech_lock.clone();
            let tts_url = tts_url.clone();
            let tts_api_key = tts_api_key.clone();
            let voice = voice.clone();
            let events_for_welcome = events_for_task.clone();
            let state_for_welcome = state.clone();
            tokio::spawn(async move {
                speak(
                    &speech_lock,
                    &state_for_welcome,
                    &tts_url,
                    &tts_api_key,
                    &voice,
                    &intro,
                    &events_for_welcome,
                )
                .await;
            });
        }

        let read_task = tokio::spawn(async move {
            let mut sentence_buffer = String::new();

            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(%err, "deepgram stt read error");
                        break;
                    }
                };

                let Ok(event) = serde_json::from_str::<Value>(&text) else { continue };
                let Some(transcript) = extract_transcript(&event) else { continue };
                if transcript.is_empty() {
                    continue;
                }

                sentence_buffer.push(' ');
                sentence_buffer.push_str(&transcript);

                let _ = events_for_task
                    .send(AdapterEvent::Transcript {
                        text: transcript.clone(),
                        is_final: event.get("is_final").and_then(Value::as_bool).unwrap_or(false),
                    })
                    .await;

                if !sentence_buffer.trim_end().ends_with(SENTENCE_TERMINATORS) {
                    continue;
                }

                let sentence = sentence_buffer.trim().to_string();
                sentence_buffer.clear();

                let reply = {
                    let mut conversation = conversations
                        .entry(session_key.clone())
                        .or_insert_with(Conversation::default);
                    conversation.push_user(&sentence);
                    let history = conversation.messages.clone();
                    drop(conversation);

                    match llm.reply(&history).await {
                        Ok(reply) => reply,
                        Err(err) => {
                            let _ = events_for_task
                                .send(AdapterEvent::Warning(format!("llm error: {err}")))
                                .await;
                            continue;
                        }
                    }
                };

                if let Some(mut conversation) = conversations.get_mut(&session_key) {
                    conversation.push_assistant(&reply);
                }

                speak(&speech_lock, &state, &tts_url, &tts_api_key, &voice, &reply, &events_for_task)
                    .await;
            }
            let _ = events_for_task.send(AdapterEvent::Closed).await;
        });

        self.write = Some(write);
        self.read_task = Some(read_task);
        Ok(())
    }

    async fn send_audio(&mut self, payload: Bytes) -> Result<()> {
        let write = self.write.as_ref().ok_or(AdapterError::InvalidState {
            state: self.state.lock().unwrap().get(),
            action: "send_audio before start",
        })?;
        write.lock().await.send(Message::Binary(payload.to_vec())).await?;
        Ok(())
    }

    async fn barge_in(&mut self) -> Result<()> {
        // Deepgram TTS has no mid-stream cancel endpoint in this flavor; the
        // call engine's own RTP queue drain is the only thing barge-in needs.
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.state.lock().unwrap().transition(AdapterState::Closing);
        if let Some(write) = &self.write {
            let mut write = write.lock().await;
            let _ = write.send(Message::Text(r#"{"type":"CloseStream"}"#.to_string())).await;
            let _ = write.send(Message::Close(None)).await;
        }
        if let Some(task) = self.read_task.take() {
            let _ = task.await;
        }
        self.conversations.remove(&self.session_key);
        let _ = self.state.lock().unwrap().transition(AdapterState::Closed);
        Ok(())
    }
}

/// Synthesize `text` and emit it as one audio burst, serialized by
/// `speech_lock` so two replies in flight never interleave their packets
/// on the wire. Used both for the `welcome_message` greeting injected at
/// `start()` and for every LLM reply.
async fn speak(
    speech_lock: &Mutex<()>,
    state: &SyncMutex<StateCell>,
    tts_url: &str,
    tts_api_key: &str,
    voice: &Option<String>,
    text: &str,
    events: &mpsc::Sender<AdapterEvent>,
) {
    let _guard = speech_lock.lock().await;
    let client = reqwest::Client::new();
    let audio = client
        .post(tts_url)
        .bearer_auth(tts_api_key)
        .json(&serde_json::json!({ "text": text, "voice": voice }))
        .send()
        .await
        .and_then(|r| r.error_for_status());

    match audio {
        Ok(response) => match response.bytes().await {
            Ok(body) => {
                let _ = state.lock().unwrap().transition(AdapterState::Speaking);
                let _ = events.send(AdapterEvent::AudioOut(body)).await;
                let _ = events.send(AdapterEvent::AudioFlush).await;
                let _ = state.lock().unwrap().transition(AdapterState::Streaming);
            }
            Err(err) => {
                let _ = events.send(AdapterEvent::Warning(format!("tts body error: {err}"))).await;
            }
        },
        Err(err) => {
            let _ = events.send(AdapterEvent::Warning(format!("tts request error: {err}"))).await;
        }
    }
}

fn extract_transcript(event: &Value) -> Option<String> {
    if event.get("type").and_then(Value::as_str) != Some("Results") {
        return None;
    }
    event["channel"]["alternatives"][0]["transcript"].as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_transcript_from_results_event() {
        let event = serde_json::json!({
            "type": "Results",
            "is_final": true,
            "channel": { "alternatives": [ { "transcript": "hello there" } ] }
        });
        assert_eq!(extract_transcript(&event).as_deref(), Some("hello there"));
    }

    #[test]
    fn ignores_non_results_events() {
        let event = serde_json::json!({ "type": "Metadata" });
        assert_eq!(extract_transcript(&event), None);
    }

    #[test]
    fn chat_message_shape_matches_llm_client_expectations() {
        let msg = ChatMessage { role: "user".to_string(), content: "hi".to_string() };
        assert_eq!(msg.role, "user");
    }
}
