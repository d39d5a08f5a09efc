//! Deepgram native voice-agent adapter, grounded on
//! `deepgram_native_api.py`'s `DeepgramNative(AIEngine)`: a single websocket
//! to Deepgram's voice-agent endpoint carrying audio both ways plus a JSON
//! control channel, backed by a caller-configured LLM (`llm_url`/`llm_model`)
//! rather than Deepgram's own completion model.

use std::sync::{Arc, Mutex as SyncMutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
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
use crate::state::{AdapterState, StateCell};
use crate::tool::{TerminateCallTool, ToolRegistry, TransferCallTool};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

struct Shared {
    write: Mutex<WsWriter>,
    tools: ToolRegistry,
    events: mpsc::Sender<AdapterEvent>,
    state: Arc<SyncMutex<StateCell>>,
}

pub struct DeepgramNativeAdapter {
    config: AdapterConfig,
    llm_url: String,
    llm_model: String,
    state: Arc<SyncMutex<StateCell>>,
    shared: Option<Arc<Shared>>,
    read_task: Option<JoinHandle<()>>,
}

impl DeepgramNativeAdapter {
    pub fn new(config: AdapterConfig, llm_url: String, llm_model: String) -> Self {
        Self {
            config,
            llm_url,
            llm_model,
            state: Arc::new(SyncMutex::new(StateCell::new())),
            shared: None,
            read_task: None,
        }
    }

    fn build_tools(&self) -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(TerminateCallTool));
        tools.register(Arc::new(TransferCallTool {
            default_target: self.config.transfer_to.clone(),
            referred_by: self.config.transfer_by.clone(),
        }));
        if let Some(workflow) = &self.config.fallback_workflow {
            tools.set_fallback(Arc::new(crate::tool::HttpWorkflowTool::new(
                workflow.name.clone(),
                workflow.endpoint.clone(),
                workflow.api_key.clone(),
            )));
        }
        tools
    }
}

#[async_trait]
impl AiAdapter for DeepgramNativeAdapter {
    fn codec_priority(&self) -> Vec<CodecKind> {
        vec![CodecKind::Mulaw, CodecKind::Alaw]
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

        let mut request = "wss://agent.deepgram.com/v1/agent/converse".into_client_request()?;
        let auth_value = format!("Token {}", self.config.api_key)
            .parse()
            .map_err(|_| AdapterError::Protocol("invalid api key header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth_value);

        let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
        let (write, mut read) = ws.split();

        let tools = self.build_tools();
        let manifest: Vec<Value> = tools
            .manifest()
            .into_iter()
            .map(|(name, schema)| json!({ "name": name, "parameters": schema }))
            .collect();
        let shared = Arc::new(Shared {
            write: Mutex::new(write),
            tools,
            events: events.clone(),
            state: self.state.clone(),
        });

        let settings = json!({
            "type": "Settings",
            "agent": {
                "speak": { "voice": self.config.voice },
                "think": {
                    "provider": { "type": "custom" },
                    "endpoint": { "url": self.llm_url, "model": self.llm_model },
                    "instructions": self.config.instructions,
                    "functions": manifest,
                },
                "greeting": self.config.welcome_message,
            }
        });
        send_json(&shared, &settings).await?;

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

        let read_shared = shared.clone();
        let read_task = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Binary(audio)) => {
                        let _ = read_shared.state.lock().unwrap().transition(AdapterState::Speaking);
                        let _ =
                            read_shared.events.send(AdapterEvent::AudioOut(Bytes::from(audio))).await;
                    }
                    Ok(Message::Text(text)) => {
                        if let Err(err) = handle_control_message(&read_shared, &text).await {
                            warn!(%err, "deepgram agent event handling failed");
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "deepgram agent websocket read error");
                        break;
                    }
                }
            }
            let _ = read_shared.events.send(AdapterEvent::Closed).await;
        });

        self.shared = Some(shared);
        self.read_task = Some(read_task);
        Ok(())
    }

    async fn send_audio(&mut self, payload: Bytes) -> Result<()> {
        let shared = self.shared.as_ref().ok_or(AdapterError::InvalidState {
            state: self.state.lock().unwrap().get(),
            action: "send_audio before start",
        })?;
        shared.write.lock().await.send(Message::Binary(payload.to_vec())).await?;
        Ok(())
    }

    async fn barge_in(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.state.lock().unwrap().transition(AdapterState::Closing);
        if let Some(shared) = &self.shared {
            let mut write = shared.write.lock().await;
            let _ = write.send(Message::Close(None)).await;
        }
        if let Some(task) = self.read_task.take() {
            let _ = task.await;
        }
        let _ = self.state.lock().unwrap().transition(AdapterState::Closed);
        Ok(())
    }
}

async fn send_json(shared: &Shared, value: &Value) -> Result<()> {
    let mut write = shared.write.lock().await;
    write.send(Message::Text(value.to_string())).await?;
    Ok(())
}

async fn handle_control_message(shared: &Arc<Shared>, text: &str) -> Result<()> {
    let event: Value =
        serde_json::from_str(text).map_err(|e| AdapterError::Protocol(e.to_string()))?;
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();

    match event_type {
        "UserStartedSpeaking" => {
            let _ = shared.events.send(AdapterEvent::BargeIn).await;
        }
        "AgentAudioDone" => {
            let _ = shared.state.lock().unwrap().transition(AdapterState::Streaming);
            let _ = shared.events.send(AdapterEvent::AudioFlush).await;
        }
        "ConversationText" => {
            if let Some(text) = event.get("content").and_then(Value::as_str) {
                let _ = shared
                    .events
                    .send(AdapterEvent::Transcript { text: text.to_string(), is_final: true })
                    .await;
            }
        }
        "FunctionCallRequest" => {
            let name = event.get("function_name").and_then(Value::as_str).unwrap_or_default();
            let call_id = event.get("function_call_id").and_then(Value::as_str).unwrap_or_default();
            let arguments = event.get("input").cloned().unwrap_or_else(|| json!({}));

            if let Some(tool) = shared.tools.find(name) {
                let (output, effect) = tool.call(arguments).await?;
                send_json(
                    shared,
                    &json!({
                        "type": "FunctionCallResponse",
                        "function_call_id": call_id,
                        "output": output,
                    }),
                )
                .await?;
                let _ = shared.events.send(AdapterEvent::ToolEffect(effect)).await;
            } else {
                warn!(name, "no tool registered for function call");
            }
        }
        "Error" => {
            let message = event.get("description").map(|e| e.to_string()).unwrap_or_default();
            let _ = shared.events.send(AdapterEvent::Warning(message)).await;
        }
        _ => {}
    }
    Ok(())
}
