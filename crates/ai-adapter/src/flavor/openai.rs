//! OpenAI realtime adapter, grounded on `openai_api.py`'s `OpenAI(AIEngine)`:
//! a websocket session speaking the `session.update` / `response.*` /
//! `conversation.item.*` protocol, with function calls dispatched through
//! the tool registry and echoed back as `function_call_output`.

use std::sync::{Arc, Mutex as SyncMutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
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
use tracing::{debug, warn};

use voicebridge_codec_core::CodecKind;

use crate::adapter::{AdapterEvent, AiAdapter};
use crate::config::AdapterConfig;
use crate::error::{AdapterError, Result};
use crate::state::{AdapterState, StateCell};
use crate::tool::{HttpWorkflowTool, TerminateCallTool, ToolRegistry, TransferCallTool};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

/// Which header carries the provider credential. Azure's realtime endpoint
/// authenticates with a plain `api-key` header instead of OpenAI's bearer
/// token, but otherwise speaks the identical protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthHeader {
    Bearer,
    ApiKey,
}

struct Shared {
    write: Mutex<WsWriter>,
    tools: ToolRegistry,
    events: mpsc::Sender<AdapterEvent>,
    state: Arc<SyncMutex<StateCell>>,
}

pub struct OpenAiAdapter {
    config: AdapterConfig,
    state: Arc<SyncMutex<StateCell>>,
    shared: Option<Arc<Shared>>,
    read_task: Option<JoinHandle<()>>,
}

impl OpenAiAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self { config, state: Arc::new(SyncMutex::new(StateCell::new())), shared: None, read_task: None }
    }

    fn build_tools(&self) -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(TerminateCallTool));
        tools.register(Arc::new(TransferCallTool {
            default_target: self.config.transfer_to.clone(),
            referred_by: self.config.transfer_by.clone(),
        }));
        for tool_cfg in &self.config.http_tools {
            tools.register(Arc::new(HttpWorkflowTool::new(
                tool_cfg.name.clone(),
                tool_cfg.endpoint.clone(),
                tool_cfg.api_key.clone(),
            )));
        }
        if let Some(workflow) = &self.config.fallback_workflow {
            tools.set_fallback(Arc::new(HttpWorkflowTool::new(
                workflow.name.clone(),
                workflow.endpoint.clone(),
                workflow.api_key.clone(),
            )));
        }
        tools
    }

    fn tool_manifest(tools: &ToolRegistry) -> Vec<Value> {
        tools
            .manifest()
            .into_iter()
            .map(|(name, schema)| {
                json!({ "type": "function", "name": name, "parameters": schema })
            })
            .collect()
    }
}

#[async_trait]
impl AiAdapter for OpenAiAdapter {
    fn codec_priority(&self) -> Vec<CodecKind> {
        vec![CodecKind::Alaw, CodecKind::Mulaw]
    }

    fn state(&self) -> AdapterState {
        self.state.lock().unwrap().get()
    }

    async fn start(&mut self, events: mpsc::Sender<AdapterEvent>) -> Result<()> {
        self.start_with_auth(events, AuthHeader::Bearer).await
    }

    async fn send_audio(&mut self, payload: Bytes) -> Result<()> {
        let shared = self.shared.as_ref().ok_or(AdapterError::InvalidState {
            state: self.state.lock().unwrap().get(),
            action: "send_audio before start",
        })?;
        let encoded = BASE64.encode(&payload);
        send_json(shared, &json!({ "type": "input_audio_buffer.append", "audio": encoded }))
            .await
    }

    async fn barge_in(&mut self) -> Result<()> {
        if let Some(shared) = &self.shared {
            send_json(shared, &json!({ "type": "response.cancel" })).await?;
        }
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

impl OpenAiAdapter {
    pub(crate) async fn start_with_auth(
        &mut self,
        events: mpsc::Sender<AdapterEvent>,
        auth: AuthHeader,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .transition(AdapterState::Connecting)
            .map_err(|s| AdapterError::InvalidState { state: s, action: "start" })?;

        let mut request = self.config.url.clone().into_client_request()?;
        let header_value = match auth {
            AuthHeader::Bearer => format!("Bearer {}", self.config.api_key),
            AuthHeader::ApiKey => self.config.api_key.clone(),
        };
        let header_name = match auth {
            AuthHeader::Bearer => AUTHORIZATION,
            AuthHeader::ApiKey => tokio_tungstenite::tungstenite::http::header::HeaderName::from_static(
                "api-key",
            ),
        };
        let auth_value = header_value
            .parse()
            .map_err(|_| AdapterError::Protocol("invalid api key header value".to_string()))?;
        request.headers_mut().insert(header_name, auth_value);

        let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
        let (write, mut read) = ws.split();

        let tools = self.build_tools();
        let manifest = Self::tool_manifest(&tools);
        let shared =
            Arc::new(Shared { write: Mutex::new(write), tools, events: events.clone(), state: self.state.clone() });

        let session_update = json!({
            "type": "session.update",
            "session": {
                "voice": self.config.voice,
                "instructions": self.config.instructions,
                "turn_detection": {
                    "type": "server_vad",
                    "silence_duration_ms": self.config.turn_detection.silence_duration_ms,
                    "threshold": self.config.turn_detection.threshold,
                    "prefix_padding_ms": self.config.turn_detection.prefix_padding_ms,
                },
                "tools": manifest,
            }
        });
        send_json(&shared, &session_update).await?;

        if let Some(welcome) = &self.config.welcome_message {
            let greeting = format!("Please greet the user with the following: {welcome}");
            send_json(
                &shared,
                &json!({ "type": "response.create", "response": { "instructions": greeting } }),
            )
            .await?;
        }

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
                    Ok(Message::Text(text)) => {
                        if let Err(err) = handle_server_event(&read_shared, &text).await {
                            warn!(%err, "openai event handling failed");
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "openai websocket read error");
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
}

async fn send_json(shared: &Shared, value: &Value) -> Result<()> {
    let mut write = shared.write.lock().await;
    write.send(Message::Text(value.to_string())).await?;
    Ok(())
}

async fn handle_server_event(shared: &Arc<Shared>, text: &str) -> Result<()> {
    let event: Value =
        serde_json::from_str(text).map_err(|e| AdapterError::Protocol(e.to_string()))?;
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();

    match event_type {
        "response.audio.delta" => {
            if let Some(delta) = event.get("delta").and_then(Value::as_str) {
                let bytes = BASE64
                    .decode(delta)
                    .map_err(|e| AdapterError::Protocol(e.to_string()))?;
                let _ = shared.state.lock().unwrap().transition(AdapterState::Speaking);
                let _ = shared.events.send(AdapterEvent::AudioOut(Bytes::from(bytes))).await;
            }
        }
        "response.audio.done" => {
            let _ = shared.state.lock().unwrap().transition(AdapterState::Streaming);
            let _ = shared.events.send(AdapterEvent::AudioFlush).await;
        }
        "conversation.item.created" => {
            if event.get("item").and_then(|i| i.get("status")).and_then(Value::as_str)
                == Some("completed")
            {
                let _ = shared.events.send(AdapterEvent::BargeIn).await;
            }
        }
        "response.done" => {
            dispatch_function_calls(shared, &event).await?;
        }
        "conversation.item.input_audio_transcription.completed" => {
            if let Some(transcript) = event.get("transcript").and_then(Value::as_str) {
                let _ = shared
                    .events
                    .send(AdapterEvent::Transcript { text: transcript.to_string(), is_final: true })
                    .await;
            }
        }
        "error" => {
            let message = event.get("error").map(|e| e.to_string()).unwrap_or_default();
            let _ = shared.events.send(AdapterEvent::Warning(message)).await;
        }
        _ => debug!(event_type, "unhandled openai realtime event"),
    }
    Ok(())
}

async fn dispatch_function_calls(shared: &Arc<Shared>, event: &Value) -> Result<()> {
    let Some(outputs) = event.get("response").and_then(|r| r.get("output")).and_then(Value::as_array)
    else {
        return Ok(());
    };

    for item in outputs {
        if item.get("type").and_then(Value::as_str) != Some("function_call") {
            continue;
        }
        let name = item.get("name").and_then(Value::as_str).unwrap_or_default();
        let call_id = item.get("call_id").and_then(Value::as_str).unwrap_or_default();
        let arguments: Value = item
            .get("arguments")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_else(|| json!({}));

        let Some(tool) = shared.tools.find_or_fallback(name) else {
            warn!(name, "no tool registered for function call and no workflow fallback configured");
            continue;
        };

        let call_arguments =
            if shared.tools.find(name).is_some() { arguments } else { json!({ "tool": name, "arguments": arguments }) };
        let (output, effect) = tool.call(call_arguments).await?;
        send_json(
            shared,
            &json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "function_call_output",
                    "call_id": call_id,
                    "output": output.to_string(),
                }
            }),
        )
        .await?;
        send_json(shared, &json!({ "type": "response.create" })).await?;

        let _ = shared.events.send(AdapterEvent::ToolEffect(effect)).await;
    }
    Ok(())
}
