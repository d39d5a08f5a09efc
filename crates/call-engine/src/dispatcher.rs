//! The dispatcher (C8, spec 4.7): the single point where `E_UA_SESSION`
//! events from the management channel turn into `Call` lifecycle actions,
//! grounded on `engine.py`'s `handle_call`/`udp_handler` and `utils.py`'s
//! `get_ai_flavor`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

use voicebridge_ai_adapter::config::{AdapterConfig, HttpToolConfig, TurnDetectionConfig};
use voicebridge_ai_adapter::flavor::azure::AzureAdapter;
use voicebridge_ai_adapter::flavor::deepgram_native::DeepgramNativeAdapter;
use voicebridge_ai_adapter::flavor::deepgram_split::DeepgramSplitAdapter;
use voicebridge_ai_adapter::flavor::openai::OpenAiAdapter;
use voicebridge_ai_adapter::llm::{new_conversation_store, ConversationStore, LlmClient};
use voicebridge_ai_adapter::AiAdapter;
use voicebridge_rtp::PortAllocator;

use crate::botconfig;
use crate::call::{Call, CallOptions};
use crate::config::{AppConfig, FlavorSection};
use crate::error::{EngineError, Result};
use crate::headers;
use crate::mgmt::{self, ManagementChannel, SessionEvent};

/// Owns every live call and routes management-channel events to them.
pub struct Dispatcher {
    config: AppConfig,
    mgmt: Arc<ManagementChannel>,
    port_allocator: Arc<Mutex<PortAllocator>>,
    calls: DashMap<String, Call>,
    http_client: reqwest::Client,
    local_ip: IpAddr,
    conversations: ConversationStore,
}

impl Dispatcher {
    pub fn new(config: AppConfig, mgmt: Arc<ManagementChannel>) -> Result<Arc<Self>> {
        let local_ip: IpAddr = config
            .rtp
            .ip
            .parse()
            .map_err(|_| EngineError::ManagementChannel(format!("invalid [rtp] ip: {}", config.rtp.ip)))?;
        let bind_ip: IpAddr = config
            .rtp
            .bind_ip
            .parse()
            .map_err(|_| EngineError::ManagementChannel(format!("invalid [rtp] bind_ip: {}", config.rtp.bind_ip)))?;

        let port_allocator =
            Arc::new(Mutex::new(PortAllocator::with_bind_ip(bind_ip, config.rtp.min_port, config.rtp.max_port)));

        Ok(Arc::new(Self {
            config,
            mgmt,
            port_allocator,
            calls: DashMap::new(),
            http_client: reqwest::Client::new(),
            local_ip,
            conversations: new_conversation_store(),
        }))
    }

    /// Drains `events` until the channel closes, handling each one on its
    /// own task so a slow call setup never blocks the next event.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.handle_event(event).await;
            });
        }
    }

    async fn handle_event(self: Arc<Self>, event: SessionEvent) {
        match event.method.as_str() {
            "INVITE" => self.handle_invite(event).await,
            "BYE" => self.handle_bye(event).await,
            "NOTIFY" => self.handle_notify(event).await,
            other => {
                let status = if self.calls.contains_key(&event.key) { 405 } else { 481 };
                let reason = if status == 405 { "Method not supported" } else { "Call/Transaction Does Not Exist" };
                if let Err(err) = self.mgmt.reply(&event.key, other, status, reason, None).await {
                    warn!(%err, method = other, "failed to reply to unsupported method");
                }
            }
        }
    }

    async fn handle_invite(self: &Arc<Self>, event: SessionEvent) {
        let key = event.key.clone();

        if let Some(call) = self.calls.get(&key) {
            let answer = call.renegotiate(event.body.as_deref().unwrap_or_default()).await;
            drop(call);
            if let Err(err) = self.mgmt.reply(&key, "INVITE", 200, "OK", Some(&answer)).await {
                warn!(%err, key, "failed to reply to re-INVITE");
            }
            return;
        }

        let Some(body) = event.body.as_deref() else {
            let _ = self.mgmt.reply(&key, "INVITE", 415, "Unsupported Media Type", None).await;
            return;
        };

        match self.construct_call(&key, body, &event).await {
            Ok((call, answer)) => {
                let termination = call.termination_watch();
                self.calls.insert(key.clone(), call);
                self.spawn_termination_watcher(key.clone(), termination);
                if let Err(err) = self.mgmt.reply(&key, "INVITE", 200, "OK", Some(&answer)).await {
                    warn!(%err, key, "failed to reply to INVITE");
                }
            }
            Err(err) => {
                let status = err.sip_status();
                warn!(%err, key, status, "call setup failed");
                let _ = self.mgmt.reply(&key, "INVITE", status, reason_phrase(status), None).await;
            }
        }
    }

    /// Watches one call's RTP session for engine-driven termination (adapter
    /// failure, the `terminate_call` tool) and, when observed, removes it
    /// from the call table, closes it, and tells the signaling peer to hang
    /// up - the half of lifecycle-driven teardown that a BYE/NOTIFY-initiated
    /// close doesn't need, since those already know to remove and close the
    /// call themselves. `DashMap::remove` is the race guard: whichever path
    /// (this watcher, or an explicit BYE/NOTIFY) removes the entry first is
    /// the one that actually closes it and talks to the management channel;
    /// the other observes `None` and does nothing.
    fn spawn_termination_watcher(self: &Arc<Self>, key: String, mut termination: watch::Receiver<bool>) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            while !*termination.borrow() {
                if termination.changed().await.is_err() {
                    break;
                }
            }
            if let Some((_, call)) = dispatcher.calls.remove(&key) {
                info!(key, "engine-driven call termination observed, tearing down");
                call.close().await;
                if let Err(err) = dispatcher.mgmt.terminate(&key).await {
                    warn!(%err, key, "failed to send session-terminate after engine-driven call teardown");
                }
            }
        });
    }

    async fn handle_bye(&self, event: SessionEvent) {
        let key = event.key.clone();
        if let Some((_, call)) = self.calls.remove(&key) {
            call.close().await;
            let _ = self.mgmt.reply(&key, "BYE", 200, "OK", None).await;
        } else {
            let _ = self.mgmt.reply(&key, "BYE", 481, "Call/Transaction Does Not Exist", None).await;
        }
    }

    async fn handle_notify(&self, event: SessionEvent) {
        let key = event.key.clone();
        if !self.calls.contains_key(&key) {
            let _ = self.mgmt.reply(&key, "NOTIFY", 481, "Call/Transaction Does Not Exist", None).await;
            return;
        }

        let _ = self.mgmt.reply(&key, "NOTIFY", 200, "OK", None).await;

        if mgmt::subscription_terminated(&event) {
            if let Some((_, call)) = self.calls.remove(&key) {
                info!(key, "subscription terminated, tearing down transferred call");
                call.close().await;
            }
        }
    }

    async fn construct_call(&self, key: &str, body: &str, event: &SessionEvent) -> Result<(Call, String)> {
        let user = headers::get_user(&event.headers, &self.config.engine.bot_header)
            .ok_or_else(|| EngineError::UnknownSipUser("cannot parse username".to_string()))?;

        let bot_config = self.lookup_bot_config(&user, event).await;
        let flavor_name = self.resolve_flavor(&user, event, bot_config.as_ref())?;
        let flavor_section = self
            .config
            .flavors
            .get(&flavor_name)
            .ok_or_else(|| EngineError::FlavorResolutionFailed(key.to_string()))?;

        let overrides = bot_config.map(|c| c.overrides).unwrap_or_default();
        let adapter_config = build_adapter_config(flavor_section, &overrides);
        let transfer_by = adapter_config.transfer_by.clone();

        let adapter = self.build_adapter(&flavor_name, adapter_config, key);

        let options = CallOptions { bot_id: user, local_ip: self.local_ip, transfer_by };
        Call::construct(key.to_string(), body, adapter, self.port_allocator.clone(), options, self.mgmt.clone()).await
    }

    async fn lookup_bot_config(&self, user: &str, event: &SessionEvent) -> Option<botconfig::BotConfig> {
        let api_url = self.config.engine.api_url.as_deref()?;
        let lookup_key = event
            .extra_params
            .get("bot_header_value")
            .and_then(Value::as_str)
            .unwrap_or(user);
        botconfig::fetch(&self.http_client, api_url, self.config.engine.api_key.as_deref(), lookup_key).await
    }

    /// Flavor resolution order (spec 4.7): explicit override in the event,
    /// then the bot-config lookup's own `flavor` field, then a per-flavor
    /// dialplan `match` against the user, then a stable default.
    fn resolve_flavor(
        &self,
        user: &str,
        event: &SessionEvent,
        bot_config: Option<&botconfig::BotConfig>,
    ) -> Result<String> {
        if let Some(flavor) = event.extra_params.get("flavor").and_then(Value::as_str) {
            return Ok(flavor.to_string());
        }
        if let Some(flavor) = bot_config.and_then(|c| c.flavor.as_deref()) {
            return Ok(flavor.to_string());
        }

        let enabled = self.config.enabled_flavors();
        if enabled.is_empty() {
            return Err(EngineError::FlavorResolutionFailed(user.to_string()));
        }

        for name in &enabled {
            let Some(section) = self.config.flavors.get(*name) else { continue };
            let Some(pattern) = &section.dialplan_match else { continue };
            if Regex::new(pattern).is_ok_and(|re| re.is_match(user)) {
                return Ok(name.to_string());
            }
        }

        if enabled.contains(&user) {
            return Ok(user.to_string());
        }
        let index = (stable_hash(user) as usize) % enabled.len();
        Ok(enabled[index].to_string())
    }

    fn build_adapter(&self, flavor: &str, config: AdapterConfig, session_key: &str) -> Box<dyn AiAdapter> {
        match flavor {
            "openai" => Box::new(OpenAiAdapter::new(config)),
            "azure" => Box::new(AzureAdapter::new(config)),
            "deepgram_native" => {
                let llm_url = config.url.clone();
                let llm_model = config.model.clone();
                Box::new(DeepgramNativeAdapter::new(config, llm_url, llm_model))
            }
            _ => {
                let llm = LlmClient::new(config.url.clone(), config.api_key.clone(), config.model.clone());
                Box::new(DeepgramSplitAdapter::new(config, session_key.to_string(), llm, self.conversations.clone()))
            }
        }
    }

    /// Closes every live call and unsubscribes from the management channel,
    /// mirroring `engine.py`'s `shutdown`.
    pub async fn shutdown(&self) {
        let keys: Vec<String> = self.calls.iter().map(|entry| entry.key().clone()).collect();
        info!(count = keys.len(), "closing outstanding calls for shutdown");
        for key in keys {
            if let Some((_, call)) = self.calls.remove(&key) {
                call.close().await;
            }
        }
        if let Err(err) = self.mgmt.unsubscribe("E_UA_SESSION").await {
            warn!(%err, "failed to unsubscribe from management channel events");
        }
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        404 => "Not Found",
        405 => "Method Not Allowed",
        415 => "Unsupported Media Type",
        488 => "Not Acceptable Here",
        _ => "Server Internal Error",
    }
}

/// Resolves the option-bag -> INI -> env -> default chain (spec 6) for one
/// flavor into the uniform [`AdapterConfig`] every adapter constructor
/// consumes. `overrides` are the bot-config service's response keys, which
/// outrank the static INI section.
fn build_adapter_config(section: &FlavorSection, overrides: &HashMap<String, Value>) -> AdapterConfig {
    let raw = &section.raw;
    let pick = |key: &str, env_suffix: &str| -> Option<String> {
        overrides
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| raw.get(key, Some(&format!("{}_{}", section.name.to_uppercase(), env_suffix)), None))
    };

    let http_tools = pick("tool_name", "TOOL_NAME")
        .zip(pick("tool_endpoint", "TOOL_ENDPOINT"))
        .map(|(name, endpoint)| {
            vec![HttpToolConfig { name, endpoint, api_key: pick("tool_api_key", "TOOL_API_KEY") }]
        })
        .unwrap_or_default();

    let fallback_workflow = pick("workflow_url", "WORKFLOW_URL").map(|endpoint| HttpToolConfig {
        name: "workflow".to_string(),
        endpoint,
        api_key: pick("workflow_api_key", "WORKFLOW_API_KEY"),
    });

    AdapterConfig {
        model: pick("model", "MODEL").or_else(|| pick("speech_model", "SPEECH_MODEL")).unwrap_or_default(),
        url: pick("url", "URL").unwrap_or_default(),
        api_key: pick("key", "KEY").unwrap_or_default(),
        voice: pick("voice", "VOICE"),
        instructions: pick("instructions", "INSTRUCTIONS"),
        welcome_message: pick("welcome_message", "WELCOME_MESSAGE"),
        transfer_to: pick("transfer_to", "TRANSFER_TO"),
        transfer_by: pick("transfer_by", "TRANSFER_BY"),
        turn_detection: TurnDetectionConfig {
            silence_duration_ms: raw.get_u32("turn_detection_silence_ms", None, 500),
            threshold: raw.get_f32("turn_detection_threshold", None, 0.5),
            prefix_padding_ms: raw.get_u32("turn_detection_prefix_ms", None, 300),
        },
        http_tools,
        fallback_workflow,
    }
}

/// FNV-1a: deterministic across processes and platforms, unlike relying on
/// `DefaultHasher`'s unspecified internals, for the "default flavor" hash in
/// spec 4.7 item 4.
fn stable_hash(value: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    value.bytes().fold(OFFSET_BASIS, |hash, byte| (hash ^ byte as u64).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_hash_is_deterministic() {
        assert_eq!(stable_hash("alice"), stable_hash("alice"));
        assert_ne!(stable_hash("alice"), stable_hash("bob"));
    }

    #[test]
    fn build_adapter_config_prefers_overrides_over_ini() {
        let mut overrides = HashMap::new();
        overrides.insert("voice".to_string(), Value::String("shimmer".to_string()));

        let section = FlavorSection {
            name: "openai".to_string(),
            disabled: false,
            dialplan_match: None,
            raw: crate::config::Section::from_pairs(&[("voice", "alloy")]),
        };

        let config = build_adapter_config(&section, &overrides);
        assert_eq!(config.voice.as_deref(), Some("shimmer"));
    }
}
