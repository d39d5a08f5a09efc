//! A small chat-completions client and a deployment-scoped conversation
//! store, grounded on `deepgram_api.py`'s class-level `chatgpt = None`: one
//! HTTP client is shared by every call in a deployment, while each call
//! keeps its own turn history.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    pub messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn with_system_prompt(instructions: Option<&str>) -> Self {
        let mut messages = Vec::new();
        if let Some(text) = instructions {
            messages.push(ChatMessage { role: "system".to_string(), content: text.to_string() });
        }
        Self { messages }
    }

    pub fn push_user(&mut self, text: &str) {
        self.messages.push(ChatMessage { role: "user".to_string(), content: text.to_string() });
    }

    pub fn push_assistant(&mut self, text: &str) {
        self.messages
            .push(ChatMessage { role: "assistant".to_string(), content: text.to_string() });
    }
}

/// Keyed by the call's session key; lets a deployment share conversation
/// state across adapter recreations (e.g. a re-INVITE) without losing turns.
pub type ConversationStore = Arc<DashMap<String, Conversation>>;

pub fn new_conversation_store() -> ConversationStore {
    Arc::new(DashMap::new())
}

#[derive(Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl LlmClient {
    pub fn new(url: String, api_key: String, model: String) -> Self {
        Self { client: reqwest::Client::new(), url, api_key, model }
    }

    pub async fn reply(&self, conversation: &[ChatMessage]) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": conversation,
        });
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let payload: serde_json::Value = response.json().await?;
        Ok(payload["choices"][0]["message"]["content"].as_str().unwrap_or_default().to_string())
    }
}
