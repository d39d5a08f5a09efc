//! Configuration shared across provider flavors, loaded by the call engine
//! from the bot's INI section (see `config.py`'s resolution chain) and
//! handed to whichever flavor constructor the dispatcher picked.

#[derive(Debug, Clone, Default)]
pub struct TurnDetectionConfig {
    pub silence_duration_ms: u32,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
}

#[derive(Debug, Clone)]
pub struct HttpToolConfig {
    pub name: String,
    pub endpoint: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AdapterConfig {
    pub model: String,
    pub url: String,
    pub api_key: String,
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub welcome_message: Option<String>,
    pub transfer_to: Option<String>,
    pub transfer_by: Option<String>,
    pub turn_detection: TurnDetectionConfig,
    pub http_tools: Vec<HttpToolConfig>,
    /// Fallback workflow engine used when a function call is neither a
    /// built-in nor a configured HTTP tool (the Dify-workflow path in
    /// `openai_api.py`'s `handle_command`).
    pub fallback_workflow: Option<HttpToolConfig>,
}
