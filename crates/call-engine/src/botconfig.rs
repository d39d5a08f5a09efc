//! Optional per-deployment "bot configuration" fetch (spec 1, 4.7): an HTTP
//! lookup keyed by a configurable header (`[engine] bot_header`, default
//! `To`'s user part) returning `{"flavor": ..., <flavor-specific keys>...}`.
//! Treated as an opaque option bag, merged over the static INI section for
//! the resolved flavor.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

/// A resolved bot configuration: which flavor to use plus whatever override
/// keys it returned (merged over the static config at adapter-build time).
#[derive(Debug, Clone, Default)]
pub struct BotConfig {
    pub flavor: Option<String>,
    pub overrides: HashMap<String, Value>,
}

/// Fetches `{api_url}?user=<key>` (bearer-authenticated if `api_key` is
/// set). Any failure is non-fatal here (spec 7's `BotConfigUnavailable`):
/// the caller falls back to static flavor resolution.
pub async fn fetch(client: &reqwest::Client, api_url: &str, api_key: Option<&str>, lookup_key: &str) -> Option<BotConfig> {
    let mut request = client.get(api_url).query(&[("user", lookup_key)]);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(err) => {
            warn!(%err, "bot config http request failed");
            return None;
        }
    };

    let body: Value = match response.error_for_status() {
        Ok(r) => match r.json().await {
            Ok(v) => v,
            Err(err) => {
                warn!(%err, "bot config response was not json");
                return None;
            }
        },
        Err(err) => {
            warn!(%err, "bot config endpoint returned an error status");
            return None;
        }
    };

    let flavor = body.get("flavor").and_then(Value::as_str).map(str::to_string);
    let overrides = body
        .as_object()
        .map(|map| map.iter().filter(|(k, _)| *k != "flavor").map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    Some(BotConfig { flavor, overrides })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_exclude_the_flavor_key() {
        let body = serde_json::json!({ "flavor": "openai", "voice": "alloy", "temperature": 0.4 });
        let overrides: HashMap<String, Value> = body
            .as_object()
            .map(|map| map.iter().filter(|(k, _)| *k != "flavor").map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        assert!(!overrides.contains_key("flavor"));
        assert_eq!(overrides.get("voice").and_then(Value::as_str), Some("alloy"));
    }
}
