//! INI-file configuration, grounded on `config.py`'s `ConfigSection`: each
//! section is a plain string map, and every lookup walks the same
//! option-bag -> INI -> environment -> default chain (spec 6), just with the
//! option bag folded in one layer higher than the Python version (which only
//! had INI -> env -> default, since it had no separate dispatcher-level
//! override concept).

use std::collections::HashMap;
use std::path::Path;

use ini::Ini;
use serde::Deserialize;

use crate::error::{EngineError, Result};

/// One INI section as a flat string map, with the same resolution helpers
/// `ConfigSection` exposed in the original implementation.
#[derive(Debug, Clone, Default)]
pub struct Section {
    values: HashMap<String, String>,
}

impl Section {
    fn from_ini(ini: &Ini, name: &str) -> Self {
        let values = ini
            .section(Some(name))
            .map(|props| props.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
            .unwrap_or_default();
        Self { values }
    }

    #[cfg(test)]
    pub(crate) fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self { values: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect() }
    }

    /// `option` from the INI section, else `env` from the process
    /// environment, else `fallback`.
    pub fn get(&self, option: &str, env: Option<&str>, fallback: Option<&str>) -> Option<String> {
        if let Some(v) = self.values.get(option) {
            return Some(v.clone());
        }
        if let Some(env) = env {
            if let Ok(v) = std::env::var(env) {
                return Some(v);
            }
        }
        fallback.map(str::to_string)
    }

    pub fn get_bool(&self, option: &str, env: Option<&str>, fallback: bool) -> bool {
        match self.get(option, env, None) {
            None => fallback,
            Some(v) => match v.parse::<i64>() {
                Ok(n) => n != 0,
                Err(_) => matches!(v.to_ascii_lowercase().as_str(), "yes" | "true" | "on"),
            },
        }
    }

    pub fn get_u32(&self, option: &str, env: Option<&str>, fallback: u32) -> u32 {
        self.get(option, env, None).and_then(|v| v.parse().ok()).unwrap_or(fallback)
    }

    pub fn get_f32(&self, option: &str, env: Option<&str>, fallback: f32) -> f32 {
        self.get(option, env, None).and_then(|v| v.parse().ok()).unwrap_or(fallback)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// `[engine]` section (spec 6).
#[derive(Debug, Clone)]
pub struct EngineSection {
    pub event_ip: String,
    pub event_port: u16,
    pub rtp_ip: String,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub bot_header: String,
}

/// `[opensips]` section: the management channel peer.
#[derive(Debug, Clone)]
pub struct OpensipsSection {
    pub ip: String,
    pub port: u16,
}

/// `[rtp]` section.
#[derive(Debug, Clone)]
pub struct RtpSection {
    pub min_port: u16,
    pub max_port: u16,
    pub bind_ip: String,
    pub ip: String,
}

/// Turn-detection knobs shared by every realtime/voice-agent flavor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TurnDetectionSection {
    #[serde(default)]
    pub turn_detection_type: Option<String>,
    #[serde(default)]
    pub turn_detection_silence_ms: Option<u32>,
    #[serde(default)]
    pub turn_detection_threshold: Option<f32>,
    #[serde(default)]
    pub turn_detection_prefix_ms: Option<u32>,
}

/// A `[openai]`/`[deepgram]`/`[deepgram_native]`/`[azure]` section, kept as a
/// raw `Section` (so unknown/per-flavor-only keys are never lost) plus the
/// few fields every flavor factory needs to decide whether it even applies.
#[derive(Debug, Clone)]
pub struct FlavorSection {
    pub name: String,
    pub disabled: bool,
    pub dialplan_match: Option<String>,
    pub raw: Section,
}

impl FlavorSection {
    fn load(ini: &Ini, name: &str) -> Self {
        let raw = Section::from_ini(ini, name);
        let disabled = raw.get_bool("disabled", Some(&format!("{}_DISABLE", name.to_uppercase())), false);
        let dialplan_match = raw.get("match", None, None);
        Self { name: name.to_string(), disabled, dialplan_match, raw }
    }
}

/// The known provider flavor section names, in the order `get_ai_flavor`'s
/// default hashing walks them.
pub const FLAVOR_NAMES: [&str; 4] = ["openai", "deepgram", "deepgram_native", "azure"];

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub engine: EngineSection,
    pub opensips: OpensipsSection,
    pub rtp: RtpSection,
    pub flavors: HashMap<String, FlavorSection>,
}

impl AppConfig {
    /// Load from an INI file, falling back to `CONFIG_FILE` when `path` is
    /// `None`, matching `Config.init`'s resolution.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let resolved = path
            .map(|p| p.to_path_buf())
            .or_else(|| std::env::var("CONFIG_FILE").ok().map(Into::into));

        let ini = match resolved {
            Some(path) => Ini::load_from_file(&path)
                .map_err(|e| EngineError::ManagementChannel(format!("config {path:?}: {e}")))?,
            None => Ini::new(),
        };

        let engine_raw = Section::from_ini(&ini, "engine");
        let engine = EngineSection {
            event_ip: engine_raw
                .get("event_ip", Some("EVENT_IP"), Some("127.0.0.1"))
                .unwrap(),
            event_port: engine_raw.get_u32("event_port", Some("EVENT_PORT"), 0) as u16,
            rtp_ip: engine_raw.get("rtp_ip", Some("RTP_IP"), Some("127.0.0.1")).unwrap(),
            api_url: engine_raw.get("api_url", Some("BOT_API_URL"), None),
            api_key: engine_raw.get("api_key", Some("BOT_API_KEY"), None),
            bot_header: engine_raw.get("bot_header", Some("BOT_HEADER"), Some("To")).unwrap(),
        };

        let opensips_raw = Section::from_ini(&ini, "opensips");
        let opensips = OpensipsSection {
            ip: opensips_raw.get("ip", Some("MI_IP"), Some("127.0.0.1")).unwrap(),
            port: opensips_raw.get_u32("port", Some("MI_PORT"), 8080) as u16,
        };

        let rtp_raw = Section::from_ini(&ini, "rtp");
        let rtp = RtpSection {
            min_port: rtp_raw.get_u32("min_port", Some("RTP_MIN_PORT"), 35000) as u16,
            max_port: rtp_raw.get_u32("max_port", Some("RTP_MAX_PORT"), 65000) as u16,
            bind_ip: rtp_raw.get("bind_ip", Some("RTP_BIND_IP"), Some("0.0.0.0")).unwrap(),
            ip: rtp_raw.get("ip", Some("RTP_IP"), Some("127.0.0.1")).unwrap(),
        };

        let flavors =
            FLAVOR_NAMES.iter().map(|name| (name.to_string(), FlavorSection::load(&ini, name))).collect();

        Ok(Self { engine, opensips, rtp, flavors })
    }

    /// Flavor sections enabled for the stable-hash default resolution,
    /// in declaration order (spec 4.7, item 4).
    pub fn enabled_flavors(&self) -> Vec<&str> {
        FLAVOR_NAMES
            .iter()
            .copied()
            .filter(|name| !self.flavors.get(*name).map(|f| f.disabled).unwrap_or(false))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct ScratchIni(PathBuf);

    impl ScratchIni {
        fn new(name: &str, contents: &str) -> Self {
            let path = std::env::temp_dir().join(format!("voicebridge-test-{}-{name}.ini", std::process::id()));
            std::fs::write(&path, contents).unwrap();
            Self(path)
        }
    }

    impl Drop for ScratchIni {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn loads_engine_and_rtp_sections() {
        let file = ScratchIni::new(
            "engine-rtp",
            "[engine]\nevent_ip=10.0.0.5\nbot_header=X-Bot\n\n[rtp]\nmin_port=40000\nmax_port=40100\n",
        );
        let config = AppConfig::load(Some(&file.0)).unwrap();
        assert_eq!(config.engine.event_ip, "10.0.0.5");
        assert_eq!(config.engine.bot_header, "X-Bot");
        assert_eq!(config.rtp.min_port, 40000);
        assert_eq!(config.rtp.max_port, 40100);
    }

    #[test]
    fn flavor_disabled_flag_is_read() {
        let file = ScratchIni::new("flavor-disabled", "[openai]\ndisabled=yes\n");
        let config = AppConfig::load(Some(&file.0)).unwrap();
        assert!(config.flavors["openai"].disabled);
        assert!(!config.enabled_flavors().contains(&"openai"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.rtp.bind_ip, "0.0.0.0");
        assert_eq!(config.engine.bot_header, "To");
    }
}
