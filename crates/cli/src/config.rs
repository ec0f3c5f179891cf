use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agent::{MemoryOptions, ProviderConfig, TurnOptions};
use proto::ConfigError;
use serde::{Deserialize, Serialize};
use tracing::debug;

const CONFIG_FILE: &str = "parley.toml";
const KNOWN_PROVIDERS: [&str; 3] = ["openai", "anthropic", "gemini"];

/// Top-level configuration, read from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderSection,
    #[serde(default)]
    pub chat: ChatSection,
    #[serde(default)]
    pub memory: MemorySection,
}

/// `[provider]`: which back end to talk to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderSection {
    #[serde(default = "default_provider_name")]
    pub name: String,
    #[serde(default)]
    pub api_key: String,
    /// Empty means the provider's default model.
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub vision_model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_provider_name() -> String {
    "openai".to_string()
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            api_key: String::new(),
            model: String::new(),
            vision_model: None,
            base_url: None,
        }
    }
}

impl ProviderSection {
    /// Configured model, or a sensible default for the provider.
    pub fn effective_model(&self) -> &str {
        if !self.model.trim().is_empty() {
            return self.model.trim();
        }
        match self.name.as_str() {
            "anthropic" => "claude-sonnet-4-5",
            "gemini" => "gemini-2.0-flash",
            _ => "gpt-4o-mini",
        }
    }

    pub fn to_provider_config(&self) -> ProviderConfig {
        let mut config = ProviderConfig::new(self.api_key.clone(), self.effective_model());
        if let Some(vision) = self.vision_model.as_deref().filter(|v| !v.trim().is_empty()) {
            config = config.with_vision_model(vision);
        }
        if let Some(url) = self.base_url.as_deref().filter(|u| !u.trim().is_empty()) {
            config = config.with_base_url(url);
        }
        config
    }
}

/// `[chat]`: prompts and output budget.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ChatSection {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub vision_system_prompt: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub length_preset: Option<String>,
    /// Merged over the built-in presets.
    #[serde(default)]
    pub presets: BTreeMap<String, u32>,
}

impl ChatSection {
    pub fn turn_options(&self) -> TurnOptions {
        let mut options = TurnOptions::default();
        if let Some(prompt) = &self.system_prompt {
            options.system_prompt = prompt.clone();
        }
        if let Some(prompt) = &self.vision_system_prompt {
            options.vision_system_prompt = prompt.clone();
        }
        options.max_tokens = self.max_tokens;
        options.length_preset = self.length_preset.clone();
        options
            .presets
            .extend(self.presets.iter().map(|(k, v)| (k.clone(), *v)));
        options
    }
}

/// `[memory]`: tier thresholds, retention, and the storage file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemorySection {
    #[serde(default = "default_short_term_secs")]
    pub short_term_secs: u64,
    #[serde(default = "default_mid_term_secs")]
    pub mid_term_secs: u64,
    #[serde(default = "default_long_term_secs")]
    pub long_term_secs: u64,
    #[serde(default = "default_max_summary_length")]
    pub max_summary_length: usize,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
}

fn default_short_term_secs() -> u64 {
    60
}

fn default_mid_term_secs() -> u64 {
    240
}

fn default_long_term_secs() -> u64 {
    540
}

fn default_max_summary_length() -> usize {
    500
}

fn default_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_storage_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.parley/memories.json")
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            short_term_secs: default_short_term_secs(),
            mid_term_secs: default_mid_term_secs(),
            long_term_secs: default_long_term_secs(),
            max_summary_length: default_max_summary_length(),
            retention_secs: default_retention_secs(),
            storage_path: default_storage_path(),
        }
    }
}

impl MemorySection {
    pub fn options(&self) -> MemoryOptions {
        MemoryOptions {
            short_term: Duration::from_secs(self.short_term_secs),
            mid_term: Duration::from_secs(self.mid_term_secs),
            long_term: Duration::from_secs(self.long_term_secs),
            max_summary_length: self.max_summary_length,
            retention: Duration::from_secs(self.retention_secs),
        }
    }
}

impl Config {
    /// Loads configuration from an explicit path or the fallback locations,
    /// applies environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = resolve_path(
            path,
            std::env::current_dir().ok(),
            std::env::var("HOME").ok().map(PathBuf::from),
        );
        debug!(path = ?config_path, "Config file resolved");

        let mut config = match config_path {
            Some(path) => {
                let content = std::fs::read_to_string(&path)?;
                Self::from_toml(&content)?
            }
            None => Config::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        debug!(
            provider = %config.provider.name,
            model = %config.provider.effective_model(),
            base_url = ?config.provider.base_url,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Toml(e.to_string()))
    }

    /// `PARLEY_API_KEY`, `PARLEY_MODEL` and `PARLEY_PROVIDER` win over the file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("PARLEY_API_KEY") {
            self.provider.api_key = key;
        }
        if let Some(model) = lookup("PARLEY_MODEL") {
            self.provider.model = model;
        }
        if let Some(name) = lookup("PARLEY_PROVIDER") {
            self.provider.name = name.trim().to_ascii_lowercase();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !KNOWN_PROVIDERS.contains(&self.provider.name.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "provider.name".to_string(),
                reason: format!(
                    "unknown provider '{}' (expected one of {})",
                    self.provider.name,
                    KNOWN_PROVIDERS.join(", ")
                ),
            });
        }
        self.memory
            .options()
            .validate()
            .map_err(|e| ConfigError::InvalidValue {
                field: "memory".to_string(),
                reason: e.to_string(),
            })?;
        if let Some(preset) = &self.chat.length_preset
            && !self.chat.turn_options().presets.contains_key(preset)
        {
            return Err(ConfigError::InvalidValue {
                field: "chat.length_preset".to_string(),
                reason: format!("no preset named '{preset}'"),
            });
        }
        Ok(())
    }
}

/// Explicit path, then `./parley.toml`, then `~/.parley/config.toml`.
fn resolve_path(
    explicit: Option<&Path>,
    cwd: Option<PathBuf>,
    home: Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(local) = cwd.map(|dir| dir.join(CONFIG_FILE))
        && local.exists()
    {
        return Some(local);
    }
    home.map(|dir| dir.join(".parley").join("config.toml"))
        .filter(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_matches_builtin_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.provider.name, "openai");
        assert_eq!(cfg.provider.effective_model(), "gpt-4o-mini");
        assert_eq!(cfg.memory.options(), MemoryOptions::default());
        assert!(cfg.memory.storage_path.ends_with(".parley/memories.json"));
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn parses_all_sections() {
        let cfg = Config::from_toml(
            r#"
            [provider]
            name = "anthropic"
            api_key = "ak"
            vision_model = "claude-sonnet-4-5"

            [chat]
            system_prompt = "Be playful."
            length_preset = "tiny"

            [chat.presets]
            tiny = 64

            [memory]
            short_term_secs = 30
            mid_term_secs = 90
            long_term_secs = 300
            storage_path = "/tmp/mem.json"
            "#,
        )
        .expect("parse");

        assert_eq!(cfg.provider.effective_model(), "claude-sonnet-4-5");
        let provider = cfg.provider.to_provider_config();
        assert_eq!(provider.api_key, "ak");
        assert_eq!(provider.vision_model.as_deref(), Some("claude-sonnet-4-5"));
        assert_eq!(provider.base_url, None);

        let turn = cfg.chat.turn_options();
        assert_eq!(turn.system_prompt, "Be playful.");
        assert_eq!(turn.resolve_max_tokens(4096), 64);
        assert_eq!(turn.presets.get("long"), Some(&4096));

        assert_eq!(cfg.memory.options().mid_term, Duration::from_secs(90));
        assert_eq!(cfg.memory.max_summary_length, 500);
        cfg.validate().expect("valid");
    }

    #[test]
    fn env_overrides_win_over_file() {
        let mut cfg = Config::from_toml("[provider]\nname = \"openai\"\napi_key = \"file\"\n")
            .expect("parse");
        cfg.apply_env_overrides(env(&[
            ("PARLEY_API_KEY", "env-key"),
            ("PARLEY_PROVIDER", " Gemini "),
        ]));
        assert_eq!(cfg.provider.api_key, "env-key");
        assert_eq!(cfg.provider.name, "gemini");
        assert_eq!(cfg.provider.effective_model(), "gemini-2.0-flash");

        cfg.apply_env_overrides(env(&[("PARLEY_MODEL", "gemini-2.5-pro")]));
        assert_eq!(cfg.provider.effective_model(), "gemini-2.5-pro");
        assert_eq!(cfg.provider.api_key, "env-key");
    }

    #[test]
    fn rejects_unknown_provider() {
        let mut cfg = Config::default();
        cfg.provider.name = "mystery".to_string();
        let err = cfg.validate().expect_err("unknown provider");
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "provider.name"));
    }

    #[test]
    fn rejects_non_ascending_thresholds() {
        let cfg = Config::from_toml("[memory]\nshort_term_secs = 300\nmid_term_secs = 200\n")
            .expect("parse");
        let err = cfg.validate().expect_err("thresholds out of order");
        assert!(err.to_string().contains("memory"));
    }

    #[test]
    fn rejects_unknown_length_preset() {
        let cfg = Config::from_toml("[chat]\nlength_preset = \"epic\"\n").expect("parse");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_a_toml_error() {
        let err = Config::from_toml("[provider\nname=").expect_err("bad toml");
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn resolve_prefers_explicit_then_cwd_then_home() {
        let cwd = tempfile::tempdir().expect("cwd");
        let home = tempfile::tempdir().expect("home");
        let home_config = home.path().join(".parley").join("config.toml");
        std::fs::create_dir_all(home_config.parent().expect("parent")).expect("mkdir");
        std::fs::write(&home_config, "").expect("write home config");

        let explicit = PathBuf::from("/etc/parley.toml");
        assert_eq!(
            resolve_path(Some(&explicit), None, None),
            Some(explicit.clone())
        );
        assert_eq!(
            resolve_path(None, Some(cwd.path().to_path_buf()), Some(home.path().to_path_buf())),
            Some(home_config)
        );

        let local = cwd.path().join(CONFIG_FILE);
        std::fs::write(&local, "").expect("write local config");
        assert_eq!(
            resolve_path(None, Some(cwd.path().to_path_buf()), Some(home.path().to_path_buf())),
            Some(local)
        );
        assert_eq!(resolve_path(None, None, None), None);
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().expect("dir");
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[provider]\nname = \"gemini\"\napi_key = \"gk\"\n").expect("write");
        let cfg = Config::load(Some(&path)).expect("load");
        if std::env::var("PARLEY_PROVIDER").is_err() {
            assert_eq!(cfg.provider.name, "gemini");
        }
    }
}
