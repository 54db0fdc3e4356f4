use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Overrides `api.base_url` from the config file when set.
pub const BASE_URL_ENV: &str = "FORMULA_API_BASE_URL";

const DEFAULT_BASE_URL: &str = "http://localhost:8000";

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_max_ingredients() -> usize {
    7
}

fn default_expected_exchanges() -> usize {
    4
}

fn default_status_hide_delay_ms() -> u64 {
    1000
}

fn default_status_rotate_ms() -> u64 {
    1500
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub ui: UiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub min_width: u32,
    pub min_height: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UiConfig {
    /// How many ingredients the results panel lists.
    #[serde(default = "default_max_ingredients")]
    pub max_ingredients: usize,
    /// Exchanges the backend usually needs; drives the progress bar only.
    #[serde(default = "default_expected_exchanges")]
    pub expected_exchanges: usize,
    #[serde(default = "default_status_hide_delay_ms")]
    pub status_hide_delay_ms: u64,
    #[serde(default = "default_status_rotate_ms")]
    pub status_rotate_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            base_url: default_base_url(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            width: 900,
            height: 760,
            min_width: 480,
            min_height: 400,
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        UiConfig {
            max_ingredients: default_max_ingredients(),
            expected_exchanges: default_expected_exchanges(),
            status_hide_delay_ms: default_status_hide_delay_ms(),
            status_rotate_ms: default_status_rotate_ms(),
        }
    }
}

impl Config {
    /// Reads `config.toml` and applies the environment override. Never fails:
    /// unreadable or invalid files fall back to defaults with a warning.
    pub fn load() -> Self {
        let config_path = Self::get_config_path();

        let mut config = if config_path.exists() {
            match Self::from_file(&config_path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Error loading {}: {:#}. Using defaults.", config_path.display(), e);
                    Config::default()
                }
            }
        } else {
            Config::default()
        };

        config.apply_base_url_override(std::env::var(BASE_URL_ENV).ok());
        config
    }

    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Empty or whitespace-only overrides are ignored.
    pub fn apply_base_url_override(&mut self, value: Option<String>) {
        if let Some(url) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
            self.api.base_url = url;
        }
    }

    pub fn get_config_path() -> PathBuf {
        Self::get_config_dir().join("config.toml")
    }

    pub fn get_config_dir() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(".config/formula-bar")
        } else {
            PathBuf::from(".")
        }
    }
}

/// Every backend URL the client talks to, derived once from the base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub base_url: String,
    pub generate: String,
    pub validate: String,
    pub suggestions: String,
    pub formulation_stream: String,
    pub conversation_start: String,
    pub conversation_continue: String,
    pub aggregate_intent: String,
    pub conversation_stream: String,
    pub conversation_summary: String,
}

impl Endpoints {
    pub fn new(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/').to_string();
        let join = |suffix: &str| format!("{}{}", base, suffix);

        Endpoints {
            generate: join("/formulation/"),
            validate: join("/formulation/validate"),
            suggestions: join("/formulation/suggestions"),
            formulation_stream: join("/formulation/stream"),
            conversation_start: join("/conversation/start"),
            conversation_continue: join("/conversation/continue"),
            aggregate_intent: join("/conversation/aggregate-intent"),
            conversation_stream: join("/conversation/stream"),
            conversation_summary: join("/conversation/summary"),
            base_url: base,
        }
    }
}

impl From<&ApiConfig> for Endpoints {
    fn from(api: &ApiConfig) -> Self {
        Endpoints::new(&api.base_url)
    }
}
