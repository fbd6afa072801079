use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_PORT: u16 = 18789;
pub const DEFAULT_BIND: &str = "127.0.0.1";

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const OPENAI_BASE_URL: &str = "https://api.openai.com";

/// Upstream provider dialect. Small closed set, so a tagged enum rather
/// than a plugin interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    OpenAi,
}

impl Provider {
    pub fn parse(name: &str) -> Provider {
        match name {
            "openai" => Provider::OpenAi,
            _ => Provider::Anthropic,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
        }
    }
}

/// Gateway configuration, loaded from a JSON file with environment
/// overrides for the API keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub default_provider: String,
    pub anthropic_model: String,
    pub openai_model: String,
    pub max_tokens: u32,
    pub temperature: f64,

    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,

    /// Base URLs are configurable so tests can point at a local mock.
    pub anthropic_base_url: String,
    pub openai_base_url: String,

    pub gateway_port: u16,
    pub gateway_bind: String,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    /// Bearer token for the gateway itself. Empty or absent disables auth.
    pub auth_token: Option<String>,

    pub session_db_path: Option<String>,
    pub system_prompt: String,

    pub upstream_workers: usize,
    pub upstream_timeout_secs: u64,
    pub history_limit: u32,
    pub workspace_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_provider: "anthropic".into(),
            anthropic_model: "claude-sonnet-4-20250514".into(),
            openai_model: "gpt-4o".into(),
            max_tokens: 4096,
            temperature: 0.7,
            anthropic_api_key: None,
            openai_api_key: None,
            anthropic_base_url: ANTHROPIC_BASE_URL.into(),
            openai_base_url: OPENAI_BASE_URL.into(),
            gateway_port: DEFAULT_PORT,
            gateway_bind: DEFAULT_BIND.into(),
            tls_cert_path: None,
            tls_key_path: None,
            auth_token: None,
            session_db_path: None,
            system_prompt: "You are a helpful assistant.".into(),
            upstream_workers: 4,
            upstream_timeout_secs: 300,
            history_limit: 50,
            workspace_dir: None,
        }
    }
}

impl Config {
    /// Load from `path`, or from `~/.portico/config.json` when `path` is
    /// None. A missing file yields defaults (and the default file is
    /// written so the user has something to edit). Environment variables
    /// override file values for the API keys.
    pub fn load(path: Option<&str>) -> Result<Config> {
        let path = match path {
            Some(p) => PathBuf::from(p),
            None => default_config_path(),
        };

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config from {}", path.display()))?
        } else {
            let config = Config::default();
            write_default(&path, &config);
            config
        };

        config.apply_env();
        Ok(config)
    }

    /// Environment overrides config-file values.
    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            if !key.is_empty() {
                self.anthropic_api_key = Some(key);
            }
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.is_empty() {
                self.openai_api_key = Some(key);
            }
        }
    }

    pub fn default_provider(&self) -> Provider {
        Provider::parse(&self.default_provider)
    }

    pub fn api_key(&self, provider: Provider) -> Option<&str> {
        let key = match provider {
            Provider::Anthropic => self.anthropic_api_key.as_deref(),
            Provider::OpenAi => self.openai_api_key.as_deref(),
        };
        key.filter(|k| !k.is_empty())
    }

    pub fn model(&self, provider: Provider) -> &str {
        match provider {
            Provider::Anthropic => &self.anthropic_model,
            Provider::OpenAi => &self.openai_model,
        }
    }

    pub fn upstream_url(&self, provider: Provider) -> String {
        match provider {
            Provider::Anthropic => format!("{}/v1/messages", self.anthropic_base_url),
            Provider::OpenAi => format!("{}/v1/chat/completions", self.openai_base_url),
        }
    }

    /// Bearer auth is enabled only when a non-empty token is configured.
    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref().filter(|t| !t.is_empty())
    }

    pub fn session_db_path(&self) -> PathBuf {
        match &self.session_db_path {
            Some(p) => PathBuf::from(p),
            None => data_dir().join("sessions.db"),
        }
    }
}

fn default_config_path() -> PathBuf {
    data_dir().join("config.json")
}

fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".portico")
}

fn write_default(path: &Path, config: &Config) {
    let Ok(json) = serde_json::to_string_pretty(config) else {
        return;
    };
    if let Some(parent) = path.parent() {
        if std::fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    if std::fs::write(path, json).is_ok() {
        info!(path = %path.display(), "wrote default gateway config");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parse() {
        assert_eq!(Provider::parse("openai"), Provider::OpenAi);
        assert_eq!(Provider::parse("anthropic"), Provider::Anthropic);
        assert_eq!(Provider::parse("something-else"), Provider::Anthropic);
    }

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.gateway_port, DEFAULT_PORT);
        assert_eq!(cfg.gateway_bind, "127.0.0.1");
        assert_eq!(cfg.default_provider(), Provider::Anthropic);
        assert!(cfg.auth_token().is_none());
    }

    #[test]
    fn empty_auth_token_disables_auth() {
        let cfg = Config {
            auth_token: Some(String::new()),
            ..Config::default()
        };
        assert!(cfg.auth_token().is_none());

        let cfg = Config {
            auth_token: Some("secret".into()),
            ..Config::default()
        };
        assert_eq!(cfg.auth_token(), Some("secret"));
    }

    #[test]
    fn upstream_urls() {
        let cfg = Config::default();
        assert_eq!(
            cfg.upstream_url(Provider::Anthropic),
            "https://api.anthropic.com/v1/messages"
        );
        assert_eq!(
            cfg.upstream_url(Provider::OpenAi),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn parse_partial_config() {
        let json = r#"{"gateway_port": 9000, "default_provider": "openai"}"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.gateway_port, 9000);
        assert_eq!(cfg.default_provider(), Provider::OpenAi);
        // Unspecified fields fall back to defaults
        assert_eq!(cfg.max_tokens, 4096);
    }
}
