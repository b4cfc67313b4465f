//! Configuration file support

use clubsdr_agent::AgentConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Default chat model
pub const DEFAULT_MODEL: &str = "gpt-4o";
/// Default provider
pub const DEFAULT_PROVIDER: &str = "openai";
/// Default address for `serve`
pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
/// Source recorded on ingested knowledge rows
pub const DEFAULT_SOURCE_URL: &str = "https://maringafc.com.br";

/// Configuration for clubsdr
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chat provider (openai, groq, openrouter, ollama)
    pub provider: Option<String>,
    /// Chat model id
    pub model: Option<String>,
    /// Override for the provider's base URL
    pub base_url: Option<String>,
    /// Embedding model id
    pub embedding_model: Option<String>,
    /// Per-turn deadline in seconds
    pub turn_timeout_secs: Option<u64>,
    /// TOML file with the product catalog
    pub catalog_file: Option<PathBuf>,
    /// Directory of `.txt` files searched locally when Supabase is not configured
    pub knowledge_dir: Option<PathBuf>,
    /// Directory holding saved conversations
    pub state_dir: Option<PathBuf>,
    /// Address for `serve`
    pub bind: Option<String>,
    /// Source URL stored with ingested knowledge
    pub source_url: Option<String>,
    /// API keys (alternative to environment variables)
    pub api_keys: ApiKeys,
    pub supabase: SupabaseConfig,
    /// Persona, compaction and lead extraction settings
    pub agent: AgentConfig,
}

/// API key configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeys {
    pub openai: Option<String>,
}

/// Supabase project settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupabaseConfig {
    pub url: Option<String>,
    pub key: Option<String>,
    /// Minimum similarity for a passage to be returned
    pub match_threshold: f32,
    /// Passages returned per search
    pub match_count: usize,
}

impl Default for SupabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            key: None,
            match_threshold: 0.5,
            match_count: 3,
        }
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("clubsdr")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("CLUBSDR_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file, then apply environment overrides
    pub fn load() -> Self {
        let mut config = Self::load_file();
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    fn load_file() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), "Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Secrets from the environment win over the file
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(key) = get("OPENAI_API_KEY") {
            self.api_keys.openai = Some(key);
        }
        if let Some(url) = get("SUPABASE_URL") {
            self.supabase.url = Some(url);
        }
        if let Some(key) = get("SUPABASE_KEY") {
            self.supabase.key = Some(key);
        }
    }

    /// Save config to file
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            provider: Some(DEFAULT_PROVIDER.to_string()),
            model: Some(DEFAULT_MODEL.to_string()),
            turn_timeout_secs: Some(clubsdr_agent::service::DEFAULT_TURN_TIMEOUT.as_secs()),
            ..Default::default()
        };

        default_config.save()?;
        Ok(path)
    }

    pub fn provider_name(&self) -> &str {
        self.provider.as_deref().unwrap_or(DEFAULT_PROVIDER)
    }

    pub fn model_id(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    pub fn embedding_model(&self) -> &str {
        self.embedding_model
            .as_deref()
            .unwrap_or(clubsdr_ai::providers::openai::DEFAULT_EMBEDDING_MODEL)
    }

    pub fn turn_timeout(&self) -> Duration {
        self.turn_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(clubsdr_agent::service::DEFAULT_TURN_TIMEOUT)
    }

    pub fn bind(&self) -> &str {
        self.bind.as_deref().unwrap_or(DEFAULT_BIND)
    }

    pub fn source_url(&self) -> &str {
        self.source_url.as_deref().unwrap_or(DEFAULT_SOURCE_URL)
    }

    /// Directory for saved conversations
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("clubsdr")
                .join("conversations")
        })
    }

    /// Supabase URL and key, when both are set
    pub fn supabase_credentials(&self) -> Option<(&str, &str)> {
        match (self.supabase.url.as_deref(), self.supabase.key.as_deref()) {
            (Some(url), Some(key)) if !url.is_empty() && !key.is_empty() => Some((url, key)),
            _ => None,
        }
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# clubsdr configuration file
# Place at ~/.config/clubsdr/config.toml (Linux) or set CLUBSDR_CONFIG_PATH

# Chat provider (openai, groq, openrouter, ollama)
provider = "openai"
model = "gpt-4o"
# base_url = "http://localhost:11434/v1"
embedding_model = "text-embedding-3-small"

# Seconds before a turn is abandoned
turn_timeout_secs = 60

# Plans, tickets and merchandise offered by search_products
# catalog_file = "~/.config/clubsdr/catalog.toml"

# Plain-text knowledge searched locally when Supabase is not configured
# knowledge_dir = "./data/raw"

# Where conversations are saved between turns
# state_dir = "~/.local/share/clubsdr/conversations"

# Address for `clubsdr serve`
bind = "0.0.0.0:8080"

# API keys (optional - OPENAI_API_KEY takes precedence)
[api_keys]
# openai = "sk-..."

# Vector search and lead table (SUPABASE_URL / SUPABASE_KEY take precedence)
[supabase]
# url = "https://your-project.supabase.co"
# key = "..."
match_threshold = 0.5
match_count = 3

[agent]
# Messages shown to the lead extractor
lead_window = 12
temperature = 0.7
max_tokens = 1024

[agent.persona]
agent_name = "Dogão"
club_name = "Maringá FC"

[agent.compaction]
enabled = true
# Summarise once the history holds more than this many messages
max_messages = 6
# Messages kept verbatim after a summary
keep_recent = 4
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.model_id(), "gpt-4o");
        assert_eq!(config.turn_timeout(), Duration::from_secs(60));
        assert_eq!(config.supabase.match_count, 3);
        assert_eq!(config.agent.persona.agent_name, "Dogão");
        assert_eq!(config.agent.compaction.keep_recent, 4);
        assert!(config.supabase_credentials().is_none());
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [agent.compaction]
            max_messages = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.agent.compaction.max_messages, 10);
        assert_eq!(config.agent.compaction.keep_recent, 4);
        assert_eq!(config.agent.lead_window, 12);
        assert_eq!(config.supabase.match_threshold, 0.5);
        assert_eq!(config.provider_name(), "openai");
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut config: Config = toml::from_str(
            r#"
            [api_keys]
            openai = "from-file"
            [supabase]
            url = "https://file.supabase.co"
            "#,
        )
        .unwrap();

        config.apply_overrides(|name| match name {
            "OPENAI_API_KEY" => Some("from-env".to_string()),
            "SUPABASE_KEY" => Some("service-key".to_string()),
            "SUPABASE_URL" => Some("  ".to_string()),
            _ => None,
        });

        assert_eq!(config.api_keys.openai.as_deref(), Some("from-env"));
        assert_eq!(
            config.supabase_credentials(),
            Some(("https://file.supabase.co", "service-key"))
        );
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = Config {
            model: Some("gpt-4o-mini".to_string()),
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.model_id(), "gpt-4o-mini");
        assert_eq!(parsed.agent, config.agent);
    }
}
