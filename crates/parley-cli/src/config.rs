//! Configuration file support

use parley_agent::{ContextConfig, SessionOptions, StreamingOptions};
use parley_ai::RequestConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Configuration for parley
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Provider name reported in requests
    pub provider: Option<String>,
    /// Model name reported in requests
    pub model: Option<String>,
    /// Context window in tokens; enables threshold summarization
    pub context_window: Option<u32>,
    /// Run options
    pub session: SessionOptions,
    /// Which updates a streaming run surfaces
    pub streaming: StreamingOptions,
    /// Summarization settings
    pub context: ContextConfig,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parley")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("PARLEY_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    fn parse(content: &str) -> Self {
        match toml::from_str(content) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Self::default()
            }
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
            provider: Some("scripted".to_string()),
            model: Some("replay".to_string()),
            ..Default::default()
        };

        default_config.save()?;
        Ok(path)
    }

    /// Request configuration, with the script's context window taking precedence
    pub fn request_config(&self, context_window: Option<u32>) -> RequestConfig {
        let mut config = RequestConfig::new(
            self.provider.as_deref().unwrap_or("scripted"),
            self.model.as_deref().unwrap_or("replay"),
        );
        config.context_window = context_window.or(self.context_window);
        config
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# parley configuration file
# Place at ~/.config/parley/config.toml (Linux) or set PARLEY_CONFIG_PATH

# Names reported to observers; the replay executor ignores them
provider = "scripted"
model = "replay"

# Context window in tokens (optional). When set, history is summarized
# once usage crosses context.threshold_percent.
# context_window = 200000

[session]
process_tools = true
max_turns = 8
max_tool_passes = 4
allow_parallel_tools = false

[session.retry]
max_retries = 2
initial_delay_ms = 1000
max_delay_ms = 60000
backoff_multiplier = 2.0

[streaming]
emit_deltas = true
emit_reasoning = true

[context]
enabled = true
threshold_percent = 80.0
summary_max_tokens = 4096
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.provider.as_deref(), Some("scripted"));
        assert_eq!(config.session, SessionOptions::default());
        assert_eq!(config.streaming, StreamingOptions::default());
        assert_eq!(config.context, ContextConfig::default());
        assert_eq!(config.context_window, None);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = Config::parse("[session]\nmax_turns = 3\n");
        assert_eq!(config.session.max_turns, 3);
        assert_eq!(config.session.max_tool_passes, 4);
        assert!(config.context.enabled);
    }

    #[test]
    fn test_malformed_config_falls_back() {
        let config = Config::parse("session = [");
        assert_eq!(config.session, SessionOptions::default());
    }

    #[test]
    fn test_request_config_prefers_script_window() {
        let config = Config {
            context_window: Some(1000),
            ..Default::default()
        };
        assert_eq!(config.request_config(None).context_window, Some(1000));
        assert_eq!(config.request_config(Some(50)).context_window, Some(50));
        assert_eq!(config.request_config(None).provider, "scripted");
    }
}
