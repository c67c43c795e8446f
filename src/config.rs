//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.webgrade.toml` files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = ".webgrade.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Polling session settings for asynchronous providers.
    #[serde(default)]
    pub polling: PollingConfig,

    /// Analysis settings.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Analysis providers.
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Listener modules.
    #[serde(default)]
    pub listeners: ListenersConfig,
}

/// General application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

/// Polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Seconds between two status requests.
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    /// Status requests before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_interval() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    100
}

/// Analysis settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Deadline for a whole analysis, in seconds. No deadline when unset.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Threshold applied when the caller supplies none.
    #[serde(default)]
    pub threshold: Option<f64>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Origins allowed by CORS. `"*"` allows any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_port() -> u16 {
    3000
}

/// Analysis provider settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub ssllabs: SsllabsConfig,

    #[serde(default)]
    pub observatory: ObservatoryConfig,
}

/// Qualys SSL Labs settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsllabsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// API base URL.
    #[serde(default = "default_ssllabs_api_url")]
    pub api_url: String,

    /// Base URL of the human-readable report.
    #[serde(default = "default_ssllabs_analyze_url")]
    pub analyze_url: String,

    /// Registered e-mail, sent as the `email` header (required by API v4).
    #[serde(default)]
    pub email: Option<String>,
}

impl Default for SsllabsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: default_ssllabs_api_url(),
            analyze_url: default_ssllabs_analyze_url(),
            email: None,
        }
    }
}

fn default_ssllabs_api_url() -> String {
    "https://api.ssllabs.com/api/v3".to_string()
}

fn default_ssllabs_analyze_url() -> String {
    "https://www.ssllabs.com/ssltest/analyze.html".to_string()
}

/// Mozilla Observatory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservatoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// API base URL.
    #[serde(default = "default_observatory_api_url")]
    pub api_url: String,

    /// Base URL of the human-readable report.
    #[serde(default = "default_observatory_analyze_url")]
    pub analyze_url: String,
}

impl Default for ObservatoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: default_observatory_api_url(),
            analyze_url: default_observatory_analyze_url(),
        }
    }
}

fn default_observatory_api_url() -> String {
    "https://observatory-api.mdn.mozilla.net/api/v2".to_string()
}

fn default_observatory_analyze_url() -> String {
    "https://developer.mozilla.org/en-US/observatory/analyze".to_string()
}

/// Listener module settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenersConfig {
    #[serde(default)]
    pub slack: SlackConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,
}

/// Slack listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Bot token.
    #[serde(default)]
    pub token: String,

    /// Channel id to post into.
    #[serde(default)]
    pub channel: String,

    /// Web API base URL.
    #[serde(default = "default_slack_api_url")]
    pub api_url: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: String::new(),
            channel: String::new(),
            api_url: default_slack_api_url(),
        }
    }
}

fn default_slack_api_url() -> String {
    "https://slack.com/api".to_string()
}

/// Webhook listener settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,

    /// URL receiving the JSON report.
    #[serde(default)]
    pub url: String,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, and only
    /// when they were given explicitly.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if args.verbose {
            self.general.verbose = true;
        }

        match &args.command {
            crate::cli::Command::Analyze(analyze) => {
                if let Some(timeout) = analyze.timeout {
                    self.analysis.timeout_seconds = Some(timeout);
                }
            }
            crate::cli::Command::Serve(serve) => {
                if let Some(port) = serve.port {
                    self.server.port = port;
                }
                if let Some(ref origins) = serve.cors_origins {
                    self.server.cors_origins = origins.clone();
                }
            }
            _ => {}
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
