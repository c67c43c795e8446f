//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::error::InputError;
use crate::models::ProviderConfig;
use crate::orchestrator::ListenerFilter;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// WebGrade - grade websites with third-party analysis services
///
/// Runs a security, performance or eco-impact analysis, turns the result
/// into a 0-100 grade and notifies the configured listeners.
///
/// Examples:
///   webgrade analyze ssllabs --config-json '{"host": "example.com"}' --threshold 80
///   webgrade analyze observatory --config-file observatory.json --except-listeners slack
///   webgrade serve --port 8080
///   webgrade modules
///   webgrade init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    ///
    /// If not specified, looks for .webgrade.toml in the current directory
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run an analysis with one analysis module
    Analyze(AnalyzeArgs),

    /// Start the HTTP API server
    Serve(ServeArgs),

    /// List the registered modules
    Modules,

    /// Generate a default .webgrade.toml configuration file
    InitConfig,
}

#[derive(clap::Args, Debug, Clone)]
pub struct AnalyzeArgs {
    /// Id of the analysis module (see `webgrade modules`)
    #[arg(value_name = "MODULE")]
    pub module: String,

    /// JSON file holding the provider configuration
    #[arg(long, value_name = "FILE", conflicts_with = "config_json")]
    pub config_file: Option<PathBuf>,

    /// Inline JSON provider configuration
    #[arg(long, value_name = "JSON")]
    pub config_json: Option<String>,

    /// Minimum normalized grade (0-100) considered a pass
    ///
    /// Exit code 2 when the analysis does not reach it.
    #[arg(short, long, value_name = "GRADE")]
    pub threshold: Option<f64>,

    /// Only notify these listeners (comma-separated ids)
    #[arg(long, value_name = "IDS", value_delimiter = ',', conflicts_with = "except_listeners")]
    pub only_listeners: Option<Vec<String>>,

    /// Notify every listener except these (comma-separated ids)
    #[arg(long, value_name = "IDS", value_delimiter = ',')]
    pub except_listeners: Option<Vec<String>>,

    /// Give up after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Also write the JSON report to this file
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on (default: from config or 3000)
    #[arg(short, long, env = "WEBGRADE_PORT")]
    pub port: Option<u16>,

    /// Allowed CORS origins (comma-separated, "*" for any)
    #[arg(long, value_name = "ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    /// Id of the server module to start
    #[arg(long, default_value = "api")]
    pub module: String,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Command::Analyze(ref analyze) = self.command {
            if analyze.config_file.is_none() && analyze.config_json.is_none() {
                return Err("One of --config-file or --config-json is required".to_string());
            }

            if let Some(threshold) = analyze.threshold {
                if !(0.0..=100.0).contains(&threshold) {
                    return Err("Threshold must be between 0 and 100".to_string());
                }
            }

            if let Some(timeout) = analyze.timeout {
                if timeout == 0 {
                    return Err("Timeout must be at least 1 second".to_string());
                }
            }

            if let Some(ref path) = analyze.config_file {
                if !path.is_file() {
                    return Err(format!("Config file does not exist: {}", path.display()));
                }
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

impl AnalyzeArgs {
    /// Provider configuration from `--config-json` or `--config-file`.
    pub fn provider_config(&self) -> anyhow::Result<ProviderConfig> {
        let raw = match (&self.config_json, &self.config_file) {
            (Some(json), _) => json.clone(),
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
                anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e)
            })?,
            (None, None) => return Err(InputError::InvalidConfig("no configuration given".into()).into()),
        };

        parse_provider_config(&raw).map_err(Into::into)
    }

    pub fn listener_filter(&self) -> Result<ListenerFilter, InputError> {
        ListenerFilter::from_options(self.only_listeners.clone(), self.except_listeners.clone())
    }
}

/// Parse a JSON object into a provider configuration.
pub fn parse_provider_config(raw: &str) -> Result<ProviderConfig, InputError> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(InputError::InvalidConfig(
            "the configuration must be a JSON object".to_string(),
        )),
        Err(e) => Err(InputError::InvalidConfig(e.to_string())),
    }
}
