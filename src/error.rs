//! Error taxonomy for the analysis core.
//!
//! Caller mistakes (`InputError`) are kept apart from provider failures
//! (`AnalysisError`) so transports can map them to different responses:
//! the HTTP server answers 400 for the former and 500 for the latter.

use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Malformed or unknown caller input. Never reaches a provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InputError {
    #[error("unknown analysis module: {0}")]
    UnknownAnalysisModule(String),

    #[error("unknown server module: {0}")]
    UnknownServerModule(String),

    #[error("unknown listener module(s): {}", .0.join(", "))]
    UnknownListeners(Vec<String>),

    #[error("only_listeners and except_listeners cannot be used together")]
    ConflictingListenerFilters,

    #[error("threshold must be a number between 0 and 100, got {0}")]
    InvalidThreshold(f64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("malformed request: {0}")]
    Malformed(String),
}

/// Why a bounded wait gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    /// The polling session used all of its attempts.
    MaxAttempts(u32),
    /// The caller-supplied deadline passed.
    Deadline,
    /// The caller cancelled the analysis.
    Cancelled,
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutReason::MaxAttempts(max) => {
                write!(f, "the maximum number of tries ({}) has been reached", max)
            }
            TimeoutReason::Deadline => write!(f, "the deadline has passed"),
            TimeoutReason::Cancelled => write!(f, "the analysis was cancelled"),
        }
    }
}

/// A provider could not produce a result.
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// The configuration passed input validation but the provider refused it.
    #[error("{service}: invalid configuration: {message}")]
    Config { service: String, message: String },

    #[error("{service}: request failed: {source}")]
    Transport {
        service: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service}: HTTP {status}: {body}")]
    Upstream {
        service: String,
        status: u16,
        body: String,
    },

    /// The provider reported a failed analysis.
    #[error("{service}: {message}")]
    Provider { service: String, message: String },

    #[error("{service}: unexpected response: {message}")]
    Payload { service: String, message: String },

    /// Bounded retries exhausted, deadline passed or cancelled.
    #[error("analysis timed out after {attempts} attempt(s): {reason}{}", last_status_suffix(.last_status))]
    PollingTimeout {
        attempts: u32,
        reason: TimeoutReason,
        last_status: Option<String>,
    },
}

fn last_status_suffix(last_status: &Option<String>) -> String {
    match last_status {
        Some(status) => format!(" (last status: {})", status),
        None => String::new(),
    }
}

impl AnalysisError {
    pub fn provider(service: impl Into<String>, message: impl Into<String>) -> Self {
        AnalysisError::Provider {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn config(service: impl Into<String>, message: impl Into<String>) -> Self {
        AnalysisError::Config {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn payload(service: impl Into<String>, message: impl Into<String>) -> Self {
        AnalysisError::Payload {
            service: service.into(),
            message: message.into(),
        }
    }

    /// True for the polling-timeout specialization.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AnalysisError::PollingTimeout { .. })
    }

    /// Number of poll attempts made, for timeouts.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            AnalysisError::PollingTimeout { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Whether a single poll failing this way is worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            AnalysisError::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            AnalysisError::Upstream { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// One listener failed to handle a completed analysis.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("listener {listener} failed: {message}")]
pub struct NotificationError {
    pub listener: String,
    pub message: String,
}

impl NotificationError {
    pub fn new(listener: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            listener: listener.into(),
            message: message.into(),
        }
    }
}

/// Failure of `run_analysis` when dispatching by module id.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

/// Registration step failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("module id {0} is registered twice")]
    DuplicateId(String),

    #[error("module {id} declares kind {declared} but was registered as {registered}")]
    KindMismatch {
        id: String,
        declared: String,
        registered: String,
    },
}

/// Server module failures.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
