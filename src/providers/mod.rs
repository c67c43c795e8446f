//! Concrete analysis and listener modules.
//!
//! - `ssllabs`: Qualys SSL Labs, an asynchronous job driven by a polling session.
//! - `observatory`: Mozilla Observatory, a single scan request.
//! - `slack`: posts a summary of every analysis to a Slack channel.
//! - `webhook`: POSTs the JSON report to a URL.

pub mod observatory;
pub mod slack;
pub mod ssllabs;
pub mod webhook;

pub use observatory::ObservatoryModule;
pub use slack::SlackListener;
pub use ssllabs::SsllabsModule;
pub use webhook::WebhookListener;

use crate::error::AnalysisError;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Per-request timeout for provider and listener calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP client shared by one module's requests.
fn http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("webgrade/", env!("CARGO_PKG_VERSION")))
        .build()
}

fn transport_error(service: &str, source: reqwest::Error) -> AnalysisError {
    AnalysisError::Transport {
        service: service.to_string(),
        source,
    }
}

/// Decode a provider response, mapping HTTP and parse failures.
async fn read_json<T: DeserializeOwned>(
    service: &str,
    response: reqwest::Response,
) -> Result<T, AnalysisError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AnalysisError::Upstream {
            service: service.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| transport_error(service, e))?;
    serde_json::from_slice(&bytes).map_err(|e| AnalysisError::payload(service, e.to_string()))
}

/// Required string option from a provider configuration.
fn required_str<'a>(
    service: &str,
    config: &'a crate::models::ProviderConfig,
    key: &str,
) -> Result<&'a str, AnalysisError> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AnalysisError::config(service, format!("missing \"{}\" option", key)))
}
