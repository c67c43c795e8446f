//! Slack listener: posts the summary line of each analysis to a channel.

use super::http_client;
use crate::config::SlackConfig;
use crate::error::NotificationError;
use crate::models::{ModuleDescriptor, ModuleKind, Report, Service};
use crate::modules::{ListenerModule, Module};
use crate::report::summary_line;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Serialize)]
struct PostMessage<'a> {
    channel: &'a str,
    text: &'a str,
}

/// Web API envelope; HTTP 200 with `ok: false` is still a failure.
#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

pub struct SlackListener {
    descriptor: ModuleDescriptor,
    http: reqwest::Client,
    api_url: String,
    token: String,
    channel: String,
}

impl SlackListener {
    pub fn new(config: &SlackConfig) -> reqwest::Result<Self> {
        Ok(Self {
            descriptor: ModuleDescriptor::new(
                "slack",
                "WebGrade Slack",
                Service::new("Slack"),
                ModuleKind::Listener,
            ),
            http: http_client()?,
            api_url: config.api_url.clone(),
            token: config.token.clone(),
            channel: config.channel.clone(),
        })
    }

    fn error(&self, message: impl Into<String>) -> NotificationError {
        NotificationError::new(self.id(), message)
    }
}

impl Module for SlackListener {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl ListenerModule for SlackListener {
    async fn notify_analysis_done(&self, report: &Report) -> Result<(), NotificationError> {
        if self.token.is_empty() || self.channel.is_empty() {
            return Err(self.error("token and channel must both be configured"));
        }

        let text = summary_line(report);
        let response = self
            .http
            .post(format!("{}/chat.postMessage", self.api_url.trim_end_matches('/')))
            .bearer_auth(&self.token)
            .json(&PostMessage {
                channel: &self.channel,
                text: &text,
            })
            .send()
            .await
            .map_err(|e| self.error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.error(format!("HTTP {}", status)));
        }

        let body: SlackResponse = response
            .json()
            .await
            .map_err(|e| self.error(e.to_string()))?;
        if !body.ok {
            return Err(self.error(body.error.unwrap_or_else(|| "unknown error".to_string())));
        }

        debug!("Posted analysis of {} to Slack", report.analyzed_url());
        Ok(())
    }
}
