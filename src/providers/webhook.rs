//! Webhook listener: POSTs the JSON report to a configured URL.

use super::http_client;
use crate::config::WebhookConfig;
use crate::error::NotificationError;
use crate::models::{ModuleDescriptor, ModuleKind, Report, Service};
use crate::modules::{ListenerModule, Module};
use crate::report::ReportView;
use async_trait::async_trait;
use tracing::debug;

pub struct WebhookListener {
    descriptor: ModuleDescriptor,
    http: reqwest::Client,
    url: String,
}

impl WebhookListener {
    pub fn new(config: &WebhookConfig) -> reqwest::Result<Self> {
        Ok(Self {
            descriptor: ModuleDescriptor::new(
                "webhook",
                "WebGrade Webhook",
                Service::new("Webhook"),
                ModuleKind::Listener,
            ),
            http: http_client()?,
            url: config.url.clone(),
        })
    }
}

impl Module for WebhookListener {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl ListenerModule for WebhookListener {
    async fn notify_analysis_done(&self, report: &Report) -> Result<(), NotificationError> {
        if self.url.is_empty() {
            return Err(NotificationError::new(self.id(), "no url configured"));
        }

        let response = self
            .http
            .post(&self.url)
            .json(&ReportView::from(report))
            .send()
            .await
            .map_err(|e| NotificationError::new(self.id(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::new(self.id(), format!("HTTP {}", status)));
        }

        debug!("Delivered analysis of {} to {}", report.analyzed_url(), self.url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::testing::report;

    #[tokio::test]
    async fn test_missing_url_is_a_notification_error() {
        let listener = WebhookListener::new(&WebhookConfig::default()).unwrap();
        let err = listener
            .notify_analysis_done(&report("87", None))
            .await
            .unwrap_err();
        assert_eq!(err, NotificationError::new("webhook", "no url configured"));
    }
}
