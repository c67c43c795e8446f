//! Qualys SSL Labs server test.
//!
//! The API runs assessments asynchronously: `analyze?startNew=on` starts
//! one, then `analyze` is polled until the host status is `READY` or
//! `ERROR`. A host has one endpoint per IP address, each with its own
//! letter grade; the normalized grade is the mean over endpoints.

use super::{http_client, read_json, required_str, transport_error};
use crate::config::SsllabsConfig;
use crate::error::AnalysisError;
use crate::grade::{self, SSL_LABS_GRADES};
use crate::models::{ModuleDescriptor, ModuleKind, ProviderConfig, Report, ReportParams, Service};
use crate::modules::{AnalysisModule, Module};
use crate::polling::{AnalysisContext, JobPoller, JobStatus, PollingPolicy, PollingSession};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

const SERVICE_NAME: &str = "Qualys SSL Labs Server";

/// Host assessment as returned by `analyze`. Unknown fields are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsllabsHost {
    pub host: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// Assessment start, in milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default)]
    pub endpoints: Vec<SsllabsEndpoint>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsllabsEndpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Missing when the endpoint could not be assessed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SsllabsHost {
    /// Mean normalized grade over endpoints; ungraded endpoints count as 0.
    pub fn normalized_grade(&self) -> f64 {
        SSL_LABS_GRADES.mean_of(
            self.endpoints
                .iter()
                .map(|endpoint| endpoint.grade.as_deref().unwrap_or("")),
        )
    }

    fn into_status(self) -> JobStatus<SsllabsHost> {
        match self.status.as_str() {
            "DNS" => return JobStatus::Dns,
            "IN_PROGRESS" => return JobStatus::InProgress,
            "READY" => {}
            "ERROR" => {
                return JobStatus::Error(format!(
                    "ERROR: {}",
                    self.status_message.as_deref().unwrap_or("unknown error")
                ))
            }
            other => {
                return JobStatus::Error(
                    self.status_message
                        .clone()
                        .unwrap_or_else(|| format!("unexpected status {}", other)),
                )
            }
        }
        JobStatus::Ready(self)
    }
}

/// Query options derived from the caller's configuration.
#[derive(Debug, Clone, PartialEq)]
struct AssessmentOptions {
    host: String,
    publish: bool,
    from_cache: bool,
    max_age: Option<u64>,
}

impl AssessmentOptions {
    fn from_config(config: &ProviderConfig) -> Result<Self, AnalysisError> {
        let host = required_str(SERVICE_NAME, config, "host")?.to_string();
        let flag = |key: &str| match config.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "on",
            _ => false,
        };

        Ok(Self {
            host,
            publish: flag("publish"),
            from_cache: flag("fromCache"),
            max_age: config.get("maxAge").and_then(Value::as_u64),
        })
    }

    fn poll_query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("host", self.host.clone()),
            ("all", "done".to_string()),
            ("publish", if self.publish { "on" } else { "off" }.to_string()),
        ]
    }

    fn submit_query(&self) -> Vec<(&'static str, String)> {
        let mut query = self.poll_query();
        if self.from_cache {
            query.push(("fromCache", "on".to_string()));
            if let Some(max_age) = self.max_age {
                query.push(("maxAge", max_age.to_string()));
            }
        } else {
            query.push(("startNew", "on".to_string()));
        }
        query
    }
}

/// Thin client over the `analyze` endpoint.
#[derive(Debug, Clone)]
struct SsllabsClient {
    http: reqwest::Client,
    api_url: String,
    email: Option<String>,
}

impl SsllabsClient {
    async fn analyze(&self, query: &[(&'static str, String)]) -> Result<SsllabsHost, AnalysisError> {
        let mut request = self
            .http
            .get(format!("{}/analyze", self.api_url.trim_end_matches('/')))
            .query(query);
        if let Some(ref email) = self.email {
            request = request.header("email", email);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(SERVICE_NAME, e))?;
        read_json(SERVICE_NAME, response).await
    }
}

struct SsllabsJob<'a> {
    client: &'a SsllabsClient,
    options: &'a AssessmentOptions,
}

#[async_trait]
impl JobPoller for SsllabsJob<'_> {
    type Output = SsllabsHost;

    fn service(&self) -> &str {
        SERVICE_NAME
    }

    async fn submit(&self) -> Result<JobStatus<SsllabsHost>, AnalysisError> {
        let host = self.client.analyze(&self.options.submit_query()).await?;
        Ok(host.into_status())
    }

    async fn poll(&self) -> Result<JobStatus<SsllabsHost>, AnalysisError> {
        let host = self.client.analyze(&self.options.poll_query()).await?;
        Ok(host.into_status())
    }
}

/// SSL Labs analysis module.
pub struct SsllabsModule {
    descriptor: ModuleDescriptor,
    client: SsllabsClient,
    analyze_url: String,
    policy: PollingPolicy,
}

impl SsllabsModule {
    pub fn new(config: &SsllabsConfig, policy: PollingPolicy) -> reqwest::Result<Self> {
        Ok(Self {
            descriptor: ModuleDescriptor::new(
                "ssllabs",
                "WebGrade SSL Labs Server",
                Service::new(SERVICE_NAME)
                    .with_logo("https://www.ssllabs.com/images/qualys-ssl-labs-logo.png"),
                ModuleKind::Analysis,
            ),
            client: SsllabsClient {
                http: http_client()?,
                api_url: config.api_url.clone(),
                email: config.email.clone(),
            },
            analyze_url: config.analyze_url.clone(),
            policy,
        })
    }

    fn build_report(
        &self,
        host: SsllabsHost,
        threshold: Option<f64>,
    ) -> Result<Report, AnalysisError> {
        let normalized = host.normalized_grade();
        let date = host
            .start_time
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        Report::new(ReportParams {
            analyzed_url: host.host.clone(),
            date,
            grade: grade::format_score(normalized),
            normalized_grade: Some(normalized),
            result_url: Some(format!("{}?d={}", self.analyze_url, host.host)),
            raw_result: host,
            service: self.descriptor.service.clone(),
            threshold,
        })
        .into_raw()
        .map_err(|e| AnalysisError::payload(SERVICE_NAME, e.to_string()))
    }
}

impl Module for SsllabsModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl AnalysisModule for SsllabsModule {
    async fn start_analysis(
        &self,
        config: &ProviderConfig,
        threshold: Option<f64>,
        ctx: &AnalysisContext,
    ) -> Result<Report, AnalysisError> {
        let options = AssessmentOptions::from_config(config)?;
        info!("Assessing {} with SSL Labs", options.host);

        let job = SsllabsJob {
            client: &self.client,
            options: &options,
        };
        let mut session = PollingSession::new(self.policy, ctx);
        let outcome = session.run(&job).await;
        debug!("SSL Labs session for {} ended {:?}", options.host, session.state());
        let completed = outcome?;
        info!(
            "SSL Labs assessment of {} ready after {} poll(s)",
            options.host, completed.attempts
        );

        self.build_report(completed.payload, threshold)
    }
}
