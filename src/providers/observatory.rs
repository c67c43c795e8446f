//! Mozilla HTTP Observatory.
//!
//! One `POST /scan?host=` runs (or returns a recent) scan synchronously.
//! The score starts at 100 and bonuses can push it past the top of the
//! scale, so it is clamped before becoming the normalized grade.

use super::{http_client, read_json, required_str, transport_error};
use crate::config::ObservatoryConfig;
use crate::error::{AnalysisError, TimeoutReason};
use crate::grade::{Normalizer, ScoreNormalizer};
use crate::models::{ModuleDescriptor, ModuleKind, ProviderConfig, Report, ReportParams, Service};
use crate::modules::{AnalysisModule, Module};
use crate::polling::AnalysisContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

const SERVICE_NAME: &str = "Mozilla Observatory";

/// Scan summary returned by the v2 API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservatoryScan {
    #[serde(default)]
    pub grade: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub scanned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details_url: Option<String>,
    /// Set instead of a grade when the scan could not run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Observatory analysis module.
pub struct ObservatoryModule {
    descriptor: ModuleDescriptor,
    http: reqwest::Client,
    api_url: String,
    analyze_url: String,
}

impl ObservatoryModule {
    pub fn new(config: &ObservatoryConfig) -> reqwest::Result<Self> {
        Ok(Self {
            descriptor: ModuleDescriptor::new(
                "observatory",
                "WebGrade Observatory",
                Service::new(SERVICE_NAME)
                    .with_logo("https://developer.mozilla.org/mdn-social-share.png"),
                ModuleKind::Analysis,
            ),
            http: http_client()?,
            api_url: config.api_url.clone(),
            analyze_url: config.analyze_url.clone(),
        })
    }

    async fn scan(&self, host: &str) -> Result<ObservatoryScan, AnalysisError> {
        let response = self
            .http
            .post(format!("{}/scan", self.api_url.trim_end_matches('/')))
            .query(&[("host", host)])
            .send()
            .await
            .map_err(|e| transport_error(SERVICE_NAME, e))?;
        read_json(SERVICE_NAME, response).await
    }

    fn build_report(
        &self,
        host: &str,
        scan: ObservatoryScan,
        threshold: Option<f64>,
    ) -> Result<Report, AnalysisError> {
        if let Some(error) = scan.error.as_deref() {
            return Err(AnalysisError::provider(SERVICE_NAME, error));
        }
        let grade = scan
            .grade
            .clone()
            .ok_or_else(|| AnalysisError::payload(SERVICE_NAME, "scan has no grade"))?;

        Report::new(ReportParams {
            analyzed_url: host.to_string(),
            date: scan.scanned_at.unwrap_or_else(Utc::now),
            grade,
            normalized_grade: scan.score.map(|score| ScoreNormalizer.normalize(&score)),
            result_url: Some(format!("{}?host={}", self.analyze_url, host)),
            raw_result: scan,
            service: self.descriptor.service.clone(),
            threshold,
        })
        .into_raw()
        .map_err(|e| AnalysisError::payload(SERVICE_NAME, e.to_string()))
    }
}

impl Module for ObservatoryModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl AnalysisModule for ObservatoryModule {
    async fn start_analysis(
        &self,
        config: &ProviderConfig,
        threshold: Option<f64>,
        ctx: &AnalysisContext,
    ) -> Result<Report, AnalysisError> {
        let host = required_str(SERVICE_NAME, config, "host")?;
        info!("Scanning {} with the Observatory", host);

        let scan = ctx
            .guard(self.scan(host))
            .await
            .map_err(|reason: TimeoutReason| AnalysisError::PollingTimeout {
                attempts: 0,
                reason,
                last_status: None,
            })??;
        debug!("Observatory scan of {}: {:?} ({:?})", host, scan.grade, scan.score);

        self.build_report(host, scan, threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn module() -> ObservatoryModule {
        ObservatoryModule::new(&ObservatoryConfig {
            enabled: true,
            api_url: "https://observatory.test/api/v2".to_string(),
            analyze_url: "https://observatory.test/analyze".to_string(),
        })
        .unwrap()
    }

    fn scan(value: Value) -> ObservatoryScan {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_build_report() {
        let scan = scan(json!({
            "id": 1,
            "grade": "B",
            "score": 95,
            "scanned_at": "2024-03-01T12:00:00Z",
            "tests_passed": 4,
            "tests_failed": 3,
            "tests_quantity": 12
        }));

        let report = module().build_report("www.website.test", scan, Some(90.0)).unwrap();
        assert_eq!(report.grade(), "B");
        assert_eq!(report.normalized_grade(), 95.0);
        assert_eq!(report.display_grade(), "B (95/100)");
        assert_eq!(report.date().to_rfc3339(), "2024-03-01T12:00:00+00:00");
        assert_eq!(
            report.result_url(),
            Some("https://observatory.test/analyze?host=www.website.test")
        );
        assert_eq!(report.is_threshold_reached(), Some(true));
        assert_eq!(report.raw_result()["tests_quantity"], 12);
    }

    #[test]
    fn test_score_above_100_is_clamped() {
        let scan = scan(json!({"grade": "A+", "score": 135}));
        let report = module().build_report("example.com", scan, None).unwrap();
        assert_eq!(report.normalized_grade(), 100.0);
    }

    #[test]
    fn test_scan_error_fails_the_analysis() {
        let scan = scan(json!({"error": "invalid-hostname", "grade": null}));
        let err = module().build_report("nope", scan, None).unwrap_err();
        assert!(matches!(err, AnalysisError::Provider { .. }));
        assert!(err.to_string().contains("invalid-hostname"));
    }

    #[tokio::test]
    async fn test_missing_host_is_rejected() {
        let err = module()
            .start_analysis(&ProviderConfig::new(), None, &AnalysisContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Config { .. }));
    }
}
