//! Console and JSON renderings of a report.

use crate::models::{RawResult, Report};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Serialized form of a report, as answered by the HTTP API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportView<'a> {
    pub analyzed_url: &'a str,
    pub date: DateTime<Utc>,
    pub grade: &'a str,
    pub normalized_grade: f64,
    /// `null` when no threshold was supplied.
    pub is_threshold_reached: Option<bool>,
    pub result: &'a RawResult,
    pub result_url: Option<&'a str>,
    pub service: ServiceView<'a>,
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceView<'a> {
    pub name: &'a str,
    pub logo: Option<&'a str>,
}

impl<'a> From<&'a Report> for ReportView<'a> {
    fn from(report: &'a Report) -> Self {
        Self {
            analyzed_url: report.analyzed_url(),
            date: report.date(),
            grade: report.grade(),
            normalized_grade: report.normalized_grade(),
            is_threshold_reached: report.is_threshold_reached(),
            result: report.raw_result(),
            result_url: report.result_url(),
            service: ServiceView {
                name: &report.service().name,
                logo: report.service().logo_url.as_deref(),
            },
            threshold: report.threshold(),
        }
    }
}

/// One-line human summary, e.g.
/// `[SSL Labs] example.com: A (90/100). View full report: https://... Your threshold is reached.`
pub fn summary_line(report: &Report) -> String {
    let mut parts = vec![format!(
        "[{}] {}: {}",
        report.service().name,
        report.analyzed_url(),
        report.display_grade()
    )];

    if let Some(url) = report.result_url() {
        parts.push(format!("View full report: {}", url));
    }

    match report.is_threshold_reached() {
        Some(true) => parts.push("Your threshold is reached".to_string()),
        Some(false) => parts.push("Your threshold is not reached".to_string()),
        None => {}
    }

    format!("{}.", parts.join(". "))
}

/// Generate a JSON report.
pub fn generate_json_report(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(&ReportView::from(report)).map_err(Into::into)
}

/// Write a JSON report to a file.
pub fn write_json_report(report: &Report, path: &Path) -> Result<()> {
    let content = generate_json_report(report)?;

    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(content.as_bytes())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReportParams, Service};
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_report(threshold: Option<f64>, result_url: Option<&str>) -> Report {
        Report::new(ReportParams {
            analyzed_url: "example.com".to_string(),
            date: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            grade: "A".to_string(),
            normalized_grade: Some(90.0),
            raw_result: json!({"endpoints": [{"grade": "A"}]}),
            result_url: result_url.map(String::from),
            service: Service::new("SSL Labs").with_logo("https://example.com/logo.png"),
            threshold,
        })
    }

    #[test]
    fn test_summary_line_without_threshold() {
        let report = create_test_report(None, None);
        assert_eq!(summary_line(&report), "[SSL Labs] example.com: A (90/100).");
    }

    #[test]
    fn test_summary_line_with_threshold_and_link() {
        let report = create_test_report(Some(95.0), Some("https://ssllabs.test/?d=example.com"));
        let line = summary_line(&report);

        assert!(line.contains("View full report: https://ssllabs.test/?d=example.com"));
        assert!(line.ends_with("Your threshold is not reached."));
    }

    #[test]
    fn test_report_view_shape() {
        let report = create_test_report(None, None);
        let value = serde_json::to_value(ReportView::from(&report)).unwrap();

        assert_eq!(value["analyzedUrl"], "example.com");
        assert_eq!(value["date"], "2024-03-01T12:00:00Z");
        assert_eq!(value["grade"], "A");
        assert_eq!(value["normalizedGrade"], 90.0);
        assert!(value["isThresholdReached"].is_null());
        assert!(value["resultUrl"].is_null());
        assert!(value["threshold"].is_null());
        assert_eq!(value["service"]["name"], "SSL Labs");
        assert_eq!(value["service"]["logo"], "https://example.com/logo.png");
        assert_eq!(value["result"]["endpoints"][0]["grade"], "A");
    }

    #[test]
    fn test_write_json_report() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.json");
        let report = create_test_report(Some(80.0), None);

        write_json_report(&report, &path).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["isThresholdReached"], true);
        assert_eq!(written["threshold"], 80.0);
    }
}
