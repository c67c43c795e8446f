//! Data models shared by every module.
//!
//! `Report` is the central entity: it is built once, after a provider's
//! analysis succeeded, and never mutated afterwards.

use crate::grade;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider-defined configuration for one analysis (option name -> value).
pub type ProviderConfig = serde_json::Map<String, serde_json::Value>;

/// Provider-defined payload of a completed analysis.
pub type RawResult = serde_json::Value;

/// The third-party service behind a module, for display purposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logo_url: None,
        }
    }

    pub fn with_logo(mut self, logo_url: impl Into<String>) -> Self {
        self.logo_url = Some(logo_url.into());
        self
    }
}

/// Capability variant a module implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Analysis,
    Listener,
    Server,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Analysis => write!(f, "analysis"),
            ModuleKind::Listener => write!(f, "listener"),
            ModuleKind::Server => write!(f, "server"),
        }
    }
}

/// Identity of a loaded module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Unique per process, e.g. `ssllabs`.
    pub id: String,
    /// Human name, e.g. `WebGrade SSL Labs Server`.
    pub name: String,
    pub service: Service,
    pub kind: ModuleKind,
}

impl ModuleDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        service: Service,
        kind: ModuleKind,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            service,
            kind,
        }
    }
}

/// Everything a provider knows when it builds a report.
#[derive(Debug, Clone)]
pub struct ReportParams<R> {
    pub analyzed_url: String,
    pub date: DateTime<Utc>,
    pub grade: String,
    /// Provider-supplied normalization. Wins over parsing `grade`.
    pub normalized_grade: Option<f64>,
    pub raw_result: R,
    pub result_url: Option<String>,
    pub service: Service,
    pub threshold: Option<f64>,
}

/// Outcome of one analysis, parameterized by the provider's payload type.
#[derive(Debug, Clone, PartialEq)]
pub struct Report<R = RawResult> {
    analyzed_url: String,
    date: DateTime<Utc>,
    grade: String,
    normalized_grade: f64,
    raw_result: R,
    result_url: Option<String>,
    service: Service,
    threshold: Option<f64>,
}

impl<R> Report<R> {
    /// Build a report. The normalized grade comes from the provider when it
    /// supplies one, else from the numeric reading of `grade`, else 0, and
    /// is always clamped into `[0, 100]`.
    pub fn new(params: ReportParams<R>) -> Self {
        let normalized_grade = params
            .normalized_grade
            .or_else(|| grade::parse_numeric(&params.grade))
            .map(grade::clamp)
            .unwrap_or(grade::MIN_GRADE);

        Self {
            analyzed_url: params.analyzed_url,
            date: params.date,
            grade: params.grade,
            normalized_grade,
            raw_result: params.raw_result,
            result_url: params.result_url,
            service: params.service,
            threshold: params.threshold,
        }
    }

    pub fn analyzed_url(&self) -> &str {
        &self.analyzed_url
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    pub fn grade(&self) -> &str {
        &self.grade
    }

    pub fn normalized_grade(&self) -> f64 {
        self.normalized_grade
    }

    pub fn raw_result(&self) -> &R {
        &self.raw_result
    }

    pub fn result_url(&self) -> Option<&str> {
        self.result_url.as_deref()
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn threshold(&self) -> Option<f64> {
        self.threshold
    }

    /// `None` without a threshold, else whether the normalized grade reaches it.
    pub fn is_threshold_reached(&self) -> Option<bool> {
        self.threshold
            .map(|threshold| self.normalized_grade >= threshold)
    }

    /// `"87/100"` when the grade is already the normalized value,
    /// `"A (90/100)"` otherwise.
    pub fn display_grade(&self) -> String {
        let normalized = grade::format_score(self.normalized_grade);
        if normalized == self.grade {
            format!("{}/100", self.grade)
        } else {
            format!("{} ({}/100)", self.grade, normalized)
        }
    }

    /// Same report bound to another threshold.
    pub fn with_threshold(self, threshold: Option<f64>) -> Self {
        Self { threshold, ..self }
    }

    /// Swap the payload, keeping every derived field.
    pub fn map_raw<T, F>(self, f: F) -> Report<T>
    where
        F: FnOnce(R) -> T,
    {
        Report {
            analyzed_url: self.analyzed_url,
            date: self.date,
            grade: self.grade,
            normalized_grade: self.normalized_grade,
            raw_result: f(self.raw_result),
            result_url: self.result_url,
            service: self.service,
            threshold: self.threshold,
        }
    }
}

impl<R: Serialize> Report<R> {
    /// Erase the payload type into the opaque `RawResult`.
    pub fn into_raw(self) -> Result<Report<RawResult>, serde_json::Error> {
        let raw = serde_json::to_value(&self.raw_result)?;
        Ok(self.map_raw(|_| raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(grade: &str, normalized: Option<f64>, threshold: Option<f64>) -> ReportParams<RawResult> {
        ReportParams {
            analyzed_url: "https://example.com".to_string(),
            date: Utc::now(),
            grade: grade.to_string(),
            normalized_grade: normalized,
            raw_result: json!({"score": 87}),
            result_url: None,
            service: Service::new("Test"),
            threshold,
        }
    }

    #[test]
    fn test_normalized_grade_defaults_from_grade() {
        let report = Report::new(params("87", None, None));
        assert_eq!(report.normalized_grade(), 87.0);
    }

    #[test]
    fn test_normalized_grade_falls_back_to_zero() {
        let report = Report::new(params("B", None, None));
        assert_eq!(report.normalized_grade(), 0.0);
    }

    #[test]
    fn test_provider_normalization_wins() {
        let report = Report::new(params("55", Some(91.0), None));
        assert_eq!(report.normalized_grade(), 91.0);
    }

    #[test]
    fn test_normalized_grade_is_clamped() {
        assert_eq!(Report::new(params("A+", Some(135.0), None)).normalized_grade(), 100.0);
        assert_eq!(Report::new(params("-4", None, None)).normalized_grade(), 0.0);
    }

    #[test]
    fn test_threshold_undefined() {
        let report = Report::new(params("87", None, None));
        assert_eq!(report.is_threshold_reached(), None);
    }

    #[test]
    fn test_threshold_comparison() {
        for (threshold, expected) in [(0.0, true), (86.0, true), (87.0, true), (90.0, false)] {
            let report = Report::new(params("87", None, Some(threshold)));
            assert_eq!(
                report.is_threshold_reached(),
                Some(report.normalized_grade() >= threshold)
            );
            assert_eq!(report.is_threshold_reached(), Some(expected));
        }
    }

    #[test]
    fn test_display_grade() {
        assert_eq!(Report::new(params("87", None, None)).display_grade(), "87/100");
        assert_eq!(Report::new(params("A", Some(90.0), None)).display_grade(), "A (90/100)");
    }

    #[test]
    fn test_into_raw_keeps_derived_fields() {
        #[derive(Serialize)]
        struct Payload {
            score: u32,
        }

        let report = Report::new(ReportParams {
            analyzed_url: "https://example.com".to_string(),
            date: Utc::now(),
            grade: "A".to_string(),
            normalized_grade: Some(90.0),
            raw_result: Payload { score: 90 },
            result_url: Some("https://example.com/report".to_string()),
            service: Service::new("Test"),
            threshold: Some(80.0),
        });

        let raw = report.into_raw().unwrap();
        assert_eq!(raw.raw_result(), &json!({"score": 90}));
        assert_eq!(raw.normalized_grade(), 90.0);
        assert_eq!(raw.result_url(), Some("https://example.com/report"));
        assert_eq!(raw.is_threshold_reached(), Some(true));
    }

    #[test]
    fn test_module_kind_display() {
        assert_eq!(ModuleKind::Analysis.to_string(), "analysis");
        assert_eq!(ModuleKind::Listener.to_string(), "listener");
    }
}
