//! Canonical data model for the inference pipeline
//!
//! Provider responses in any shape are normalized into these types before
//! anything downstream (overlay, persistence) sees them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of an exam. Transitions are monotonic:
/// uploaded -> processing -> completed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExamStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl ExamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExamStatus::Uploaded => "uploaded",
            ExamStatus::Processing => "processing",
            ExamStatus::Completed => "completed",
            ExamStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExamStatus::Completed | ExamStatus::Failed)
    }
}

impl FromStr for ExamStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(ExamStatus::Uploaded),
            "processing" => Ok(ExamStatus::Processing),
            "completed" => Ok(ExamStatus::Completed),
            "failed" => Ok(ExamStatus::Failed),
            other => Err(format!("unknown exam status: {other}")),
        }
    }
}

impl fmt::Display for ExamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One uploaded exam row as persisted in `dental_exams`.
#[derive(Debug, Clone)]
pub struct Exam {
    pub id: String,
    pub tenant_id: String,
    pub original_filename: String,
    pub storage_location: String,
    pub content_type: String,
    pub metadata: Option<serde_json::Value>,
    pub status: ExamStatus,
    pub uploaded_at: DateTime<Utc>,
    pub analysis_started_at: Option<DateTime<Utc>>,
    pub analysis_completed_at: Option<DateTime<Utc>>,
    pub analysis_provider: Option<String>,
    pub error_message: Option<String>,
}

/// Canonical 3-level severity scale, plus an informational sentinel for
/// findings that describe the image rather than a pathology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Mild,
    Moderate,
    Severe,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Mild => "mild",
            Severity::Moderate => "moderate",
            Severity::Severe => "severe",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Severity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Clinical finding category. Open vocabulary: providers may report types
/// outside the known set, which round-trip as `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindingType {
    Caries,
    BoneLoss,
    RestorationDefect,
    PeriapicalRadiolucency,
    Calculus,
    RootCanalIssue,
    ImageAssessment,
    Other(String),
}

impl FindingType {
    pub fn as_str(&self) -> &str {
        match self {
            FindingType::Caries => "caries",
            FindingType::BoneLoss => "bone_loss",
            FindingType::RestorationDefect => "restoration_defect",
            FindingType::PeriapicalRadiolucency => "periapical_radiolucency",
            FindingType::Calculus => "calculus",
            FindingType::RootCanalIssue => "root_canal_issue",
            FindingType::ImageAssessment => "image_assessment",
            FindingType::Other(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "caries" => FindingType::Caries,
            "bone_loss" => FindingType::BoneLoss,
            "restoration_defect" | "restorative_discrepancy" => FindingType::RestorationDefect,
            "periapical_radiolucency" => FindingType::PeriapicalRadiolucency,
            "calculus" => FindingType::Calculus,
            "root_canal_issue" | "root_canal_deficiency" => FindingType::RootCanalIssue,
            "image_assessment" => FindingType::ImageAssessment,
            other => FindingType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for FindingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel-space bounding box. Only constructed when all four fields are
/// present; detections with partial coordinates carry no box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Build from optional components; any absent field yields `None`.
    pub fn from_parts(
        x: Option<f32>,
        y: Option<f32>,
        width: Option<f32>,
        height: Option<f32>,
    ) -> Option<Self> {
        Some(Self {
            x: x?,
            y: y?,
            width: width?,
            height: height?,
        })
    }
}

/// One normalized clinical observation tied to an exam.
#[derive(Debug, Clone)]
pub struct Finding {
    /// FDI tooth identifier, or the "unknown"/"general" sentinels.
    pub tooth_number: String,
    pub finding_type: FindingType,
    pub severity: Severity,
    /// Always within [0, 1] after normalization.
    pub confidence: f32,
    pub bounding_box: Option<BoundingBox>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Aggregate statistics over one analysis run, persisted as JSON on the
/// exam row.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummary {
    pub total_findings: usize,
    pub counts_by_type: BTreeMap<String, usize>,
    pub highest_severity: Option<Severity>,
    pub mean_confidence: f32,
}

impl AnalysisSummary {
    pub fn from_findings(findings: &[Finding]) -> Self {
        let mut counts_by_type = BTreeMap::new();
        let mut highest: Option<Severity> = None;
        let mut confidence_sum = 0.0f32;

        for finding in findings {
            *counts_by_type
                .entry(finding.finding_type.as_str().to_string())
                .or_insert(0) += 1;
            highest = Some(match highest {
                Some(h) => h.max(finding.severity),
                None => finding.severity,
            });
            confidence_sum += finding.confidence;
        }

        let mean_confidence = if findings.is_empty() {
            0.0
        } else {
            confidence_sum / findings.len() as f32
        };

        Self {
            total_findings: findings.len(),
            counts_by_type,
            highest_severity: highest,
            mean_confidence,
        }
    }
}

/// The unit of work output by an analysis provider for one exam.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub findings: Vec<Finding>,
    pub summary: AnalysisSummary,
    pub confidence_score: f32,
    /// Which provider produced the result ("pearl", "gemini",
    /// "deterministic_fallback").
    pub method: String,
    /// Opaque provider payload retained for audit.
    pub raw: Option<serde_json::Value>,
}

/// Parsed `scheme://bucket/path` object location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
    pub bucket: String,
    pub object: String,
}

impl StorageLocation {
    pub fn new(bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            object: object.into(),
        }
    }

    pub fn uri(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.object)
    }
}

impl FromStr for StorageLocation {
    type Err = String;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let rest = uri
            .split_once("://")
            .map(|(_, rest)| rest)
            .ok_or_else(|| format!("invalid storage URI: {uri}"))?;
        match rest.split_once('/') {
            Some((bucket, object)) if !bucket.is_empty() && !object.is_empty() => {
                Ok(Self::new(bucket, object))
            }
            _ => Err(format!("invalid storage URI: {uri}")),
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(finding_type: FindingType, severity: Severity, confidence: f32) -> Finding {
        Finding {
            tooth_number: "14".to_string(),
            finding_type,
            severity,
            confidence,
            bounding_box: None,
            description: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ExamStatus::Uploaded,
            ExamStatus::Processing,
            ExamStatus::Completed,
            ExamStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ExamStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<ExamStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(ExamStatus::Completed.is_terminal());
        assert!(ExamStatus::Failed.is_terminal());
        assert!(!ExamStatus::Processing.is_terminal());
    }

    #[test]
    fn test_finding_type_open_vocabulary() {
        assert_eq!(FindingType::parse("caries"), FindingType::Caries);
        assert_eq!(
            FindingType::parse("restorative_discrepancy"),
            FindingType::RestorationDefect
        );
        let other = FindingType::parse("impacted_tooth");
        assert_eq!(other, FindingType::Other("impacted_tooth".to_string()));
        assert_eq!(other.as_str(), "impacted_tooth");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Severe > Severity::Moderate);
        assert!(Severity::Moderate > Severity::Mild);
        assert!(Severity::Mild > Severity::Info);
    }

    #[test]
    fn test_bounding_box_requires_all_parts() {
        assert!(BoundingBox::from_parts(Some(1.0), Some(2.0), Some(3.0), Some(4.0)).is_some());
        assert!(BoundingBox::from_parts(Some(1.0), None, Some(3.0), Some(4.0)).is_none());
    }

    #[test]
    fn test_summary_aggregates() {
        let findings = vec![
            finding(FindingType::Caries, Severity::Mild, 0.8),
            finding(FindingType::Caries, Severity::Severe, 0.6),
            finding(FindingType::BoneLoss, Severity::Moderate, 0.7),
        ];
        let summary = AnalysisSummary::from_findings(&findings);
        assert_eq!(summary.total_findings, 3);
        assert_eq!(summary.counts_by_type["caries"], 2);
        assert_eq!(summary.counts_by_type["bone_loss"], 1);
        assert_eq!(summary.highest_severity, Some(Severity::Severe));
        assert!((summary.mean_confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_summary_empty() {
        let summary = AnalysisSummary::from_findings(&[]);
        assert_eq!(summary.total_findings, 0);
        assert!(summary.highest_severity.is_none());
        assert_eq!(summary.mean_confidence, 0.0);
    }

    #[test]
    fn test_storage_location_parse() {
        let loc: StorageLocation = "gs://dental-uploads/t1/exam.png".parse().unwrap();
        assert_eq!(loc.bucket, "dental-uploads");
        assert_eq!(loc.object, "t1/exam.png");
        assert_eq!(loc.uri(), "gs://dental-uploads/t1/exam.png");

        assert!("dental-uploads/exam.png".parse::<StorageLocation>().is_err());
        assert!("gs://bucket-only".parse::<StorageLocation>().is_err());
        assert!("gs://bucket/".parse::<StorageLocation>().is_err());
    }
}
