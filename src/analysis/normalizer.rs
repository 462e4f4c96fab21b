//! Finding normalization
//!
//! Coerces a raw provider detection, with any combination of missing or
//! oddly typed fields, into a schema-valid `Finding`. This stage never
//! fails: missing fields take documented defaults and out-of-range values
//! are clamped.

use crate::analysis::severity::{map_severity, map_severity_score};
use crate::models::{BoundingBox, Finding, FindingType, Severity};
use chrono::{DateTime, Utc};

/// Tooth identifier used when a provider reports none.
pub const UNKNOWN_TOOTH: &str = "unknown";

/// Provider-agnostic raw detection. Each provider client maps its own wire
/// format into this shape before normalization.
#[derive(Debug, Clone, Default)]
pub struct RawDetection {
    pub tooth_number: Option<String>,
    pub finding_type: Option<String>,
    pub severity: Option<String>,
    pub severity_score: Option<f32>,
    pub confidence: Option<f32>,
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub width: Option<f32>,
    pub height: Option<f32>,
    pub description: Option<String>,
}

/// Clamp a confidence value into [0, 1]; NaN collapses to 0.
pub fn clamp_confidence(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Normalize one raw detection into the canonical finding schema.
pub fn normalize_finding(raw: RawDetection, created_at: DateTime<Utc>) -> Finding {
    let severity = match (&raw.severity, raw.severity_score) {
        (Some(label), _) if !label.trim().is_empty() => map_severity(label),
        (_, Some(score)) => map_severity_score(score),
        _ => Severity::Mild,
    };

    let finding_type = raw
        .finding_type
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .map(FindingType::parse)
        .unwrap_or(FindingType::Other("unknown".to_string()));

    let tooth_number = raw
        .tooth_number
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN_TOOTH.to_string());

    Finding {
        tooth_number,
        finding_type,
        severity,
        confidence: clamp_confidence(raw.confidence.unwrap_or(0.0)),
        bounding_box: BoundingBox::from_parts(raw.x, raw.y, raw.width, raw.height),
        description: raw.description.unwrap_or_default(),
        created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_empty_detection() {
        let finding = normalize_finding(RawDetection::default(), Utc::now());
        assert_eq!(finding.tooth_number, "unknown");
        assert_eq!(finding.finding_type.as_str(), "unknown");
        assert_eq!(finding.severity, Severity::Mild);
        assert_eq!(finding.confidence, 0.0);
        assert!(finding.bounding_box.is_none());
        assert!(finding.description.is_empty());
    }

    #[test]
    fn test_confidence_clamped() {
        let raw = RawDetection {
            confidence: Some(1.7),
            ..Default::default()
        };
        assert_eq!(normalize_finding(raw, Utc::now()).confidence, 1.0);

        let raw = RawDetection {
            confidence: Some(-0.2),
            ..Default::default()
        };
        assert_eq!(normalize_finding(raw, Utc::now()).confidence, 0.0);

        let raw = RawDetection {
            confidence: Some(f32::NAN),
            ..Default::default()
        };
        assert_eq!(normalize_finding(raw, Utc::now()).confidence, 0.0);
    }

    #[test]
    fn test_partial_box_retained_without_coordinates() {
        let raw = RawDetection {
            finding_type: Some("caries".to_string()),
            x: Some(10.0),
            y: Some(20.0),
            width: Some(30.0),
            height: None,
            ..Default::default()
        };
        let finding = normalize_finding(raw, Utc::now());
        assert_eq!(finding.finding_type, FindingType::Caries);
        assert!(finding.bounding_box.is_none());
    }

    #[test]
    fn test_severity_label_preferred_over_score() {
        let raw = RawDetection {
            severity: Some("critical".to_string()),
            severity_score: Some(0.1),
            ..Default::default()
        };
        assert_eq!(normalize_finding(raw, Utc::now()).severity, Severity::Severe);
    }

    #[test]
    fn test_numeric_severity_score_path() {
        let raw = RawDetection {
            severity_score: Some(0.5),
            ..Default::default()
        };
        assert_eq!(
            normalize_finding(raw, Utc::now()).severity,
            Severity::Moderate
        );
    }
}
