//! Severity vocabulary mapping
//!
//! Providers report severity either as a label in their own vocabulary or as
//! a numeric score. Both are collapsed onto the canonical scale here.
//! Unrecognized input defaults to mild rather than erroring.

use crate::models::Severity;

/// Map a provider severity label onto the canonical scale.
pub fn map_severity(raw: &str) -> Severity {
    let normalized = raw.trim().to_lowercase();

    // Numeric severities come through as strings from some providers.
    if let Ok(score) = normalized.parse::<f32>() {
        return map_severity_score(score);
    }

    match normalized.as_str() {
        "critical" | "high" | "severe" | "severa" => Severity::Severe,
        "moderate" | "medium" | "moderada" => Severity::Moderate,
        "low" | "minimal" | "mild" | "leve" => Severity::Mild,
        "info" | "informational" | "none" => Severity::Info,
        _ => Severity::Mild,
    }
}

/// Map a numeric severity score in [0, 1] onto the canonical scale.
pub fn map_severity_score(score: f32) -> Severity {
    if !score.is_finite() {
        return Severity::Mild;
    }
    if score >= 0.7 {
        Severity::Severe
    } else if score >= 0.4 {
        Severity::Moderate
    } else {
        Severity::Mild
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_mapping() {
        assert_eq!(map_severity("critical"), Severity::Severe);
        assert_eq!(map_severity("HIGH"), Severity::Severe);
        assert_eq!(map_severity("medium"), Severity::Moderate);
        assert_eq!(map_severity(" moderate "), Severity::Moderate);
        assert_eq!(map_severity("low"), Severity::Mild);
        assert_eq!(map_severity("minimal"), Severity::Mild);
        assert_eq!(map_severity("informational"), Severity::Info);
    }

    #[test]
    fn test_unrecognized_defaults_to_mild() {
        assert_eq!(map_severity(""), Severity::Mild);
        assert_eq!(map_severity("catastrophic"), Severity::Mild);
    }

    #[test]
    fn test_numeric_mapping() {
        assert_eq!(map_severity_score(0.95), Severity::Severe);
        assert_eq!(map_severity_score(0.7), Severity::Severe);
        assert_eq!(map_severity_score(0.5), Severity::Moderate);
        assert_eq!(map_severity_score(0.1), Severity::Mild);
        assert_eq!(map_severity_score(f32::NAN), Severity::Mild);
    }

    #[test]
    fn test_numeric_string_mapping() {
        assert_eq!(map_severity("0.9"), Severity::Severe);
        assert_eq!(map_severity("0.5"), Severity::Moderate);
    }
}
