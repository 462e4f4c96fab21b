//! Pearl Second Opinion API integration
//!
//! Remote vision provider for dental pathology detection. Payloads are
//! downscaled and re-encoded as lossless PNG before upload; Pearl is
//! sensitive to compression artifacts.

use super::{encode_for_upload, AnalysisProvider, UploadFormat};
use crate::analysis::{normalize_finding, RawDetection};
use crate::models::{AnalysisResult, AnalysisSummary};
use crate::{Result, WorkerError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use image::DynamicImage;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

/// Longest-edge cap for Pearl payloads; 512-2048 px is the accuracy sweet
/// spot, 1024 balances accuracy against payload cost.
const MAX_EDGE: u32 = 1024;

const CONFIDENCE_THRESHOLD: f32 = 0.5;

pub const METHOD: &str = "pearl";

/// Pearl detection API client
pub struct PearlClient {
    client: Client,
    endpoint: String,
    api_key: String,
}

// ============================================
// Request types
// ============================================

#[derive(Debug, Serialize)]
struct DetectRequest<'a> {
    image_data: String,
    image_format: &'a str,
    detections: &'a [&'a str],
    confidence_threshold: f32,
    return_tooth_numbering: bool,
}

// ============================================
// Response types
// ============================================

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<PearlDetection>,
    #[serde(default)]
    overall_confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct PearlDetection {
    /// Reported as either a string or a number depending on API version.
    tooth_number: Option<serde_json::Value>,
    #[serde(rename = "type")]
    detection_type: Option<String>,
    severity: Option<String>,
    confidence: Option<f32>,
    bounding_box: Option<PearlBox>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PearlBox {
    x: Option<f32>,
    y: Option<f32>,
    width: Option<f32>,
    height: Option<f32>,
}

impl PearlClient {
    pub fn new(endpoint: String, api_key: String, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            endpoint,
            api_key,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn convert(&self, raw: serde_json::Value) -> Result<AnalysisResult> {
        let response: DetectResponse = serde_json::from_value(raw.clone())
            .map_err(|e| WorkerError::Provider(format!("Malformed Pearl response: {e}")))?;

        let created_at = Utc::now();
        let findings: Vec<_> = response
            .detections
            .into_iter()
            .map(|d| {
                let bbox = d.bounding_box.unwrap_or(PearlBox {
                    x: None,
                    y: None,
                    width: None,
                    height: None,
                });
                normalize_finding(
                    RawDetection {
                        tooth_number: d.tooth_number.map(value_to_string),
                        finding_type: d.detection_type,
                        severity: d.severity,
                        severity_score: None,
                        confidence: d.confidence,
                        x: bbox.x,
                        y: bbox.y,
                        width: bbox.width,
                        height: bbox.height,
                        description: d.description,
                    },
                    created_at,
                )
            })
            .collect();

        let summary = AnalysisSummary::from_findings(&findings);
        Ok(AnalysisResult {
            findings,
            summary,
            confidence_score: response.overall_confidence.unwrap_or(0.0),
            method: METHOD.to_string(),
            raw: Some(raw),
        })
    }
}

fn value_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[async_trait]
impl AnalysisProvider for PearlClient {
    async fn analyze(
        &self,
        image: &DynamicImage,
        detections: &[&'static str],
    ) -> Result<AnalysisResult> {
        if !self.is_configured() {
            return Err(WorkerError::Provider("Pearl API key not set".to_string()));
        }

        let payload = encode_for_upload(image, MAX_EDGE, UploadFormat::Png).await?;
        debug!(payload_bytes = payload.len(), "Prepared Pearl payload");

        let request = DetectRequest {
            image_data: BASE64.encode(&payload),
            image_format: "png",
            detections,
            confidence_threshold: CONFIDENCE_THRESHOLD,
            return_tooth_numbering: true,
        };

        let start = std::time::Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| WorkerError::Provider(format!("Pearl API request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Pearl API returned error");
            return Err(WorkerError::Provider(format!(
                "Pearl API error ({status}): {body}"
            )));
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| WorkerError::Provider(format!("Failed to parse Pearl response: {e}")))?;

        let result = self.convert(raw)?;
        info!(
            findings = result.findings.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "Pearl analysis complete"
        );
        Ok(result)
    }

    fn name(&self) -> &'static str {
        METHOD
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FindingType, Severity};
    use serde_json::json;

    fn client() -> PearlClient {
        PearlClient::new("https://example.test/detect".to_string(), "k".to_string(), 45)
    }

    #[test]
    fn test_not_configured_without_key() {
        let client = PearlClient::new(String::new(), String::new(), 45);
        assert!(!client.is_configured());
    }

    #[test]
    fn test_convert_normalizes_detections() {
        let raw = json!({
            "detections": [
                {
                    "tooth_number": 14,
                    "type": "caries",
                    "severity": "high",
                    "confidence": 1.4,
                    "bounding_box": {"x": 1.0, "y": 2.0, "width": 3.0, "height": 4.0},
                    "description": "distal lesion"
                },
                {
                    "type": "bone_loss",
                    "severity": "low",
                    "confidence": 0.6,
                    "bounding_box": {"x": 1.0, "y": 2.0, "width": 3.0}
                }
            ],
            "overall_confidence": 0.81
        });

        let result = client().convert(raw).unwrap();
        assert_eq!(result.findings.len(), 2);

        let first = &result.findings[0];
        assert_eq!(first.tooth_number, "14");
        assert_eq!(first.finding_type, FindingType::Caries);
        assert_eq!(first.severity, Severity::Severe);
        assert_eq!(first.confidence, 1.0);
        assert!(first.bounding_box.is_some());

        let second = &result.findings[1];
        assert_eq!(second.tooth_number, "unknown");
        assert!(second.bounding_box.is_none());

        assert_eq!(result.method, METHOD);
        assert!(result.raw.is_some());
    }

    #[test]
    fn test_convert_rejects_malformed_payload() {
        let raw = json!({"detections": "not-an-array"});
        assert!(client().convert(raw).is_err());
    }
}
