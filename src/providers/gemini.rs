//! Generative vision model provider
//!
//! Sends the X-ray to an OpenAI-compatible chat completions endpoint with a
//! structured prompt enumerating the requested analyses, then parses the
//! model's reply into findings. The model is asked for JSON but the parse
//! is deliberately lossy: fenced or inline JSON is tried first, then
//! keyword/regex extraction over the prose, and when nothing matches the
//! result degrades to a single image-assessment finding. The parse stage
//! never errors and never returns an empty finding list.

use super::{encode_for_upload, AnalysisProvider, UploadFormat};
use crate::analysis::{normalize_finding, RawDetection};
use crate::models::{AnalysisResult, AnalysisSummary, Finding, FindingType, Severity};
use crate::{Result, WorkerError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Generative payloads tolerate lossy compression; a smaller edge cap keeps
/// token cost down.
const MAX_EDGE: u32 = 768;

const JPEG_QUALITY: u8 = 85;

pub const METHOD: &str = "gemini";

/// Client for a generative vision model behind an OpenAI-compatible API
pub struct GenerativeVisionClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Findings shape requested from the model.
#[derive(Debug, Deserialize)]
struct StructuredReply {
    #[serde(default)]
    findings: Vec<StructuredFinding>,
    #[serde(default)]
    overall_confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Serialize)]
struct StructuredFinding {
    tooth_number: Option<serde_json::Value>,
    #[serde(alias = "type")]
    finding_type: Option<String>,
    severity: Option<String>,
    confidence: Option<f32>,
    #[serde(alias = "coordinates")]
    bbox: Option<StructuredBox>,
    description: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct StructuredBox {
    x: Option<f32>,
    y: Option<f32>,
    width: Option<f32>,
    height: Option<f32>,
}

impl GenerativeVisionClient {
    pub fn new(endpoint: String, api_key: String, model: String, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            endpoint,
            api_key,
            model,
        }
    }

    /// Build the analysis prompt enumerating the requested detections.
    fn build_prompt(detections: &[&str]) -> String {
        let task_list = detections
            .iter()
            .map(|d| format!("- {}", d.replace('_', " ")))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"You are a dental radiology assistant. Examine the attached X-ray and report findings for these analyses:
{task_list}

Use FDI tooth numbering (11-48). For each finding give the tooth number, finding type, severity (mild, moderate or severe), confidence between 0 and 1, pixel bounding box, and a one-sentence description.

Respond with JSON in this exact format:
{{
  "findings": [
    {{"tooth_number": "14", "finding_type": "caries", "severity": "moderate", "confidence": 0.85, "bbox": {{"x": 150, "y": 200, "width": 30, "height": 25}}, "description": "..."}}
  ],
  "overall_confidence": 0.8
}}

Return ONLY valid JSON, no other text."#
        )
    }
}

#[async_trait]
impl AnalysisProvider for GenerativeVisionClient {
    async fn analyze(
        &self,
        image: &DynamicImage,
        detections: &[&'static str],
    ) -> Result<AnalysisResult> {
        if self.api_key.is_empty() {
            return Err(WorkerError::Provider(
                "Generative model API key not set".to_string(),
            ));
        }

        let payload = encode_for_upload(image, MAX_EDGE, UploadFormat::Jpeg(JPEG_QUALITY)).await?;
        let data_url = format!("data:image/jpeg;base64,{}", BASE64.encode(&payload));
        debug!(payload_bytes = payload.len(), "Prepared generative payload");

        let request = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": Self::build_prompt(detections)},
                    {"type": "image_url", "image_url": {"url": data_url, "detail": "high"}}
                ]
            }],
            "max_tokens": 2000,
            "temperature": 0.1
        });

        let start = std::time::Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| WorkerError::Provider(format!("Generative API request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::Provider(format!(
                "Generative API error ({status}): {body}"
            )));
        }

        let chat: ChatResponse = response.json().await.map_err(|e| {
            WorkerError::Provider(format!("Failed to parse generative response: {e}"))
        })?;

        let text = chat
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| WorkerError::Provider("Generative response had no choices".to_string()))?;

        let created_at = Utc::now();
        let (findings, overall) = parse_reply(&text, created_at);
        let summary = AnalysisSummary::from_findings(&findings);

        info!(
            findings = findings.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "Generative analysis complete"
        );

        Ok(AnalysisResult {
            findings,
            summary,
            confidence_score: overall.unwrap_or(0.5),
            method: METHOD.to_string(),
            raw: Some(serde_json::Value::String(text)),
        })
    }

    fn name(&self) -> &'static str {
        METHOD
    }
}

/// Parse the model reply: JSON first, free-text scan second, guaranteed
/// single assessment finding last. Never empty.
pub fn parse_reply(text: &str, created_at: DateTime<Utc>) -> (Vec<Finding>, Option<f32>) {
    if let Some((findings, overall)) = parse_structured(text, created_at) {
        if !findings.is_empty() {
            return (findings, overall);
        }
    }

    let findings = parse_free_text(text, created_at);
    if !findings.is_empty() {
        return (findings, None);
    }

    warn!("No structured findings extracted from generative reply");
    (vec![assessment_finding(created_at)], None)
}

/// Extract JSON from the reply, tolerating markdown code fences.
fn parse_structured(text: &str, created_at: DateTime<Utc>) -> Option<(Vec<Finding>, Option<f32>)> {
    let json_str = if text.contains("```json") {
        text.split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(text)
    } else if text.contains("```") {
        text.split("```").nth(1).unwrap_or(text)
    } else {
        text
    };

    let reply: StructuredReply = serde_json::from_str(json_str.trim()).ok()?;

    let findings = reply
        .findings
        .into_iter()
        .map(|f| {
            let bbox = f.bbox.unwrap_or(StructuredBox {
                x: None,
                y: None,
                width: None,
                height: None,
            });
            normalize_finding(
                RawDetection {
                    tooth_number: f.tooth_number.map(|v| match v {
                        serde_json::Value::String(s) => s,
                        serde_json::Value::Number(n) => n.to_string(),
                        other => other.to_string(),
                    }),
                    finding_type: f.finding_type,
                    severity: f.severity,
                    severity_score: None,
                    confidence: f.confidence,
                    x: bbox.x,
                    y: bbox.y,
                    width: bbox.width,
                    height: bbox.height,
                    description: f.description,
                },
                created_at,
            )
        })
        .collect();

    Some((findings, reply.overall_confidence))
}

static TOOTH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\btooth\s*#?\s*(\d{1,2})\b|\b([1-8][1-8])\b").unwrap());
static PERCENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{1,3})\s*%").unwrap());

/// Keyword scan over prose. One finding per sentence that names a known
/// pathology; coordinates are never recoverable from free text.
fn parse_free_text(text: &str, created_at: DateTime<Utc>) -> Vec<Finding> {
    let mut findings = Vec::new();

    for sentence in text.split(['.', '\n']) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        let lower = sentence.to_lowercase();

        let finding_type = if lower.contains("caries")
            || lower.contains("cavity")
            || lower.contains("decay")
        {
            FindingType::Caries
        } else if lower.contains("bone loss") {
            FindingType::BoneLoss
        } else if lower.contains("calculus") || lower.contains("tartar") {
            FindingType::Calculus
        } else if lower.contains("periapical") {
            FindingType::PeriapicalRadiolucency
        } else if lower.contains("root canal") {
            FindingType::RootCanalIssue
        } else if lower.contains("restoration") || lower.contains("filling") {
            FindingType::RestorationDefect
        } else {
            continue;
        };

        let tooth_number = TOOTH_RE
            .captures(sentence)
            .and_then(|c| c.get(1).or_else(|| c.get(2)))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let severity = if lower.contains("severe")
            || lower.contains("deep")
            || lower.contains("advanced")
            || lower.contains("critical")
        {
            Severity::Severe
        } else if lower.contains("moderate") {
            Severity::Moderate
        } else {
            Severity::Mild
        };

        let confidence = PERCENT_RE
            .captures(sentence)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f32>().ok())
            .map(|p| (p / 100.0).clamp(0.0, 1.0))
            .unwrap_or(0.5);

        findings.push(Finding {
            tooth_number,
            finding_type,
            severity,
            confidence,
            bounding_box: None,
            description: sentence.to_string(),
            created_at,
        });
    }

    findings
}

/// The guaranteed degraded output: the image was assessed but no structured
/// findings could be extracted.
fn assessment_finding(created_at: DateTime<Utc>) -> Finding {
    Finding {
        tooth_number: "general".to_string(),
        finding_type: FindingType::ImageAssessment,
        severity: Severity::Info,
        confidence: 0.0,
        bounding_box: None,
        description: "Image assessed, no structured findings extracted".to_string(),
        created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_json_reply() {
        let text = r#"Here is my analysis:
```json
{"findings": [{"tooth_number": "14", "finding_type": "caries", "severity": "moderate", "confidence": 0.85, "bbox": {"x": 150, "y": 200, "width": 30, "height": 25}, "description": "Distal caries"}], "overall_confidence": 0.8}
```"#;
        let (findings, overall) = parse_reply(text, Utc::now());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].tooth_number, "14");
        assert_eq!(findings[0].finding_type, FindingType::Caries);
        assert!(findings[0].bounding_box.is_some());
        assert_eq!(overall, Some(0.8));
    }

    #[test]
    fn test_parse_free_text_reply() {
        let text = "The radiograph shows moderate caries on tooth 36 with 72% confidence. \
                    There is also severe bone loss around tooth 17.";
        let (findings, _) = parse_reply(text, Utc::now());
        assert_eq!(findings.len(), 2);

        assert_eq!(findings[0].tooth_number, "36");
        assert_eq!(findings[0].finding_type, FindingType::Caries);
        assert_eq!(findings[0].severity, Severity::Moderate);
        assert!((findings[0].confidence - 0.72).abs() < 1e-6);
        assert!(findings[0].bounding_box.is_none());

        assert_eq!(findings[1].tooth_number, "17");
        assert_eq!(findings[1].finding_type, FindingType::BoneLoss);
        assert_eq!(findings[1].severity, Severity::Severe);
    }

    #[test]
    fn test_parse_degrades_to_assessment_finding() {
        let (findings, overall) = parse_reply("The image is unremarkable.", Utc::now());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].finding_type, FindingType::ImageAssessment);
        assert_eq!(findings[0].severity, Severity::Info);
        assert!(overall.is_none());
    }

    #[test]
    fn test_parse_never_empty() {
        for text in ["", "```json\n{\"findings\": []}\n```", "no teeth here"] {
            let (findings, _) = parse_reply(text, Utc::now());
            assert!(!findings.is_empty(), "empty result for {text:?}");
        }
    }

    #[test]
    fn test_prompt_enumerates_detections() {
        let prompt = GenerativeVisionClient::build_prompt(&["caries", "bone_loss"]);
        assert!(prompt.contains("- caries"));
        assert!(prompt.contains("- bone loss"));
        assert!(prompt.contains("ONLY valid JSON"));
    }
}
