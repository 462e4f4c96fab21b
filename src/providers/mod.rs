//! Analysis provider backends
//!
//! A provider takes a decoded X-ray plus a requested task list and returns
//! an `AnalysisResult` in the canonical schema. Three backends exist:
//! the Pearl remote vision API, a generative vision model, and a
//! deterministic network-free fallback. `Analyzer` wraps the configured
//! primary provider and guarantees a usable result by degrading to the
//! fallback on any primary failure.

pub mod fallback;
pub mod gemini;
pub mod pearl;

use crate::config::Config;
use crate::models::{AnalysisResult, AnalysisSummary};
use crate::{Result, WorkerError};
use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageOutputFormat};
use std::io::Cursor;
use std::sync::Arc;
use tracing::{info, warn};

pub use fallback::FallbackProvider;
pub use gemini::GenerativeVisionClient;
pub use pearl::PearlClient;

/// A pluggable analysis backend.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Analyze a decoded image for the given detection categories.
    async fn analyze(&self, image: &DynamicImage, detections: &[&'static str])
        -> Result<AnalysisResult>;

    /// Provider identifier, recorded on the exam row.
    fn name(&self) -> &'static str;
}

/// Full native detection set, used when the requested task list is empty or
/// entirely unrecognized.
pub const ALL_DETECTIONS: &[&str] = &[
    "caries",
    "calculus",
    "bone_loss",
    "periapical_radiolucency",
    "root_canal_deficiency",
    "restorative_discrepancy",
];

/// Map semantic task identifiers to native detection categories. Empty or
/// unmapped input falls back to the comprehensive set.
pub fn map_tasks_to_detections(tasks: &[String]) -> Vec<&'static str> {
    let mut detections = Vec::new();
    for task in tasks {
        let mapped: &[&'static str] = match task.as_str() {
            "caries_detection" => &["caries"],
            "bone_loss" => &["bone_loss"],
            "restoration_assessment" => &["restorative_discrepancy"],
            "periapical_assessment" => &["periapical_radiolucency"],
            "calculus_detection" => &["calculus"],
            "root_canal_assessment" => &["root_canal_deficiency"],
            _ => &[],
        };
        for d in mapped {
            if !detections.contains(d) {
                detections.push(*d);
            }
        }
    }

    if detections.is_empty() {
        detections.extend_from_slice(ALL_DETECTIONS);
    }
    detections
}

/// Re-encoding target for provider payloads.
#[derive(Debug, Clone, Copy)]
pub enum UploadFormat {
    /// Lossless, for providers sensitive to compression artifacts.
    Png,
    /// Lossy, for providers where payload size wins.
    Jpeg(u8),
}

/// Downscale so the longest edge does not exceed `max_edge`, convert to
/// RGB, and re-encode for upload. Runs on the blocking pool since resize
/// and encode are CPU-bound.
pub async fn encode_for_upload(
    image: &DynamicImage,
    max_edge: u32,
    format: UploadFormat,
) -> Result<Vec<u8>> {
    let image = image.clone();
    tokio::task::spawn_blocking(move || {
        let (w, h) = image.dimensions();
        let image = if w.max(h) > max_edge {
            image.resize(max_edge, max_edge, FilterType::Lanczos3)
        } else {
            image
        };
        let rgb = DynamicImage::ImageRgb8(image.to_rgb8());

        let mut buf = Vec::new();
        let mut cursor = Cursor::new(&mut buf);
        let output = match format {
            UploadFormat::Png => ImageOutputFormat::Png,
            UploadFormat::Jpeg(quality) => ImageOutputFormat::Jpeg(quality),
        };
        rgb.write_to(&mut cursor, output)
            .map_err(|e| WorkerError::Image(format!("Failed to encode upload payload: {e}")))?;
        Ok(buf)
    })
    .await
    .map_err(|e| WorkerError::Internal(format!("Image encode task panicked: {e}")))?
}

/// Primary-with-fallback analysis orchestration. `analyze` never fails:
/// a primary provider error is logged and replaced by the deterministic
/// fallback result.
pub struct Analyzer {
    primary: Option<Arc<dyn AnalysisProvider>>,
    fallback: FallbackProvider,
}

impl Analyzer {
    pub fn new(primary: Option<Arc<dyn AnalysisProvider>>) -> Self {
        Self {
            primary,
            fallback: FallbackProvider::new(),
        }
    }

    /// Select the primary provider from configuration. Unknown provider
    /// names or missing credentials leave only the fallback active.
    pub fn from_config(config: &Config) -> Self {
        let primary: Option<Arc<dyn AnalysisProvider>> = match config.analysis_provider.as_str() {
            "pearl" if !config.pearl_api_key.is_empty() => Some(Arc::new(PearlClient::new(
                config.pearl_endpoint.clone(),
                config.pearl_api_key.clone(),
                config.provider_timeout_secs,
            ))),
            "gemini" if !config.gemini_api_key.is_empty() => {
                Some(Arc::new(GenerativeVisionClient::new(
                    config.gemini_endpoint.clone(),
                    config.gemini_api_key.clone(),
                    config.gemini_model.clone(),
                    config.provider_timeout_secs,
                )))
            }
            "fallback" => None,
            other => {
                warn!(
                    provider = %other,
                    "Analysis provider unavailable or unknown, using deterministic fallback only"
                );
                None
            }
        };

        if let Some(ref p) = primary {
            info!(provider = p.name(), "Analysis provider initialized");
        }

        Self::new(primary)
    }

    /// Analyze an image for the requested task identifiers. By contract
    /// this cannot fail: provider errors degrade to the fallback result.
    pub async fn analyze(&self, image: &DynamicImage, tasks: &[String]) -> AnalysisResult {
        let detections = map_tasks_to_detections(tasks);

        let result = match &self.primary {
            Some(provider) => match provider.analyze(image, &detections).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(
                        provider = provider.name(),
                        error = %e,
                        "Provider analysis failed, degrading to fallback"
                    );
                    self.fallback.synthesize(&detections)
                }
            },
            None => self.fallback.synthesize(&detections),
        };

        finalize(result)
    }
}

/// Enforce schema invariants regardless of which backend produced the
/// result: clamped confidences and a recomputed summary.
fn finalize(mut result: AnalysisResult) -> AnalysisResult {
    for finding in &mut result.findings {
        finding.confidence = crate::analysis::clamp_confidence(finding.confidence);
    }
    result.confidence_score = crate::analysis::clamp_confidence(result.confidence_score);
    result.summary = AnalysisSummary::from_findings(&result.findings);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FindingType, Severity};

    struct FailingProvider;

    #[async_trait]
    impl AnalysisProvider for FailingProvider {
        async fn analyze(
            &self,
            _image: &DynamicImage,
            _detections: &[&'static str],
        ) -> Result<AnalysisResult> {
            Err(WorkerError::Provider("upstream unreachable".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn test_image() -> DynamicImage {
        DynamicImage::new_rgb8(64, 48)
    }

    #[test]
    fn test_task_mapping() {
        let detections =
            map_tasks_to_detections(&["caries_detection".to_string(), "bone_loss".to_string()]);
        assert_eq!(detections, vec!["caries", "bone_loss"]);
    }

    #[test]
    fn test_empty_tasks_default_to_full_set() {
        assert_eq!(map_tasks_to_detections(&[]), ALL_DETECTIONS.to_vec());
        assert_eq!(
            map_tasks_to_detections(&["not_a_task".to_string()]),
            ALL_DETECTIONS.to_vec()
        );
    }

    #[test]
    fn test_task_mapping_deduplicates() {
        let detections = map_tasks_to_detections(&[
            "caries_detection".to_string(),
            "caries_detection".to_string(),
        ]);
        assert_eq!(detections, vec!["caries"]);
    }

    #[tokio::test]
    async fn test_fallback_guarantee_on_provider_failure() {
        let analyzer = Analyzer::new(Some(Arc::new(FailingProvider)));
        let result = analyzer
            .analyze(&test_image(), &["caries_detection".to_string()])
            .await;

        assert_eq!(result.method, "deterministic_fallback");
        assert!(!result.findings.is_empty());
        assert!(result
            .findings
            .iter()
            .any(|f| f.finding_type == FindingType::Caries));
        for finding in &result.findings {
            assert!((0.0..=1.0).contains(&finding.confidence));
            assert!(matches!(
                finding.severity,
                Severity::Info | Severity::Mild | Severity::Moderate | Severity::Severe
            ));
        }
    }

    #[tokio::test]
    async fn test_summary_recomputed_after_analysis() {
        let analyzer = Analyzer::new(None);
        let result = analyzer.analyze(&test_image(), &[]).await;
        assert_eq!(result.summary.total_findings, result.findings.len());
        assert!(result.summary.total_findings > 0);
    }

    #[tokio::test]
    async fn test_encode_for_upload_downscales() {
        let image = DynamicImage::new_rgb8(2048, 1024);
        let bytes = encode_for_upload(&image, 1024, UploadFormat::Png)
            .await
            .unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (1024, 512));
    }
}
