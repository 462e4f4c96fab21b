//! Job processing pipeline
//!
//! One job = one exam. The processor downloads the source image, runs the
//! analyzer, renders the annotation overlay, and persists everything. Any
//! failure after the job is accepted marks the exam `failed` with a
//! human-readable error; the job itself still completes from the queue's
//! point of view, so a poisoned exam cannot wedge the consumer.

use crate::db::ExamStore;
use crate::kafka::InferenceJob;
use crate::models::StorageLocation;
use crate::overlay;
use crate::providers::Analyzer;
use crate::storage::ObjectStore;
use crate::Result;
use image::GenericImageView;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Terminal disposition of a job. Both variants acknowledge the message;
/// the distinction only drives logging and the exam row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
}

pub struct JobProcessor {
    store: Arc<dyn ObjectStore>,
    exams: Arc<dyn ExamStore>,
    analyzer: Arc<Analyzer>,
    overlays_bucket: String,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        exams: Arc<dyn ExamStore>,
        analyzer: Arc<Analyzer>,
        overlays_bucket: impl Into<String>,
    ) -> Self {
        Self {
            store,
            exams,
            analyzer,
            overlays_bucket: overlays_bucket.into(),
        }
    }

    /// Run one job end to end. Returns `Ok` in all recoverable situations;
    /// exam-level failures are recorded on the exam row and reported as
    /// `JobOutcome::Failed`.
    pub async fn process(&self, job: &InferenceJob) -> Result<JobOutcome> {
        let started = Instant::now();
        info!(
            exam_id = %job.exam_id,
            tenant_id = %job.tenant_id,
            uri = %job.gcs_uri,
            tasks = job.tasks.len(),
            "Processing inference job"
        );

        // Advisory only. A job for an exam the API already deleted should
        // still run to its own terminal state rather than bounce forever.
        if let Err(e) = self.exams.mark_processing(&job.exam_id).await {
            warn!(exam_id = %job.exam_id, error = %e, "Could not mark exam processing");
        }

        let location: StorageLocation = match job.gcs_uri.parse() {
            Ok(loc) => loc,
            Err(e) => {
                return self.fail(job, format!("Invalid storage URI: {e}")).await;
            }
        };

        let image_bytes = match self.store.download(&location).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return self
                    .fail(job, format!("Image download failed: {e}"))
                    .await;
            }
        };

        // Decode is CPU-bound on full-size radiographs
        let decoded =
            tokio::task::spawn_blocking(move || image::load_from_memory(&image_bytes)).await;
        let image = match decoded {
            Ok(Ok(image)) => image,
            Ok(Err(e)) => {
                return self
                    .fail(job, format!("Image decode failed: {e}"))
                    .await;
            }
            Err(e) => {
                return self
                    .fail(job, format!("Image decode failed: {e}"))
                    .await;
            }
        };
        let (width, height) = image.dimensions();

        // Infallible by contract: provider errors degrade to the fallback.
        let analysis = self.analyzer.analyze(&image, &job.tasks).await;
        info!(
            exam_id = %job.exam_id,
            method = %analysis.method,
            findings = analysis.findings.len(),
            "Analysis complete"
        );

        let overlay_png =
            match overlay::render_async(width, height, analysis.findings.clone()).await {
                Ok(png) => png,
                Err(e) => {
                    return self
                        .fail(job, format!("Overlay rendering failed: {e}"))
                        .await;
                }
            };

        let overlay_location = StorageLocation::new(
            self.overlays_bucket.clone(),
            format!("{}_overlay.png", job.exam_id),
        );
        if let Err(e) = self
            .store
            .upload(&overlay_location, overlay_png.into(), "image/png")
            .await
        {
            return self
                .fail(job, format!("Overlay upload failed: {e}"))
                .await;
        }

        if let Err(e) = self
            .exams
            .complete_analysis(
                &job.exam_id,
                &analysis.findings,
                &analysis.summary,
                &analysis.method,
            )
            .await
        {
            return self
                .fail(job, format!("Persisting analysis failed: {e}"))
                .await;
        }

        info!(
            exam_id = %job.exam_id,
            overlay = %overlay_location,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Inference job completed"
        );
        Ok(JobOutcome::Completed)
    }

    /// Record a terminal failure on the exam row. A failed write here is
    /// logged and swallowed: the job still finishes as `Failed`.
    async fn fail(&self, job: &InferenceJob, message: String) -> Result<JobOutcome> {
        error!(exam_id = %job.exam_id, error = %message, "Inference job failed");
        if let Err(e) = self.exams.mark_failed(&job.exam_id, &message).await {
            error!(exam_id = %job.exam_id, error = %e, "Could not record exam failure");
        }
        Ok(JobOutcome::Failed)
    }
}
