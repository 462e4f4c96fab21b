//! Exam and finding persistence
//!
//! The worker touches two tables: `dental_exams` (status, timestamps,
//! summary, error message) and `dental_findings` (one row per finding).
//! Findings are replaced wholesale on every successful run: delete-all
//! then insert, in one transaction with the status update, so re-running
//! a job can never duplicate findings.

use crate::models::{AnalysisSummary, Exam, ExamStatus, Finding};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::info;

/// Relational store capability consumed by the job processor.
#[async_trait]
pub trait ExamStore: Send + Sync {
    /// Read one exam by id.
    async fn get_exam(&self, exam_id: &str) -> Result<Option<Exam>>;

    /// Advisory transition to `processing`; records analysis start time.
    async fn mark_processing(&self, exam_id: &str) -> Result<()>;

    /// Terminal success: replace prior findings, store the summary and
    /// provider, and mark the exam `completed`. Atomic.
    async fn complete_analysis(
        &self,
        exam_id: &str,
        findings: &[Finding],
        summary: &AnalysisSummary,
        provider: &str,
    ) -> Result<()>;

    /// Terminal failure: mark the exam `failed` with the error message.
    async fn mark_failed(&self, exam_id: &str, error: &str) -> Result<()>;
}

/// Postgres-backed exam store
pub struct PgExamStore {
    pool: PgPool,
}

impl PgExamStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExamStore for PgExamStore {
    async fn get_exam(&self, exam_id: &str) -> Result<Option<Exam>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, original_filename, storage_location, content_type,
                   metadata, status, uploaded_at, analysis_started_at,
                   analysis_completed_at, analysis_provider, error_message
            FROM dental_exams
            WHERE id = $1
            "#,
        )
        .bind(exam_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.try_get("status")?;
        Ok(Some(Exam {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            original_filename: row.try_get("original_filename")?,
            storage_location: row.try_get("storage_location")?,
            content_type: row.try_get("content_type")?,
            metadata: row.try_get("metadata")?,
            status: status.parse().unwrap_or(ExamStatus::Uploaded),
            uploaded_at: row.try_get("uploaded_at")?,
            analysis_started_at: row.try_get("analysis_started_at")?,
            analysis_completed_at: row.try_get("analysis_completed_at")?,
            analysis_provider: row.try_get("analysis_provider")?,
            error_message: row.try_get("error_message")?,
        }))
    }

    async fn mark_processing(&self, exam_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dental_exams
            SET status = $1, analysis_started_at = $2
            WHERE id = $3
            "#,
        )
        .bind(ExamStatus::Processing.as_str())
        .bind(Utc::now())
        .bind(exam_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_analysis(
        &self,
        exam_id: &str,
        findings: &[Finding],
        summary: &AnalysisSummary,
        provider: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE dental_exams
            SET status = $1, analysis_completed_at = $2,
                analysis_summary = $3, analysis_provider = $4, error_message = NULL
            WHERE id = $5
            "#,
        )
        .bind(ExamStatus::Completed.as_str())
        .bind(Utc::now())
        .bind(serde_json::to_value(summary).unwrap_or_default())
        .bind(provider)
        .bind(exam_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM dental_findings WHERE exam_id = $1")
            .bind(exam_id)
            .execute(&mut *tx)
            .await?;

        for finding in findings {
            sqlx::query(
                r#"
                INSERT INTO dental_findings (
                    exam_id, tooth_number, finding_type, severity,
                    confidence, coordinates, description, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(exam_id)
            .bind(&finding.tooth_number)
            .bind(finding.finding_type.as_str())
            .bind(finding.severity.as_str())
            .bind(finding.confidence as f64)
            .bind(
                finding
                    .bounding_box
                    .map(|b| serde_json::to_value(b).unwrap_or_default()),
            )
            .bind(&finding.description)
            .bind(finding.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!(
            exam_id = %exam_id,
            findings = findings.len(),
            provider = %provider,
            "Analysis results persisted"
        );
        Ok(())
    }

    async fn mark_failed(&self, exam_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dental_exams
            SET status = $1, error_message = $2
            WHERE id = $3
            "#,
        )
        .bind(ExamStatus::Failed.as_str())
        .bind(error)
        .bind(exam_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
