//! Inference job message schema
//!
//! Jobs are published by the upload API with camelCase field names. Only
//! `examId`, `tenantId` and `gcsUri` are required; everything else has a
//! sensible absent form so producer-side schema drift does not break
//! consumption.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One inference job for one exam.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceJob {
    pub exam_id: String,
    pub tenant_id: String,
    /// `gs://bucket/path` location of the uploaded X-ray.
    pub gcs_uri: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub original_filename: Option<String>,
    /// Requested analysis tasks; empty means "run everything".
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_full_job() {
        let payload = r#"{
            "examId": "ex_1",
            "tenantId": "clinic-7",
            "gcsUri": "gs://dental-uploads/clinic-7/ex_1.png",
            "contentType": "image/png",
            "originalFilename": "bitewing.png",
            "tasks": ["caries_detection", "bone_loss"],
            "timestamp": "2025-03-01T12:00:00Z"
        }"#;

        let job: InferenceJob = serde_json::from_str(payload).unwrap();
        assert_eq!(job.exam_id, "ex_1");
        assert_eq!(job.tenant_id, "clinic-7");
        assert_eq!(job.gcs_uri, "gs://dental-uploads/clinic-7/ex_1.png");
        assert_eq!(job.tasks, vec!["caries_detection", "bone_loss"]);
        assert!(job.timestamp.is_some());
    }

    #[test]
    fn test_deserialize_minimal_job() {
        let payload = r#"{
            "examId": "ex_2",
            "tenantId": "clinic-7",
            "gcsUri": "gs://dental-uploads/clinic-7/ex_2.png"
        }"#;

        let job: InferenceJob = serde_json::from_str(payload).unwrap();
        assert!(job.tasks.is_empty());
        assert!(job.content_type.is_none());
        assert!(job.timestamp.is_none());
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let payload = r#"{"examId": "ex_3", "tenantId": "clinic-7"}"#;
        assert!(serde_json::from_str::<InferenceJob>(payload).is_err());
    }
}
