//! Dental inference worker - asynchronous X-ray analysis pipeline
//!
//! This service provides:
//! - Durable queue consumption of inference jobs (Kafka)
//! - Pluggable analysis providers (remote vision API, generative vision model, deterministic fallback)
//! - Normalization of provider output into a canonical finding schema
//! - Annotated overlay rendering (transparent PNG)
//! - Findings and summary persistence (Postgres + object storage)

pub mod analysis;
pub mod config;
pub mod db;
pub mod kafka;
pub mod models;
pub mod overlay;
pub mod processor;
pub mod providers;
pub mod storage;

pub use config::Config;
pub use db::{ExamStore, PgExamStore};
pub use kafka::{InferenceConsumer, InferenceConsumerConfig, InferenceJob};
pub use models::{
    AnalysisResult, AnalysisSummary, BoundingBox, ExamStatus, Finding, FindingType, Severity,
    StorageLocation,
};
pub use processor::{JobOutcome, JobProcessor};
pub use providers::{AnalysisProvider, Analyzer, FallbackProvider};
pub use storage::{GcsClient, ObjectStore};

/// Worker error types
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for worker operations
pub type Result<T> = std::result::Result<T, WorkerError>;
