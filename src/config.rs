//! Configuration for the inference worker
use serde::Deserialize;

/// Main configuration struct, loaded from environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Kafka broker addresses
    #[serde(default = "default_kafka_brokers")]
    pub kafka_brokers: String,

    /// Topic carrying inference job messages
    #[serde(default = "default_kafka_topic")]
    pub kafka_jobs_topic: String,

    /// Consumer group id
    #[serde(default = "default_group_id")]
    pub kafka_group_id: String,

    /// Maximum simultaneous in-flight jobs (1-10 is the expected range)
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Maximum aggregate bytes of in-flight message payloads
    #[serde(default = "default_max_in_flight_bytes")]
    pub max_in_flight_bytes: usize,

    /// Which analysis provider to use: "pearl", "gemini" or "fallback"
    #[serde(default = "default_provider")]
    pub analysis_provider: String,

    /// Pearl API key (empty disables the provider)
    #[serde(default)]
    pub pearl_api_key: String,

    /// Pearl detection endpoint
    #[serde(default = "default_pearl_endpoint")]
    pub pearl_endpoint: String,

    /// Generative vision model API key
    #[serde(default)]
    pub gemini_api_key: String,

    /// OpenAI-compatible chat completions endpoint for the generative provider
    #[serde(default = "default_gemini_endpoint")]
    pub gemini_endpoint: String,

    /// Generative model identifier
    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,

    /// Bounded timeout for provider network calls, in seconds
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    /// Bucket receiving rendered overlay images
    #[serde(default = "default_overlays_bucket")]
    pub overlays_bucket: String,

    /// GCS service account JSON, inline
    #[serde(default)]
    pub gcs_service_account_json: Option<String>,

    /// Path to GCS service account JSON file
    #[serde(default)]
    pub gcs_service_account_json_path: Option<String>,

    /// GCS API host
    #[serde(default = "default_gcs_host")]
    pub gcs_host: String,
}

fn default_kafka_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_kafka_topic() -> String {
    "dental.inference.jobs".to_string()
}

fn default_group_id() -> String {
    "inference-worker".to_string()
}

fn default_max_in_flight() -> usize {
    4
}

fn default_max_in_flight_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_provider() -> String {
    "pearl".to_string()
}

fn default_pearl_endpoint() -> String {
    "https://api.hellopearl.com/v2/detect".to_string()
}

fn default_gemini_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_gemini_model() -> String {
    "gpt-4o".to_string()
}

fn default_provider_timeout_secs() -> u64 {
    45
}

fn default_overlays_bucket() -> String {
    "dental-overlays".to_string()
}

fn default_gcs_host() -> String {
    "storage.googleapis.com".to_string()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }
}
