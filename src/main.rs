//! Dental inference worker - main entry point
//!
//! Consumes inference jobs from Kafka, analyzes X-ray images through the
//! configured provider (with a deterministic fallback), renders annotation
//! overlays, and persists findings to Postgres and GCS.

use anyhow::Result;
use inference_worker::{
    Analyzer, Config, GcsClient, InferenceConsumer, InferenceConsumerConfig, JobProcessor,
    PgExamStore,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (required for rustls 0.23+)
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inference_worker=debug,rdkafka=warn,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    info!(
        provider = %config.analysis_provider,
        topic = %config.kafka_jobs_topic,
        max_in_flight = config.max_in_flight,
        "Starting dental inference worker"
    );

    let db_pool = sqlx::PgPool::connect(&config.database_url)
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            anyhow::anyhow!("Database connection error: {}", e)
        })?;
    info!("Database connection pool initialized");

    let store = Arc::new(GcsClient::from_config(&config).map_err(|e| {
        error!("Failed to initialize GCS client: {}", e);
        anyhow::anyhow!("GCS client error: {}", e)
    })?);

    let analyzer = Arc::new(Analyzer::from_config(&config));
    let exams = Arc::new(PgExamStore::new(db_pool));
    let processor = Arc::new(JobProcessor::new(
        store,
        exams,
        analyzer,
        config.overlays_bucket.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let consumer_config = InferenceConsumerConfig::from_config(&config);
    let mut consumer = InferenceConsumer::new(&consumer_config, processor, shutdown_rx)
        .map_err(|e| {
            error!("Failed to create Kafka consumer: {}", e);
            anyhow::anyhow!("Kafka consumer error: {}", e)
        })?;

    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer.run().await {
            error!("Kafka consumer error: {}", e);
        }
    });

    info!("Inference worker ready, listening on topic: {}", consumer_config.topic);

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, draining in-flight jobs");

    // The consumer stops pulling new messages and drains what it has
    let _ = shutdown_tx.send(true);
    if let Err(e) = consumer_handle.await {
        error!("Consumer task failed: {}", e);
    }

    info!("Inference worker stopped");
    Ok(())
}
