//! Kafka integration
//!
//! - Consumer: pulls inference jobs with bounded concurrency and manual
//!   offset management
//! - Events: job message schema

pub mod consumer;
pub mod events;

pub use consumer::{InferenceConsumer, InferenceConsumerConfig};
pub use events::InferenceJob;
