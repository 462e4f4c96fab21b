//! Kafka consumer for inference jobs
//!
//! Messages are dispatched to bounded concurrent tasks. Kafka offset
//! commits are cumulative per partition, so with several jobs from one
//! partition in flight a finished job cannot simply store its own offset:
//! that would implicitly acknowledge every earlier in-flight message. An
//! `OffsetTracker` keeps per-partition completion state and only the
//! contiguous low-water mark is ever stored (auto-commit then picks up the
//! stored offsets). A crash mid-job therefore leads to redelivery rather
//! than data loss, and a parse failure holds back every later offset on
//! its partition until a restart redelivers it.

use crate::config::Config;
use crate::kafka::events::InferenceJob;
use crate::processor::JobProcessor;
use crate::{Result, WorkerError};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::ClientConfig;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Consumer configuration
#[derive(Debug, Clone)]
pub struct InferenceConsumerConfig {
    pub brokers: String,
    pub topic: String,
    pub group_id: String,
    /// Maximum simultaneously processing jobs.
    pub max_in_flight: usize,
    /// Aggregate byte budget across in-flight message payloads.
    pub max_in_flight_bytes: usize,
}

impl Default for InferenceConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic: "dental.inference.jobs".to_string(),
            group_id: "inference-worker".to_string(),
            max_in_flight: 4,
            max_in_flight_bytes: 100 * 1024 * 1024,
        }
    }
}

impl InferenceConsumerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            brokers: config.kafka_brokers.clone(),
            topic: config.kafka_jobs_topic.clone(),
            group_id: config.kafka_group_id.clone(),
            max_in_flight: config.max_in_flight.max(1),
            max_in_flight_bytes: config.max_in_flight_bytes.max(1),
        }
    }
}

/// Per-partition completion bookkeeping. Storing offset N acknowledges
/// everything at or below N on that partition, so a finished job may only
/// surface an offset once every earlier delivered message has finished too.
#[derive(Default)]
struct OffsetTracker {
    partitions: Mutex<HashMap<(String, i32), PartitionState>>,
}

#[derive(Default)]
struct PartitionState {
    /// Delivered but unfinished. A message that will never finish (parse
    /// failure) stays here and holds back every later offset.
    pending: BTreeSet<i64>,
    completed: BTreeSet<i64>,
    stored: Option<i64>,
}

impl OffsetTracker {
    /// Record a delivered message before its outcome is known.
    fn track(&self, topic: &str, partition: i32, offset: i64) {
        let mut partitions = self.partitions.lock().unwrap();
        partitions
            .entry((topic.to_string(), partition))
            .or_default()
            .pending
            .insert(offset);
    }

    /// Mark one message finished. Returns the new safe-to-store offset when
    /// the contiguous low-water mark advanced, `None` otherwise.
    fn complete(&self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let mut partitions = self.partitions.lock().unwrap();
        let state = partitions.get_mut(&(topic.to_string(), partition))?;
        state.pending.remove(&offset);
        state.completed.insert(offset);

        let oldest_pending = state.pending.iter().next().copied();
        let watermark = match oldest_pending {
            Some(p) => state.completed.range(..p).next_back().copied(),
            None => state.completed.iter().next_back().copied(),
        }?;
        if state.stored.is_some_and(|s| watermark <= s) {
            return None;
        }
        state.stored = Some(watermark);
        state.completed = state.completed.split_off(&(watermark + 1));
        Some(watermark)
    }
}

/// Kafka consumer driving the job processor.
pub struct InferenceConsumer {
    consumer: Arc<StreamConsumer>,
    processor: Arc<JobProcessor>,
    job_slots: Arc<Semaphore>,
    byte_budget: Arc<Semaphore>,
    max_message_bytes: u32,
    offsets: Arc<OffsetTracker>,
    shutdown_rx: watch::Receiver<bool>,
}

impl InferenceConsumer {
    pub fn new(
        config: &InferenceConsumerConfig,
        processor: Arc<JobProcessor>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            // Offsets are stored through the tracker once a contiguous
            // prefix of jobs is done; the background auto-commit only ever
            // commits stored offsets.
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "5000")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "45000")
            .set("max.poll.interval.ms", "300000")
            .create()
            .map_err(|e| WorkerError::Queue(format!("Failed to create Kafka consumer: {e}")))?;

        consumer
            .subscribe(&[&config.topic])
            .map_err(|e| WorkerError::Queue(format!("Failed to subscribe to topic: {e}")))?;

        info!(
            brokers = %config.brokers,
            topic = %config.topic,
            group_id = %config.group_id,
            max_in_flight = config.max_in_flight,
            "Inference consumer initialized"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            processor,
            job_slots: Arc::new(Semaphore::new(config.max_in_flight)),
            byte_budget: Arc::new(Semaphore::new(config.max_in_flight_bytes)),
            max_message_bytes: config.max_in_flight_bytes.min(u32::MAX as usize) as u32,
            offsets: Arc::new(OffsetTracker::default()),
            shutdown_rx,
        })
    }

    /// Run the consumer loop until shutdown, then drain in-flight jobs.
    pub async fn run(&mut self) -> Result<()> {
        use futures::StreamExt;

        info!("Starting inference consumer loop");

        let mut message_stream = self.consumer.stream();
        let mut jobs: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping consumer");
                        break;
                    }
                }

                message = message_stream.next() => {
                    match message {
                        Some(Ok(msg)) => self.dispatch(&msg, &mut jobs).await,
                        Some(Err(e)) => {
                            // Transient broker errors; keep consuming
                            error!(error = %e, "Kafka consumer error");
                        }
                        None => {
                            warn!("Message stream ended unexpectedly");
                            break;
                        }
                    }
                }
            }

            while let Some(finished) = jobs.try_join_next() {
                if let Err(e) = finished {
                    error!(error = %e, "Job task panicked");
                }
            }
        }

        drop(message_stream);
        if !jobs.is_empty() {
            info!(in_flight = jobs.len(), "Draining in-flight jobs");
        }
        while let Some(finished) = jobs.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "Job task panicked during drain");
            }
        }

        // Flush stored offsets before exit instead of waiting on the
        // auto-commit interval
        if let Err(e) = self
            .consumer
            .commit_consumer_state(rdkafka::consumer::CommitMode::Sync)
        {
            warn!(error = %e, "Final offset commit failed");
        }

        info!("Inference consumer stopped");
        Ok(())
    }

    /// Parse one message and hand it to a bounded worker task. Waits here
    /// (not in the task) when concurrency or byte budget is exhausted, which
    /// stops the consumer from reading ahead of what it can process.
    async fn dispatch(&self, msg: &BorrowedMessage<'_>, jobs: &mut JoinSet<()>) {
        let topic = msg.topic().to_string();
        let partition = msg.partition();
        let offset = msg.offset();
        self.offsets.track(&topic, partition, offset);

        let Some(payload) = msg.payload() else {
            debug!("Empty message payload, skipping");
            self.acknowledge(&topic, partition, offset);
            return;
        };

        let job: InferenceJob = match serde_json::from_slice(payload) {
            Ok(job) => job,
            Err(e) => {
                // The offset stays pending in the tracker, which also holds
                // back every later offset on this partition; a restart
                // redelivers from the last stored offset.
                warn!(error = %e, "Failed to parse inference job, leaving unacknowledged");
                return;
            }
        };

        let payload_bytes = (payload.len() as u64).min(self.max_message_bytes as u64) as u32;
        let Ok(byte_permit) = self
            .byte_budget
            .clone()
            .acquire_many_owned(payload_bytes)
            .await
        else {
            return;
        };
        let Ok(job_slot) = self.job_slots.clone().acquire_owned().await else {
            return;
        };

        let processor = self.processor.clone();
        let consumer = self.consumer.clone();
        let offsets = self.offsets.clone();

        jobs.spawn(async move {
            let _byte_permit = byte_permit;
            let _job_slot = job_slot;

            match processor.process(&job).await {
                Ok(_outcome) => {
                    if let Some(watermark) = offsets.complete(&topic, partition, offset) {
                        if let Err(e) = consumer.store_offset(&topic, partition, watermark) {
                            warn!(exam_id = %job.exam_id, error = %e, "Failed to store offset");
                        }
                    }
                }
                Err(e) => {
                    error!(
                        exam_id = %job.exam_id,
                        error = %e,
                        "Unexpected processing error, leaving message unacknowledged"
                    );
                }
            }
        });
    }

    fn acknowledge(&self, topic: &str, partition: i32, offset: i64) {
        if let Some(watermark) = self.offsets.complete(topic, partition, offset) {
            if let Err(e) = self.consumer.store_offset(topic, partition, watermark) {
                warn!(error = %e, "Failed to store offset");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = InferenceConsumerConfig::default();
        assert_eq!(config.topic, "dental.inference.jobs");
        assert_eq!(config.group_id, "inference-worker");
        assert!(config.max_in_flight >= 1);
    }

    #[test]
    fn test_out_of_order_completion_holds_offset() {
        let tracker = OffsetTracker::default();
        tracker.track("jobs", 0, 10);
        tracker.track("jobs", 0, 11);

        // The later message finishes first; storing its offset now would
        // implicitly acknowledge the still-running earlier message
        assert_eq!(tracker.complete("jobs", 0, 11), None);
        // Once the earlier one finishes the whole prefix is safe
        assert_eq!(tracker.complete("jobs", 0, 10), Some(11));
    }

    #[test]
    fn test_unfinished_message_blocks_later_commits() {
        let tracker = OffsetTracker::default();
        // Offset 5 never completes (e.g. an unparseable payload)
        tracker.track("jobs", 0, 5);
        tracker.track("jobs", 0, 6);
        tracker.track("jobs", 0, 7);

        assert_eq!(tracker.complete("jobs", 0, 6), None);
        assert_eq!(tracker.complete("jobs", 0, 7), None);
    }

    #[test]
    fn test_partitions_tracked_independently() {
        let tracker = OffsetTracker::default();
        tracker.track("jobs", 0, 3);
        tracker.track("jobs", 1, 8);

        assert_eq!(tracker.complete("jobs", 1, 8), Some(8));
        assert_eq!(tracker.complete("jobs", 0, 3), Some(3));
    }

    #[test]
    fn test_watermark_advances_monotonically() {
        let tracker = OffsetTracker::default();
        tracker.track("jobs", 0, 1);
        tracker.track("jobs", 0, 2);
        tracker.track("jobs", 0, 3);

        assert_eq!(tracker.complete("jobs", 0, 1), Some(1));
        assert_eq!(tracker.complete("jobs", 0, 3), None);
        assert_eq!(tracker.complete("jobs", 0, 2), Some(3));
    }
}
