//! Owns the Kafka client, fans partitions out to independent worker tasks, and commits offsets
//! only once every partition's accumulated reports have been written successfully.

use crate::aggregator::Aggregator;
use crate::archive_set::ArchivePathSet;
use crate::config::Config;
use crate::error::ConsumerError;
use crate::limit_checker::LimitChecker;
use crate::metrics::WorkerMetrics;
use crate::offset_tracker::{OffsetTracker, NEWEST_AVAILABLE, OLDEST_AVAILABLE};
use crate::path_parser::hour_floor;
use crate::writer::ObjectStoreWriter;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{Consumer as _, DefaultConsumerContext, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::Offset;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

#[derive(Debug, Default)]
pub struct RunOutcome {
    pub files_written: usize,
    pub offsets_committed: bool,
}

pub struct Consumer {
    kafka: Arc<StreamConsumer<DefaultConsumerContext>>,
    topic: String,
    partitions: Vec<i32>,
    offset_tracker: Arc<OffsetTracker>,
    archive_set: Arc<ArchivePathSet>,
    limit_checker: Arc<LimitChecker>,
    aggregator: Arc<dyn Aggregator>,
    writer: Arc<dyn ObjectStoreWriter>,
    metrics: Arc<WorkerMetrics>,
    consumer_timeout: Duration,
}

impl Consumer {
    pub fn new(
        config: &Config,
        aggregator: Arc<dyn Aggregator>,
        writer: Arc<dyn ObjectStoreWriter>,
        metrics: Arc<WorkerMetrics>,
    ) -> Result<Self, ConsumerError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_brokers)
            .set("group.id", &config.kafka_group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");

        if let Some(protocol) = &config.kafka_security.security_protocol {
            client_config.set("security.protocol", protocol);
        }
        if let Some(mechanism) = &config.kafka_security.sasl_mechanism {
            client_config.set("sasl.mechanism", mechanism);
        }
        if let Some(username) = &config.kafka_security.sasl_username {
            client_config.set("sasl.username", username);
        }
        if let Some(password) = &config.kafka_security.sasl_password {
            client_config.set("sasl.password", password);
        }
        if let Some(ca_location) = &config.kafka_security.ssl_ca_location {
            client_config.set("ssl.ca.location", ca_location);
        }

        let kafka: StreamConsumer<DefaultConsumerContext> = client_config.create()?;

        let metadata_timeout = Duration::from_secs(30);
        let metadata = kafka.fetch_metadata(Some(&config.kafka_topic), metadata_timeout)?;
        let topic_metadata = metadata
            .topics()
            .iter()
            .find(|t| t.name() == config.kafka_topic)
            .ok_or_else(|| ConsumerError::Commit(format!("topic {} not found", config.kafka_topic)))?;
        let partitions: Vec<i32> = topic_metadata.partitions().iter().map(|p| p.id()).collect();

        let offset_tracker = Arc::new(OffsetTracker::new());
        for &partition in &partitions {
            offset_tracker
                .track_partition(&config.kafka_topic, partition)?;
        }

        let committed = kafka.committed_offsets(
            partition_list(&config.kafka_topic, &partitions),
            metadata_timeout,
        )?;
        for element in committed.elements() {
            let seed = match element.offset() {
                Offset::Offset(offset) => offset - 1,
                _ => OLDEST_AVAILABLE,
            };
            offset_tracker.seed_offset(element.topic(), element.partition(), seed);
        }

        let limit_timestamp = hour_floor(Utc::now() + ChronoDuration::minutes(config.time_shift_minutes));
        let limit_checker = Arc::new(LimitChecker::new(limit_timestamp, config.max_records));

        Ok(Self {
            kafka: Arc::new(kafka),
            topic: config.kafka_topic.clone(),
            partitions,
            offset_tracker,
            archive_set: Arc::new(ArchivePathSet::new()),
            limit_checker,
            aggregator,
            writer,
            metrics,
            consumer_timeout: config.consumer_timeout(),
        })
    }

    /// Bounded-invocation entry point: assigns every discovered partition at its seeded offset,
    /// runs one worker task per partition, and supervises them up to `consumer_timeout`.
    pub async fn run(self: Arc<Self>) -> Result<RunOutcome, ConsumerError> {
        let assignment = partition_list_at(
            &self.topic,
            &self.partitions,
            &self.offset_tracker,
        );
        self.kafka.assign(&assignment)?;

        let mut partition_queues = HashMap::new();
        for &partition in &self.partitions {
            let queue = self
                .kafka
                .split_partition_queue(&self.topic, partition)
                .ok_or_else(|| ConsumerError::Commit(format!("no queue for partition {partition}")))?;
            partition_queues.insert(partition, queue);
        }

        // Partition queues only receive messages while the main queue is being polled; keep a
        // lightweight pump running so split queues stay fed.
        let pump_handle = {
            let kafka = self.kafka.clone();
            tokio::spawn(async move {
                loop {
                    let _ = kafka.recv().await;
                }
            })
        };

        let mut workers = JoinSet::new();
        for (partition, queue) in partition_queues {
            let consumer = self.clone();
            workers.spawn(async move { consumer.consume_partition(partition, queue).await });
        }

        let supervise = async {
            let mut first_err = None;
            while let Some(result) = workers.join_next().await {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::error!(error = %err, "partition worker failed");
                        first_err.get_or_insert(err);
                    }
                    Err(join_err) => {
                        tracing::error!(error = %join_err, "partition worker task panicked");
                    }
                }
            }
            first_err
        };

        let outcome = match tokio::time::timeout(self.consumer_timeout, supervise).await {
            Ok(Some(err)) => Err(err),
            Ok(None) => Ok(()),
            Err(_) => {
                tracing::warn!("consumer timeout elapsed; stopping without waiting for remaining partitions");
                workers.abort_all();
                Ok(())
            }
        };

        pump_handle.abort();
        outcome?;

        let file_count = self.aggregator.write_results(self.writer.as_ref()).await?;
        self.metrics.record_files_written(file_count as u64);
        self.commit_offsets().await?;

        Ok(RunOutcome {
            files_written: file_count,
            offsets_committed: true,
        })
    }

    async fn consume_partition(
        &self,
        partition: i32,
        mut queue: StreamPartitionQueue<DefaultConsumerContext>,
    ) -> Result<(), ConsumerError> {
        loop {
            if !self.limit_checker.can_consume_more() {
                return Ok(());
            }

            let message = match queue.recv().await {
                Ok(message) => message,
                Err(err) if err.rdkafka_error_code() == Some(RDKafkaErrorCode::OffsetOutOfRange) => {
                    tracing::warn!(partition, "offset out of range; reopening at beginning");
                    self.reopen_at_beginning(partition)?;
                    continue;
                }
                Err(err) => return Err(ConsumerError::Kafka(err)),
            };

            if self.handle_message(partition, &message).await? {
                return Ok(());
            }
        }
    }

    /// Returns `Ok(true)` when the worker should terminate (stop marker, limit reached).
    async fn handle_message(&self, partition: i32, message: &BorrowedMessage<'_>) -> Result<bool, ConsumerError> {
        let tracked_offset = self.offset_tracker.get_offset(&self.topic, partition).unwrap_or(NEWEST_AVAILABLE);
        if message.offset() <= tracked_offset {
            return Ok(false);
        }

        let timestamp = message
            .timestamp()
            .to_millis()
            .and_then(|ms| DateTime::from_timestamp_millis(ms))
            .unwrap_or_else(Utc::now);

        if !self.limit_checker.check_message(timestamp) {
            return Ok(true);
        }

        if is_stop_marker(message) {
            self.mark_message(partition, message.offset())?;
            return Ok(true);
        }

        self.metrics.record_consumed();

        let Some(payload) = message.payload() else {
            self.metrics.record_skipped_parse_error();
            return Ok(false);
        };

        let Some(path) = extract_path_field(payload) else {
            self.metrics.record_skipped_parse_error();
            return Ok(false);
        };

        if !self.archive_set.insert(path) {
            self.metrics.record_skipped_duplicate();
            return Ok(false);
        }

        if let Err(err) = self.aggregator.handle(payload).await {
            tracing::warn!(partition, offset = message.offset(), error = %err, "dropping unparseable report");
            self.metrics.record_skipped_parse_error();
            return Ok(false);
        }

        self.mark_message(partition, message.offset())?;
        Ok(false)
    }

    fn mark_message(&self, partition: i32, offset: i64) -> Result<(), ConsumerError> {
        self.limit_checker.message_processed();
        self.offset_tracker.record_offset(&self.topic, partition, offset)?;
        Ok(())
    }

    /// `kafka.assign` replaces the consumer's entire assignment, so this rebuilds the assignment
    /// for every partition (at its currently tracked offset) and only overrides the faulting one
    /// to `Beginning`, rather than assigning just the one partition and dropping the rest.
    fn reopen_at_beginning(&self, partition: i32) -> Result<(), ConsumerError> {
        let mut tpl = TopicPartitionList::new();
        for &candidate in &self.partitions {
            let offset = if candidate == partition {
                Offset::Beginning
            } else {
                tracked_offset_or_beginning(&self.offset_tracker, &self.topic, candidate)
            };
            tpl.add_partition_offset(&self.topic, candidate, offset)?;
        }
        self.kafka.assign(&tpl)?;
        Ok(())
    }

    /// Only partitions that actually advanced past a real, non-sentinel offset this run are
    /// committed; a partition seeded at construction but never handed a message (an empty
    /// partition, or one whose worker never got to run) still carries `OLDEST_AVAILABLE` or
    /// `NEWEST_AVAILABLE` and has nothing new to commit.
    pub async fn commit_offsets(&self) -> Result<(), ConsumerError> {
        let mut tpl = TopicPartitionList::new();
        for topic in self.offset_tracker.topics() {
            for partition in self.offset_tracker.partitions_for_topic(&topic) {
                let offset = self.offset_tracker.get_offset(&topic, partition)?;
                if offset < 0 {
                    continue;
                }
                tpl.add_partition_offset(&topic, partition, Offset::Offset(offset + 1))?;
            }
        }

        self.kafka
            .commit(&tpl, rdkafka::consumer::CommitMode::Sync)
            .map_err(|err| ConsumerError::Commit(err.to_string()))?;

        let committed_count = tpl.count() as u64;
        self.metrics.record_offsets_committed(committed_count);
        Ok(())
    }
}

fn partition_list(topic: &str, partitions: &[i32]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for &partition in partitions {
        tpl.add_partition(topic, partition);
    }
    tpl
}

fn tracked_offset_or_beginning(tracker: &OffsetTracker, topic: &str, partition: i32) -> Offset {
    match tracker.get_offset(topic, partition) {
        Ok(offset) if offset == OLDEST_AVAILABLE => Offset::Beginning,
        Ok(offset) => Offset::Offset(offset + 1),
        Err(_) => Offset::Beginning,
    }
}

fn partition_list_at(topic: &str, partitions: &[i32], tracker: &OffsetTracker) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for &partition in partitions {
        let offset = tracked_offset_or_beginning(tracker, topic, partition);
        let _ = tpl.add_partition_offset(topic, partition, offset);
    }
    tpl
}

fn is_stop_marker(message: &BorrowedMessage<'_>) -> bool {
    let Some(headers) = message.headers() else {
        return false;
    };
    headers.iter().any(|header| {
        header.key == "stop" && header.value == Some(b"true".as_slice())
    })
}

/// Cheap, tolerant extraction of the `path` field without fully deserializing the report; used
/// only for the in-run dedup check, not for validation (the aggregator does that).
fn extract_path_field(payload: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    value.get("path")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_list_at_falls_back_to_beginning_for_unseeded_partitions() {
        let tracker = OffsetTracker::new();
        tracker.track_partition("t", 0).unwrap();
        let tpl = partition_list_at("t", &[0], &tracker);
        assert_eq!(tpl.count(), 1);
    }

    #[test]
    fn tracked_offset_or_beginning_treats_oldest_available_as_beginning() {
        let tracker = OffsetTracker::new();
        tracker.track_partition("t", 0).unwrap();
        tracker.seed_offset("t", 0, OLDEST_AVAILABLE);
        assert_eq!(tracked_offset_or_beginning(&tracker, "t", 0), Offset::Beginning);
    }

    #[test]
    fn tracked_offset_or_beginning_advances_past_a_real_offset() {
        let tracker = OffsetTracker::new();
        tracker.track_partition("t", 0).unwrap();
        tracker.record_offset("t", 0, 41).unwrap();
        assert_eq!(tracked_offset_or_beginning(&tracker, "t", 0), Offset::Offset(42));
    }
}
