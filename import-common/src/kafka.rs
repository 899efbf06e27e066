use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, ClientContext, Message, TopicPartitionList};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;
use crate::consumer::ConsumerHandle;
use crate::error::ConsumerError;

#[derive(Error, Debug)]
pub enum RecvError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to deserialize message: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("received empty payload")]
    Empty,
    #[error("failed to store offset of a skipped message: {0}")]
    Offset(#[from] OffsetError),
}

#[derive(Error, Debug)]
pub enum OffsetError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("consumer gone")]
    Gone,
}

/// Keeps a paused consumer paused across rebalances.
///
/// librdkafka forgets the pause of revoked partitions, and newly assigned ones start out
/// fetching, so every assignment received while paused is paused again right away.
struct PauseAwareContext {
    name: String,
    paused: Arc<AtomicBool>,
}

impl PauseAwareContext {
    fn partitions_to_pause<'a>(
        &self,
        rebalance: &Rebalance<'a>,
    ) -> Option<&'a TopicPartitionList> {
        match rebalance {
            Rebalance::Assign(partitions)
                if partitions.count() > 0 && self.paused.load(Ordering::SeqCst) =>
            {
                Some(*partitions)
            }
            _ => None,
        }
    }
}

impl ClientContext for PauseAwareContext {}

impl ConsumerContext for PauseAwareContext {
    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        let Some(partitions) = self.partitions_to_pause(rebalance) else {
            return;
        };

        match base_consumer.pause(partitions) {
            Ok(()) => info!(
                consumer = %self.name,
                partitions = partitions.count(),
                "paused newly assigned partitions of a paused consumer"
            ),
            Err(error) => error!(
                consumer = %self.name,
                partitions = partitions.count(),
                "failed to pause newly assigned partitions: {}",
                error
            ),
        }
    }
}

/// A consumer subscribed to a single topic, that flow control can pause and resume.
pub struct TopicConsumer {
    inner: Arc<Inner>,
    name: String,
    paused: Arc<AtomicBool>,
}

struct Inner {
    consumer: StreamConsumer<PauseAwareContext>,
    topic: String,
}

impl TopicConsumer {
    pub fn new(config: &KafkaConfig, topic: &str, name: &str) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset);

        // Offsets are stored once a message was handled, and committed in the background.
        client_config.set("enable.auto.offset.store", "false");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let paused = Arc::new(AtomicBool::new(false));
        let context = PauseAwareContext {
            name: name.to_owned(),
            paused: paused.clone(),
        };
        let consumer: StreamConsumer<PauseAwareContext> =
            client_config.create_with_context(context)?;
        consumer.subscribe(&[topic])?;

        Ok(Self {
            inner: Arc::new(Inner {
                consumer,
                topic: topic.to_owned(),
            }),
            name: name.to_owned(),
            paused,
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Receive the next message and decode its JSON payload.
    ///
    /// Messages that cannot be decoded are skipped: their offset is stored before the error is
    /// returned, so they are not delivered again.
    pub async fn json_recv<T>(&self) -> Result<(T, Offset), RecvError>
    where
        T: DeserializeOwned,
    {
        let message = self.inner.consumer.recv().await?;

        let offset = Offset {
            handle: Arc::downgrade(&self.inner),
            partition: message.partition(),
            offset: message.offset(),
        };

        let Some(payload) = message.payload() else {
            offset.store()?;
            return Err(RecvError::Empty);
        };

        match serde_json::from_slice(payload) {
            Ok(value) => Ok((value, offset)),
            Err(error) => {
                offset.store()?;
                Err(RecvError::Serde(error))
            }
        }
    }
}

impl ConsumerHandle for TopicConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn current_demand(&self) -> u64 {
        if self.paused.load(Ordering::SeqCst) {
            0
        } else {
            1
        }
    }

    // The flag flips before the broker call, so a rebalance landing in between already sees
    // the new state.
    fn pause(&self) -> Result<(), ConsumerError> {
        self.paused.store(true, Ordering::SeqCst);
        let result = self.inner.consumer.assignment().and_then(|assignment| {
            self.inner.consumer.pause(&assignment)?;
            Ok(assignment)
        });
        let assignment = match result {
            Ok(assignment) => assignment,
            Err(error) => {
                self.paused.store(false, Ordering::SeqCst);
                return Err(error.into());
            }
        };
        debug!(
            consumer = %self.name,
            partitions = assignment.count(),
            "paused consumer"
        );
        Ok(())
    }

    fn resume(&self) -> Result<(), ConsumerError> {
        self.paused.store(false, Ordering::SeqCst);
        let result = self.inner.consumer.assignment().and_then(|assignment| {
            self.inner.consumer.resume(&assignment)?;
            Ok(assignment)
        });
        let assignment = match result {
            Ok(assignment) => assignment,
            Err(error) => {
                self.paused.store(true, Ordering::SeqCst);
                return Err(error.into());
            }
        };
        debug!(
            consumer = %self.name,
            partitions = assignment.count(),
            "resumed consumer"
        );
        Ok(())
    }
}

/// The position of a received message, stored once the message was handled.
pub struct Offset {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl Offset {
    pub fn store(self) -> Result<(), OffsetError> {
        let inner = self.handle.upgrade().ok_or(OffsetError::Gone)?;
        inner
            .consumer
            .store_offset(&inner.topic, self.partition, self.offset)?;
        Ok(())
    }
}

pub async fn create_kafka_producer(config: &KafkaConfig) -> Result<FutureProducer, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka configuration: {:?}", client_config);
    let producer: FutureProducer = client_config.create()?;

    // "Ping" the Kafka brokers by requesting metadata
    match producer
        .client()
        .fetch_metadata(None, Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(producer)
}

/// Produce `payload` to `topic` and wait for the broker to acknowledge it.
pub async fn send_payload(
    producer: &FutureProducer,
    topic: &str,
    key: &str,
    payload: &[u8],
) -> Result<(), KafkaError> {
    let record = FutureRecord::to(topic).key(key).payload(payload);
    match producer.send(record, Timeout::Never).await {
        Ok(_) => Ok(()),
        Err((error, _)) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(paused: bool) -> PauseAwareContext {
        PauseAwareContext {
            name: "chunks-0".to_owned(),
            paused: Arc::new(AtomicBool::new(paused)),
        }
    }

    fn partitions(ids: &[i32]) -> TopicPartitionList {
        let mut partitions = TopicPartitionList::new();
        for id in ids {
            partitions.add_partition("chunks", *id);
        }
        partitions
    }

    #[test]
    fn test_assignment_is_paused_while_consumer_is_paused() {
        let assigned = partitions(&[0, 3]);
        let selected = context(true)
            .partitions_to_pause(&Rebalance::Assign(&assigned))
            .map(TopicPartitionList::count);
        assert_eq!(selected, Some(2));
    }

    #[test]
    fn test_assignment_is_left_alone_while_consumer_is_active() {
        let assigned = partitions(&[0, 3]);
        assert!(context(false)
            .partitions_to_pause(&Rebalance::Assign(&assigned))
            .is_none());
    }

    #[test]
    fn test_revocations_and_empty_assignments_are_ignored() {
        let paused = context(true);
        let revoked = partitions(&[1]);
        let empty = partitions(&[]);

        assert!(paused
            .partitions_to_pause(&Rebalance::Revoke(&revoked))
            .is_none());
        assert!(paused
            .partitions_to_pause(&Rebalance::Assign(&empty))
            .is_none());
    }
}
