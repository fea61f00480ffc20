use std::{
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use core_types::Record;
use rdkafka::{
    error::KafkaError,
    producer::{
        FutureProducer,
        FutureRecord,
    },
    types::RDKafkaErrorCode,
    ClientConfig,
};

use crate::transport::{
    Transport,
    TransportError,
};

const PRODUCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Publishes batches to a topic, partitioned by `source_id` so records from
/// one source keep their relative order on the consuming side too.
pub struct MessageBusTransport {
    name: String,
    topic: String,
    producer: FutureProducer,
}

impl MessageBusTransport {
    pub fn new(name: impl Into<String>, brokers: &str, topic: impl Into<String>) -> anyhow::Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "30000")
            .create()?;
        Ok(Self {
            name: name.into(),
            topic: topic.into(),
            producer,
        })
    }
}

#[async_trait]
impl Transport for MessageBusTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_batch(&self, records: &[Arc<Record>]) -> Result<(), TransportError> {
        for record in records {
            let payload = serde_json::to_vec(record.as_ref()).map_err(|e| TransportError::Permanent(e.into()))?;
            let kafka_record = FutureRecord::to(&self.topic)
                .payload(&payload)
                .key(record.source_id.as_str());

            if let Err((e, _message)) = self.producer.send(kafka_record, PRODUCE_TIMEOUT).await {
                return Err(classify(e));
            }
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.producer.flush(PRODUCE_TIMEOUT)?;
        Ok(())
    }
}

/// Unknown topic/partition and message-too-large are the caller's fault and
/// won't resolve by retrying; broker/queue-full/timeout errors are transient.
fn classify(error: KafkaError) -> TransportError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::MsgSizeTooLarge) => {
            TransportError::Permanent(error.into())
        },
        _ => TransportError::Transient(error.into()),
    }
}
