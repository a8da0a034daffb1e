use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::broker_config::BrokerConfig;
use crate::infra::connect_cluster;
use crate::infra::transport::{BrokerClient, Connector};
use crate::models::{ProducerRecord, TopicPartition};

/// Picks the partition a record is written to.
pub trait Partitioner: Send + Sync {
    fn partition(&self, record: &ProducerRecord, partition_count: i32) -> i32;
}

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Same key, same partition. Keyless records are spread round-robin.
#[derive(Debug, Default)]
pub struct HashPartitioner {
    next: AtomicUsize,
}

impl Partitioner for HashPartitioner {
    fn partition(&self, record: &ProducerRecord, partition_count: i32) -> i32 {
        if partition_count <= 0 {
            return 0;
        }
        match &record.key {
            // signed remainder, then flipped positive
            Some(key) => (fnv1a(key) as i32 % partition_count).abs(),
            None => (self.next.fetch_add(1, Ordering::Relaxed) % partition_count as usize) as i32,
        }
    }
}

/// Where a record landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

// ============================
// Sync Producer
// ============================

/// Blocks each send until the broker acknowledged the write.
pub struct SyncProducer {
    client: Arc<dyn BrokerClient>,
    partitioner: Box<dyn Partitioner>,
    partition_counts: Mutex<HashMap<String, i32>>,
}

impl SyncProducer {
    pub async fn connect(connector: &dyn Connector, config: &BrokerConfig) -> Result<Self> {
        info!("Initializing producer");
        let client = connect_cluster(connector, config).await?;
        info!("✓ Producer ready");
        Ok(Self::new(client))
    }

    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self::with_partitioner(client, Box::new(HashPartitioner::default()))
    }

    pub fn with_partitioner(client: Arc<dyn BrokerClient>, partitioner: Box<dyn Partitioner>) -> Self {
        Self {
            client,
            partitioner,
            partition_counts: Mutex::new(HashMap::new()),
        }
    }

    async fn partition_count(&self, topic: &str) -> Result<i32> {
        let mut counts = self.partition_counts.lock().await;
        if let Some(count) = counts.get(topic) {
            return Ok(*count);
        }

        let metadata = self
            .client
            .metadata(&[topic.to_string()])
            .await
            .with_context(|| format!("Failed to load metadata for topic '{topic}'"))?;
        let Some(count) = metadata.first().map(|m| m.partition_count) else {
            bail!("no metadata returned for topic '{topic}'");
        };
        if count <= 0 {
            bail!("topic '{topic}' has no partitions");
        }
        counts.insert(topic.to_string(), count);
        Ok(count)
    }

    pub async fn send(&self, record: ProducerRecord) -> Result<Delivery> {
        let count = self.partition_count(&record.topic).await?;
        let partition = self.partitioner.partition(&record, count);
        let tp = TopicPartition::new(record.topic.clone(), partition);

        let offset = self
            .client
            .produce(&tp, record.key, record.value)
            .await
            .with_context(|| format!("Failed to publish to {tp}"))?;

        debug!(topic = %tp.topic, partition, offset, "Record acknowledged");
        Ok(Delivery { partition, offset })
    }

    /// Sends in order and stops at the first failure.
    pub async fn send_batch(&self, records: Vec<ProducerRecord>) -> Result<Vec<Delivery>> {
        let mut deliveries = Vec::with_capacity(records.len());
        for record in records {
            deliveries.push(self.send(record).await?);
        }
        info!("Published batch of {} records", deliveries.len());
        Ok(deliveries)
    }

    pub async fn close(&self) -> Result<()> {
        self.client.close().await.context("Failed to close producer")
    }
}
