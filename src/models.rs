use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Epoch of one stable membership within a group.
pub type GenerationId = u32;

/// Broker-assigned identity of a group member.
pub type MemberId = String;

/// A single partition of a topic
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Member id -> partitions owned by that member for one generation.
///
/// Ordered maps keep every member's independent computation printable
/// and comparable byte for byte.
pub type Assignment = BTreeMap<MemberId, Vec<TopicPartition>>;

/// Topic layout as reported by the cluster metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMetadata {
    pub name: String,
    pub partition_count: i32,
}

impl TopicMetadata {
    pub fn partitions(&self) -> impl Iterator<Item = TopicPartition> + '_ {
        (0..self.partition_count).map(move |p| TopicPartition::new(self.name.clone(), p))
    }
}

/// A message read from a partition
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Value as UTF-8, lossily
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// A message handed to the producer
#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value: value.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// One entry of the membership list returned by a completed join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub member_id: MemberId,
    pub client_id: String,
    pub topics: Vec<String>,
}

/// Builds a fresh member id the way the coordinator hands them out.
pub fn new_member_id(client_id: &str) -> MemberId {
    format!("{}-{}", client_id, Uuid::new_v4())
}
