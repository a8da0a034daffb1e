use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::app_config::InitialOffset;
use crate::broker_config::BrokerConfig;
use crate::error::TransportError;
use crate::models::{GenerationId, GroupMember, Message, MemberId, TopicMetadata, TopicPartition};

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Opens authenticated sessions to a cluster. TLS and SASL negotiation
/// live behind this seam.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &BrokerConfig) -> TransportResult<Arc<dyn BrokerClient>>;
}

#[derive(Debug, Clone)]
pub struct JoinGroupRequest {
    pub group_id: String,
    /// `None` on the first join of a process
    pub member_id: Option<MemberId>,
    pub client_id: String,
    pub topics: Vec<String>,
    pub session_timeout: Duration,
    pub rebalance_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct JoinGroupResponse {
    pub generation: GenerationId,
    pub member_id: MemberId,
    pub leader: MemberId,
    pub members: Vec<GroupMember>,
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub partition: TopicPartition,
    /// First offset wanted
    pub offset: i64,
    pub max_messages: usize,
    /// How long the broker may hold the request when nothing is available
    pub max_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct OffsetCommitRequest {
    pub group_id: String,
    pub member_id: MemberId,
    pub generation: GenerationId,
    pub offsets: HashMap<TopicPartition, i64>,
}

/// Request/response surface of one broker connection.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn metadata(&self, topics: &[String]) -> TransportResult<Vec<TopicMetadata>>;

    // --- group membership ---
    async fn join_group(&self, request: JoinGroupRequest) -> TransportResult<JoinGroupResponse>;
    async fn heartbeat(
        &self,
        group_id: &str,
        member_id: &str,
        generation: GenerationId,
    ) -> TransportResult<()>;
    async fn leave_group(&self, group_id: &str, member_id: &str) -> TransportResult<()>;

    // --- consumption ---
    async fn fetch(&self, request: FetchRequest) -> TransportResult<Vec<Message>>;
    /// Next offset to read at the requested end of the log.
    async fn list_offset(
        &self,
        partition: &TopicPartition,
        position: InitialOffset,
    ) -> TransportResult<i64>;

    // --- offset storage ---
    async fn commit_offsets(&self, request: OffsetCommitRequest) -> TransportResult<()>;
    async fn fetch_offsets(
        &self,
        group_id: &str,
        partitions: &[TopicPartition],
    ) -> TransportResult<HashMap<TopicPartition, i64>>;

    // --- production ---
    async fn produce(
        &self,
        partition: &TopicPartition,
        key: Option<Bytes>,
        value: Bytes,
    ) -> TransportResult<i64>;

    async fn close(&self) -> TransportResult<()>;
}
