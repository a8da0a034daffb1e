//! In-process cluster speaking the same request/response surface as a real
//! broker connection: topic metadata, a group coordinator with join barrier,
//! generation fencing and session expiry, broker-side offset storage, and
//! append-only partition logs with long-poll fetches.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use super::transport::{
    BrokerClient, Connector, FetchRequest, JoinGroupRequest, JoinGroupResponse,
    OffsetCommitRequest, TransportResult,
};
use crate::app_config::InitialOffset;
use crate::broker_config::BrokerConfig;
use crate::error::TransportError;
use crate::models::{
    new_member_id, GenerationId, GroupMember, Message, MemberId, TopicMetadata, TopicPartition,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct PartitionLog {
    records: Mutex<Vec<Message>>,
    appended: Notify,
}

impl PartitionLog {
    fn read(&self, offset: i64, max: usize) -> Vec<Message> {
        let records = lock(&self.records);
        let start = offset.max(0) as usize;
        records.iter().skip(start).take(max).cloned().collect()
    }

    fn len(&self) -> i64 {
        lock(&self.records).len() as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupPhase {
    Empty,
    PreparingRebalance,
    Stable,
}

struct MemberState {
    client_id: String,
    topics: Vec<String>,
    session_timeout: Duration,
    last_seen: Instant,
}

struct GroupState {
    generation: GenerationId,
    phase: GroupPhase,
    members: BTreeMap<MemberId, MemberState>,
    /// members that rejoined for the next generation
    pending: HashMap<MemberId, oneshot::Sender<JoinGroupResponse>>,
    offsets: HashMap<TopicPartition, i64>,
}

impl Default for GroupState {
    fn default() -> Self {
        Self {
            generation: 0,
            phase: GroupPhase::Empty,
            members: BTreeMap::new(),
            pending: HashMap::new(),
            offsets: HashMap::new(),
        }
    }
}

impl GroupState {
    fn begin_rebalance(&mut self) {
        if self.members.is_empty() {
            self.phase = GroupPhase::Empty;
        } else {
            self.phase = GroupPhase::PreparingRebalance;
        }
    }

    /// Drops stable members whose session ran out. Stragglers of a rebalance
    /// are handled by the join deadline instead.
    fn expire(&mut self, now: Instant) {
        if self.phase != GroupPhase::Stable {
            return;
        }
        let expired: Vec<MemberId> = self
            .members
            .iter()
            .filter(|(_, m)| now.duration_since(m.last_seen) > m.session_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for member_id in expired {
            info!(member = %member_id, generation = self.generation, "Evicting member after session timeout");
            self.members.remove(&member_id);
        }
        self.begin_rebalance();
    }

    /// Closes the join barrier once every member rejoined, or unconditionally
    /// when `force` is set, evicting whoever did not make it.
    fn try_complete(&mut self, force: bool) {
        if self.phase != GroupPhase::PreparingRebalance {
            return;
        }
        let all_joined = self.members.keys().all(|id| self.pending.contains_key(id));
        if !all_joined && !force {
            return;
        }

        let pending = &self.pending;
        self.members.retain(|id, _| pending.contains_key(id));
        if self.members.is_empty() {
            self.phase = GroupPhase::Empty;
            self.pending.clear();
            return;
        }

        self.generation += 1;
        self.phase = GroupPhase::Stable;

        let now = Instant::now();
        for member in self.members.values_mut() {
            member.last_seen = now;
        }

        let members: Vec<GroupMember> = self
            .members
            .iter()
            .map(|(id, m)| GroupMember {
                member_id: id.clone(),
                client_id: m.client_id.clone(),
                topics: m.topics.clone(),
            })
            .collect();
        let leader = members
            .first()
            .map(|m| m.member_id.clone())
            .unwrap_or_default();

        info!(generation = self.generation, members = members.len(), "Group stabilized");

        for (member_id, tx) in self.pending.drain() {
            let _ = tx.send(JoinGroupResponse {
                generation: self.generation,
                member_id,
                leader: leader.clone(),
                members: members.clone(),
            });
        }
    }
}

struct ClusterState {
    endpoints: Vec<String>,
    users: RwLock<HashMap<String, String>>,
    topics: RwLock<HashMap<String, Vec<Arc<PartitionLog>>>>,
    groups: Mutex<HashMap<String, GroupState>>,
    available: AtomicBool,
    reject_commits: AtomicBool,
    fetches: AtomicU64,
}

impl ClusterState {
    fn partition(&self, tp: &TopicPartition) -> TransportResult<Arc<PartitionLog>> {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics
            .get(&tp.topic)
            .and_then(|partitions| partitions.get(usize::try_from(tp.partition).ok()?))
            .cloned()
            .ok_or_else(|| TransportError::UnknownTopic(tp.to_string()))
    }
}

/// Handle on an in-process cluster. Clones share state.
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<ClusterState>,
}

impl MemoryCluster {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            state: Arc::new(ClusterState {
                endpoints,
                users: RwLock::new(HashMap::new()),
                topics: RwLock::new(HashMap::new()),
                groups: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                reject_commits: AtomicBool::new(false),
                fetches: AtomicU64::new(0),
            }),
        }
    }

    /// Requires SASL with these credentials on every connection.
    pub fn with_user(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.state
            .users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(username.into(), password.into());
        self
    }

    pub fn create_topic(&self, name: impl Into<String>, partitions: i32) {
        let name = name.into();
        let logs = (0..partitions.max(0))
            .map(|_| Arc::new(PartitionLog::default()))
            .collect();
        info!(topic = %name, partitions, "Created topic");
        self.state
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, logs);
    }

    /// Simulates an outage: every request fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    /// Makes offset storage reject commits.
    pub fn set_reject_commits(&self, reject: bool) {
        self.state.reject_commits.store(reject, Ordering::SeqCst);
    }

    /// Total fetch requests served so far.
    pub fn fetch_count(&self) -> u64 {
        self.state.fetches.load(Ordering::SeqCst)
    }

    pub fn committed_offset(&self, group_id: &str, tp: &TopicPartition) -> Option<i64> {
        lock(&self.state.groups)
            .get(group_id)
            .and_then(|g| g.offsets.get(tp).copied())
    }

    pub fn generation(&self, group_id: &str) -> Option<GenerationId> {
        lock(&self.state.groups).get(group_id).map(|g| g.generation)
    }

    pub fn members(&self, group_id: &str) -> Vec<MemberId> {
        lock(&self.state.groups)
            .get(group_id)
            .map(|g| g.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn high_watermark(&self, tp: &TopicPartition) -> Option<i64> {
        self.state.partition(tp).ok().map(|log| log.len())
    }
}

#[async_trait]
impl Connector for MemoryCluster {
    async fn connect(&self, config: &BrokerConfig) -> TransportResult<Arc<dyn BrokerClient>> {
        let reachable = config
            .endpoints
            .iter()
            .any(|endpoint| self.state.endpoints.contains(endpoint));
        if !reachable || !self.state.available.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable(config.endpoints.join(",")));
        }

        {
            let users = self.state.users.read().unwrap_or_else(PoisonError::into_inner);
            if !users.is_empty() {
                let credentials = config
                    .credentials
                    .as_ref()
                    .ok_or_else(|| TransportError::AuthenticationFailed("anonymous".into()))?;
                let accepted = config.tls
                    && users
                        .get(&credentials.username)
                        .map(|password| *password == credentials.password)
                        .unwrap_or(false);
                if !accepted {
                    return Err(TransportError::AuthenticationFailed(
                        credentials.username.clone(),
                    ));
                }
            }
        }

        debug!(client_id = %config.client_id, "Connection established");
        Ok(Arc::new(MemoryClient {
            cluster: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct MemoryClient {
    cluster: Arc<ClusterState>,
    closed: AtomicBool,
}

impl MemoryClient {
    fn check(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.cluster.available.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("cluster unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for MemoryClient {
    async fn metadata(&self, topics: &[String]) -> TransportResult<Vec<TopicMetadata>> {
        self.check()?;
        let known = self.cluster.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics
            .iter()
            .map(|name| {
                known
                    .get(name)
                    .map(|logs| TopicMetadata {
                        name: name.clone(),
                        partition_count: logs.len() as i32,
                    })
                    .ok_or_else(|| TransportError::UnknownTopic(name.clone()))
            })
            .collect()
    }

    async fn join_group(&self, request: JoinGroupRequest) -> TransportResult<JoinGroupResponse> {
        self.check()?;
        let group_id = request.group_id.clone();

        let (member_id, mut rx) = {
            let mut groups = lock(&self.cluster.groups);
            let group = groups.entry(group_id.clone()).or_default();
            let now = Instant::now();
            group.expire(now);

            let member_id = match request.member_id {
                Some(id) if group.members.contains_key(&id) => id,
                _ => new_member_id(&request.client_id),
            };
            group.members.insert(
                member_id.clone(),
                MemberState {
                    client_id: request.client_id,
                    topics: request.topics,
                    session_timeout: request.session_timeout,
                    last_seen: now,
                },
            );
            group.begin_rebalance();

            let (tx, rx) = oneshot::channel();
            group.pending.insert(member_id.clone(), tx);
            group.try_complete(false);
            (member_id, rx)
        };

        debug!(group = %group_id, member = %member_id, "Waiting for join barrier");

        match timeout(request.rebalance_timeout, &mut rx).await {
            // a newer join of the same member replaced this one
            Ok(response) => response.map_err(|_| {
                debug!(group = %group_id, member = %member_id, "Join superseded");
                TransportError::RebalanceInProgress(group_id.clone())
            }),
            Err(_) => {
                if let Some(group) = lock(&self.cluster.groups).get_mut(&group_id) {
                    group.try_complete(true);
                }
                rx.await
                    .map_err(|_| TransportError::RebalanceInProgress(group_id.clone()))
            }
        }
    }

    async fn heartbeat(
        &self,
        group_id: &str,
        member_id: &str,
        generation: GenerationId,
    ) -> TransportResult<()> {
        self.check()?;
        let mut groups = lock(&self.cluster.groups);
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| TransportError::UnknownMember(member_id.to_string()))?;

        let now = Instant::now();
        group.expire(now);
        let member = group
            .members
            .get_mut(member_id)
            .ok_or_else(|| TransportError::UnknownMember(member_id.to_string()))?;
        member.last_seen = now;

        if generation != group.generation {
            return Err(TransportError::IllegalGeneration(generation));
        }
        match group.phase {
            GroupPhase::PreparingRebalance => {
                Err(TransportError::RebalanceInProgress(group_id.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn leave_group(&self, group_id: &str, member_id: &str) -> TransportResult<()> {
        self.check()?;
        let mut groups = lock(&self.cluster.groups);
        if let Some(group) = groups.get_mut(group_id) {
            group.pending.remove(member_id);
            if group.members.remove(member_id).is_some() {
                info!(group = %group_id, member = %member_id, "Member left group");
                group.begin_rebalance();
                group.try_complete(false);
            }
        }
        Ok(())
    }

    async fn fetch(&self, request: FetchRequest) -> TransportResult<Vec<Message>> {
        self.check()?;
        self.cluster.fetches.fetch_add(1, Ordering::SeqCst);
        let log = self.cluster.partition(&request.partition)?;

        let notified = log.appended.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let batch = log.read(request.offset, request.max_messages);
        if !batch.is_empty() || request.max_wait.is_zero() {
            return Ok(batch);
        }

        let _ = timeout(request.max_wait, notified).await;
        self.check()?;
        Ok(log.read(request.offset, request.max_messages))
    }

    async fn list_offset(
        &self,
        partition: &TopicPartition,
        position: InitialOffset,
    ) -> TransportResult<i64> {
        self.check()?;
        let log = self.cluster.partition(partition)?;
        Ok(match position {
            InitialOffset::Oldest => 0,
            InitialOffset::Newest => log.len(),
        })
    }

    async fn commit_offsets(&self, request: OffsetCommitRequest) -> TransportResult<()> {
        self.check()?;
        if self.cluster.reject_commits.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("offset storage unavailable".into()));
        }
        let mut groups = lock(&self.cluster.groups);
        let group = groups
            .get_mut(&request.group_id)
            .ok_or_else(|| TransportError::UnknownMember(request.member_id.clone()))?;
        if !group.members.contains_key(&request.member_id) {
            return Err(TransportError::UnknownMember(request.member_id));
        }
        // commits from the current generation are accepted while it rebalances
        if request.generation != group.generation {
            return Err(TransportError::IllegalGeneration(request.generation));
        }
        group.offsets.extend(request.offsets);
        Ok(())
    }

    async fn fetch_offsets(
        &self,
        group_id: &str,
        partitions: &[TopicPartition],
    ) -> TransportResult<HashMap<TopicPartition, i64>> {
        self.check()?;
        let groups = lock(&self.cluster.groups);
        Ok(groups
            .get(group_id)
            .map(|group| {
                partitions
                    .iter()
                    .filter_map(|tp| group.offsets.get(tp).map(|offset| (tp.clone(), *offset)))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn produce(
        &self,
        partition: &TopicPartition,
        key: Option<Bytes>,
        value: Bytes,
    ) -> TransportResult<i64> {
        self.check()?;
        let log = self.cluster.partition(partition)?;
        let offset = {
            let mut records = lock(&log.records);
            let offset = records.len() as i64;
            records.push(Message {
                topic: partition.topic.clone(),
                partition: partition.partition,
                offset,
                key,
                value,
                timestamp: Utc::now(),
            });
            offset
        };
        log.appended.notify_waiters();
        Ok(offset)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
