use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use group_consumer::infra::memory::MemoryCluster;
use group_consumer::infra::transport::{
    BrokerClient, Connector, FetchRequest, JoinGroupRequest, JoinGroupResponse,
    OffsetCommitRequest, TransportResult,
};
use group_consumer::models::{GenerationId, TopicMetadata};
use group_consumer::{
    BrokerConfig, ConsumerError, Credentials, GroupConfig, GroupConsumer, InitialOffset, Message,
    MessageHandler, ProcessingErrorPolicy, SessionContext, SessionEvent, SessionState,
    StopReason, TopicPartition, TransportError,
};

const ENDPOINT: &str = "n1:9091";
const TOPIC: &str = "events";
const GROUP: &str = "demo.consumer-group";

fn broker() -> BrokerConfig {
    BrokerConfig::new(vec![ENDPOINT.into()], "demo")
}

fn group_config() -> GroupConfig {
    let mut config = GroupConfig::new(GROUP, vec![TOPIC.into()]);
    config.session_timeout = Duration::from_secs(1);
    config.heartbeat_interval = Duration::from_millis(50);
    config.rebalance_timeout = Duration::from_secs(5);
    config.commit_interval = Duration::from_millis(50);
    config.retry_backoff = Duration::from_millis(20);
    config.max_retry_backoff = Duration::from_millis(100);
    config.fetch_max_wait = Duration::from_millis(20);
    config
}

fn cluster(partitions: i32) -> MemoryCluster {
    let cluster = MemoryCluster::new(vec![ENDPOINT.into()]);
    cluster.create_topic(TOPIC, partitions);
    cluster
}

fn member(cluster: &MemoryCluster, config: GroupConfig) -> Arc<GroupConsumer> {
    Arc::new(GroupConsumer::new(broker(), config, Arc::new(cluster.clone())).unwrap())
}

fn spawn<H: MessageHandler + 'static>(
    consumer: &Arc<GroupConsumer>,
    handler: Arc<H>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<Result<(), ConsumerError>> {
    let consumer = consumer.clone();
    tokio::spawn(async move { consumer.run(handler, shutdown).await })
}

async fn producer(cluster: &MemoryCluster) -> Arc<dyn BrokerClient> {
    cluster.connect(&broker()).await.unwrap()
}

async fn produce(client: &Arc<dyn BrokerClient>, partition: i32, value: &str) {
    client
        .produce(
            &TopicPartition::new(TOPIC, partition),
            None,
            Bytes::from(value.to_string()),
        )
        .await
        .unwrap();
}

async fn ready_at(consumer: &GroupConsumer, generation: u32) {
    let mut ready = consumer.readiness();
    tokio::time::timeout(
        Duration::from_secs(5),
        ready.wait_for(|g| matches!(g, Some(current) if *current >= generation)),
    )
    .await
    .expect("member never became ready")
    .unwrap();
}

async fn next_event<F>(events: &mut broadcast::Receiver<SessionEvent>, mut wanted: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event never arrived")
}

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(TopicPartition, i64)>>,
    fail_at: Option<i64>,
}

impl Recorder {
    fn seen(&self) -> Vec<(TopicPartition, i64)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn process(&self, _session: &SessionContext, message: &Message) -> anyhow::Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((message.topic_partition(), message.offset));
        if Some(message.offset) == self.fail_at {
            anyhow::bail!("cannot handle {}", message.value_str());
        }
        Ok(())
    }
}

/// Holds every callback until the gate opens.
struct Gated {
    gate: watch::Receiver<bool>,
    in_flight: AtomicUsize,
    seen: Mutex<Vec<(TopicPartition, i64)>>,
}

#[async_trait]
impl MessageHandler for Gated {
    async fn process(&self, _session: &SessionContext, message: &Message) -> anyhow::Result<()> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.clone();
        if gate.wait_for(|open| *open).await.is_err() {
            anyhow::bail!("gate dropped");
        }
        self.seen
            .lock()
            .unwrap()
            .push((message.topic_partition(), message.offset));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Failures injected in front of a healthy in-memory cluster.
#[derive(Default)]
struct Faults {
    joins: AtomicUsize,
    /// The first N joins are answered with a rebalance
    rebalancing_joins: usize,
    offsets_down: bool,
}

struct FaultyConnector {
    cluster: MemoryCluster,
    faults: Arc<Faults>,
}

#[async_trait]
impl Connector for FaultyConnector {
    async fn connect(&self, config: &BrokerConfig) -> TransportResult<Arc<dyn BrokerClient>> {
        let inner = self.cluster.connect(config).await?;
        Ok(Arc::new(FaultyClient {
            inner,
            faults: self.faults.clone(),
        }))
    }
}

struct FaultyClient {
    inner: Arc<dyn BrokerClient>,
    faults: Arc<Faults>,
}

#[async_trait]
impl BrokerClient for FaultyClient {
    async fn metadata(&self, topics: &[String]) -> TransportResult<Vec<TopicMetadata>> {
        self.inner.metadata(topics).await
    }

    async fn join_group(&self, request: JoinGroupRequest) -> TransportResult<JoinGroupResponse> {
        let attempt = self.faults.joins.fetch_add(1, Ordering::SeqCst);
        if attempt < self.faults.rebalancing_joins {
            return Err(TransportError::RebalanceInProgress(request.group_id));
        }
        self.inner.join_group(request).await
    }

    async fn heartbeat(
        &self,
        group_id: &str,
        member_id: &str,
        generation: GenerationId,
    ) -> TransportResult<()> {
        self.inner.heartbeat(group_id, member_id, generation).await
    }

    async fn leave_group(&self, group_id: &str, member_id: &str) -> TransportResult<()> {
        self.inner.leave_group(group_id, member_id).await
    }

    async fn fetch(&self, request: FetchRequest) -> TransportResult<Vec<Message>> {
        self.inner.fetch(request).await
    }

    async fn list_offset(
        &self,
        partition: &TopicPartition,
        position: InitialOffset,
    ) -> TransportResult<i64> {
        self.inner.list_offset(partition, position).await
    }

    async fn commit_offsets(&self, request: OffsetCommitRequest) -> TransportResult<()> {
        self.inner.commit_offsets(request).await
    }

    async fn fetch_offsets(
        &self,
        group_id: &str,
        partitions: &[TopicPartition],
    ) -> TransportResult<HashMap<TopicPartition, i64>> {
        if self.faults.offsets_down {
            return Err(TransportError::Unavailable("offset storage".into()));
        }
        self.inner.fetch_offsets(group_id, partitions).await
    }

    async fn produce(
        &self,
        partition: &TopicPartition,
        key: Option<Bytes>,
        value: Bytes,
    ) -> TransportResult<i64> {
        self.inner.produce(partition, key, value).await
    }

    async fn close(&self) -> TransportResult<()> {
        self.inner.close().await
    }
}

fn faulty_member(
    cluster: &MemoryCluster,
    config: GroupConfig,
    faults: Faults,
) -> (Arc<GroupConsumer>, Arc<Faults>) {
    let faults = Arc::new(faults);
    let connector = FaultyConnector {
        cluster: cluster.clone(),
        faults: faults.clone(),
    };
    let consumer = GroupConsumer::new(broker(), config, Arc::new(connector)).unwrap();
    (Arc::new(consumer), faults)
}

#[tokio::test]
async fn test_three_members_split_six_partitions() {
    let cluster = cluster(6);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let members: Vec<_> = (0..3).map(|_| member(&cluster, group_config())).collect();
    let runs: Vec<_> = members
        .iter()
        .map(|m| spawn(m, Arc::new(Recorder::default()), shutdown_rx.clone()))
        .collect();

    eventually("a stable three member generation", || {
        let statuses: Vec<_> = members.iter().map(|m| m.status()).collect();
        cluster.members(GROUP).len() == 3
            && statuses.iter().all(|s| s.state == SessionState::Stable)
            && statuses.iter().all(|s| s.generation == cluster.generation(GROUP))
    })
    .await;

    let mut owned = BTreeSet::new();
    for status in members.iter().map(|m| m.status()) {
        assert_eq!(status.claims.len(), 2, "{status:?}");
        for tp in status.claims {
            assert!(owned.insert(tp), "partition claimed twice");
        }
    }
    assert_eq!(owned.len(), 6);

    shutdown_tx.send(true).unwrap();
    for run in runs {
        run.await.unwrap().unwrap();
    }
    assert!(members.iter().all(|m| m.status().state == SessionState::Closed));
}

#[tokio::test]
async fn test_rebalance_drains_in_flight_messages_before_commit() {
    let cluster = cluster(50);
    let client = producer(&cluster).await;
    for partition in 0..50 {
        produce(&client, partition, "first").await;
    }

    let (gate_tx, gate_rx) = watch::channel(false);
    let handler = Arc::new(Gated {
        gate: gate_rx,
        in_flight: AtomicUsize::new(0),
        seen: Mutex::new(Vec::new()),
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let first = member(&cluster, group_config());
    let mut events = first.subscribe();
    let first_run = spawn(&first, handler.clone(), shutdown_rx.clone());
    eventually("50 callbacks in flight", || {
        handler.in_flight.load(Ordering::SeqCst) == 50
    })
    .await;

    let second = member(&cluster, group_config());
    let second_run = spawn(&second, handler.clone(), shutdown_rx.clone());

    let revoking = next_event(&mut events, |e| matches!(e, SessionEvent::Revoking { .. })).await;
    assert!(matches!(
        revoking,
        SessionEvent::Revoking { generation: 1, reason: StopReason::Rebalance }
    ));
    // the old generation is still draining, nothing may be committed yet
    assert!(cluster
        .committed_offset(GROUP, &TopicPartition::new(TOPIC, 0))
        .is_none());

    gate_tx.send(true).unwrap();
    next_event(&mut events, |e| matches!(e, SessionEvent::Ready { generation: 2, .. })).await;

    for partition in 0..50 {
        let tp = TopicPartition::new(TOPIC, partition);
        assert_eq!(cluster.committed_offset(GROUP, &tp), Some(0), "{tp}");
    }
    assert_eq!(handler.seen.lock().unwrap().len(), 50);

    ready_at(&second, 2).await;
    for partition in 0..50 {
        produce(&client, partition, "second").await;
    }
    eventually("second round processed", || {
        handler.seen.lock().unwrap().len() == 100
    })
    .await;

    let seen = handler.seen.lock().unwrap().clone();
    let mut per_partition: HashMap<TopicPartition, Vec<i64>> = HashMap::new();
    for (tp, offset) in seen {
        per_partition.entry(tp).or_default().push(offset);
    }
    assert_eq!(per_partition.len(), 50);
    assert!(per_partition.values().all(|offsets| offsets == &vec![0, 1]));

    shutdown_tx.send(true).unwrap();
    first_run.await.unwrap().unwrap();
    second_run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_one_ready_per_generation() {
    let cluster = cluster(4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let first = member(&cluster, group_config());
    let mut events = first.subscribe();
    let first_run = spawn(&first, Arc::new(Recorder::default()), shutdown_rx.clone());
    ready_at(&first, 1).await;

    let second = member(&cluster, group_config());
    let second_run = spawn(&second, Arc::new(Recorder::default()), shutdown_rx.clone());
    ready_at(&first, 2).await;
    ready_at(&second, 2).await;

    shutdown_tx.send(true).unwrap();
    first_run.await.unwrap().unwrap();
    second_run.await.unwrap().unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    let ready: Vec<u32> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Ready { generation, .. } => Some(*generation),
            _ => None,
        })
        .collect();
    let unique: BTreeSet<u32> = ready.iter().copied().collect();
    assert_eq!(ready.len(), unique.len(), "{seen:?}");
    assert!(unique.contains(&1) && unique.contains(&2));

    // every Ready is followed by that generation's Revoking and Revoked
    for generation in unique {
        let ready_at = seen
            .iter()
            .position(|e| matches!(e, SessionEvent::Ready { generation: g, .. } if *g == generation));
        let revoked_at = seen
            .iter()
            .position(|e| matches!(e, SessionEvent::Revoked { generation: g } if *g == generation));
        assert!(ready_at < revoked_at, "{seen:?}");
    }
    assert!(matches!(seen.last(), Some(SessionEvent::Closed)));
}

#[tokio::test]
async fn test_shutdown_stops_pulls_and_leaves_group() {
    let cluster = cluster(3);
    let client = producer(&cluster).await;
    for i in 0..9 {
        produce(&client, i % 3, &format!("Hello #{i}")).await;
    }

    let handler = Arc::new(Recorder::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = member(&cluster, group_config());
    let run = spawn(&consumer, handler.clone(), shutdown_rx);

    eventually("all messages processed", || handler.seen().len() == 9).await;
    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(consumer.status().state, SessionState::Closed);
    assert!(consumer.readiness().borrow().is_none());
    assert!(cluster.members(GROUP).is_empty());
    for partition in 0..3 {
        let tp = TopicPartition::new(TOPIC, partition);
        assert_eq!(cluster.committed_offset(GROUP, &tp), Some(2));
    }

    let pulls = cluster.fetch_count();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.fetch_count(), pulls);
}

#[tokio::test]
async fn test_restart_resumes_after_committed_offset() {
    let cluster = cluster(1);
    let client = producer(&cluster).await;
    for i in 0..5 {
        produce(&client, 0, &format!("m{i}")).await;
    }

    let first = Arc::new(Recorder::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = member(&cluster, group_config());
    let run = spawn(&consumer, first.clone(), shutdown_rx);
    eventually("first batch", || first.seen().len() == 5).await;
    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();

    for i in 5..8 {
        produce(&client, 0, &format!("m{i}")).await;
    }
    let second = Arc::new(Recorder::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = member(&cluster, group_config());
    let run = spawn(&consumer, second.clone(), shutdown_rx);
    eventually("second batch", || second.seen().len() == 3).await;
    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();

    let offsets: Vec<i64> = second.seen().into_iter().map(|(_, offset)| offset).collect();
    assert_eq!(offsets, vec![5, 6, 7]);
}

#[tokio::test]
async fn test_bad_credentials_are_fatal() {
    let cluster = cluster(1).with_user("demo", "secret");
    let broker = broker().with_sasl(Credentials::new("demo", "wrong"));
    let consumer = GroupConsumer::new(broker, group_config(), Arc::new(cluster.clone())).unwrap();
    let mut events = consumer.subscribe();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let err = tokio::time::timeout(
        Duration::from_secs(2),
        consumer.run(Arc::new(Recorder::default()), shutdown_rx),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert!(matches!(err, ConsumerError::Auth(ref user) if user == "demo"));
    assert!(err.is_fatal());
    assert!(matches!(events.try_recv(), Ok(SessionEvent::Closed)));
    assert_eq!(consumer.status().state, SessionState::Closed);
}

#[tokio::test]
async fn test_unreachable_cluster_escalates_after_attempts() {
    let cluster = cluster(1);
    cluster.set_available(false);
    let mut config = group_config();
    config.max_join_attempts = 3;
    let consumer = member(&cluster, config);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let err = consumer
        .run(Arc::new(Recorder::default()), shutdown_rx)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsumerError::Transport { attempts: 3, .. }));
}

#[tokio::test]
async fn test_transient_outage_at_startup_is_retried() {
    let cluster = cluster(2);
    cluster.set_available(false);
    let consumer = member(&cluster, group_config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = spawn(&consumer, Arc::new(Recorder::default()), shutdown_rx);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(consumer.readiness().borrow().is_none());
    cluster.set_available(true);
    ready_at(&consumer, 1).await;

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_halt_policy_surfaces_processing_error() {
    let cluster = cluster(1);
    let client = producer(&cluster).await;
    for i in 0..5 {
        produce(&client, 0, &format!("m{i}")).await;
    }

    let mut config = group_config();
    config.processing_errors = ProcessingErrorPolicy::Halt;
    let consumer = member(&cluster, config);
    let handler = Arc::new(Recorder {
        seen: Mutex::new(Vec::new()),
        fail_at: Some(2),
    });
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let err = tokio::time::timeout(Duration::from_secs(5), consumer.run(handler.clone(), shutdown_rx))
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, ConsumerError::Processing { offset: 2, .. }));
    assert_eq!(handler.seen().len(), 3);
    // work before the failure is kept, the failed message is not
    assert_eq!(
        cluster.committed_offset(GROUP, &TopicPartition::new(TOPIC, 0)),
        Some(1)
    );
    assert_eq!(consumer.status().state, SessionState::Closed);
}

#[tokio::test]
async fn test_commit_failures_do_not_stop_consumption() {
    let cluster = cluster(1);
    let client = producer(&cluster).await;
    cluster.set_reject_commits(true);

    let handler = Arc::new(Recorder::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = member(&cluster, group_config());
    let run = spawn(&consumer, handler.clone(), shutdown_rx);
    ready_at(&consumer, 1).await;

    for i in 0..4 {
        produce(&client, 0, &format!("m{i}")).await;
    }
    eventually("messages processed", || handler.seen().len() == 4).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let tp = TopicPartition::new(TOPIC, 0);
    assert!(cluster.committed_offset(GROUP, &tp).is_none());
    assert_eq!(consumer.status().state, SessionState::Stable);

    cluster.set_reject_commits(false);
    eventually("commit after recovery", || {
        cluster.committed_offset(GROUP, &tp) == Some(3)
    })
    .await;

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unresolvable_start_offsets_escalate_after_attempts() {
    let cluster = cluster(2);
    let mut config = group_config();
    config.max_join_attempts = 3;
    config.retry_backoff = Duration::from_millis(50);
    config.max_retry_backoff = Duration::from_millis(200);
    let (consumer, faults) = faulty_member(
        &cluster,
        config,
        Faults {
            offsets_down: true,
            ..Faults::default()
        },
    );
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let started = tokio::time::Instant::now();
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        consumer.run(Arc::new(Recorder::default()), shutdown_rx),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert!(matches!(err, ConsumerError::Transport { attempts: 3, .. }));
    // one join per attempt, with a back-off of 50ms then 100ms in between
    assert_eq!(faults.joins.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert!(consumer.readiness().borrow().is_none());
    assert_eq!(consumer.status().state, SessionState::Closed);
}

#[tokio::test]
async fn test_rebalance_during_join_is_not_a_failure() {
    let cluster = cluster(2);
    let mut config = group_config();
    config.max_join_attempts = 3;
    let (consumer, faults) = faulty_member(
        &cluster,
        config,
        Faults {
            rebalancing_joins: 5,
            ..Faults::default()
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = spawn(&consumer, Arc::new(Recorder::default()), shutdown_rx);

    ready_at(&consumer, 1).await;
    assert_eq!(faults.joins.load(Ordering::SeqCst), 6);
    assert_eq!(consumer.status().claims.len(), 2);

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();
}
