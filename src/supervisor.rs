use serde::Serialize;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::app_config::{AppConfig, GroupConfig};
use crate::broker_config::BrokerConfig;
use crate::claim::{Claim, ClaimExit, ClaimRunner, FetchOptions};
use crate::coordinator::{GroupCoordinator, JoinOutcome};
use crate::error::{ConsumerError, Result, TransportError};
use crate::handler::MessageHandler;
use crate::infra::transport::{BrokerClient, Connector};
use crate::models::{GenerationId, MemberId, TopicPartition};
use crate::offsets::OffsetCommitter;
use crate::session::{cancelled, is_cancelled, SessionContext, StopReason, StopSignal};

/// Lifecycle of a group member.
///
/// ```text
/// Idle -> Joining -> Stable -> Revoking -> Joining ...
///                                      \-> Closing -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Joining,
    Stable,
    Revoking,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Joining => "joining",
            SessionState::Stable => "stable",
            SessionState::Revoking => "revoking",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Ready {
        generation: GenerationId,
        member_id: MemberId,
        claims: Vec<TopicPartition>,
    },
    Revoking {
        generation: GenerationId,
        reason: StopReason,
    },
    Revoked {
        generation: GenerationId,
    },
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    #[serde(rename = "group")]
    pub group_id: String,
    pub member_id: Option<MemberId>,
    pub generation: Option<GenerationId>,
    pub state: SessionState,
    #[serde(rename = "assignment")]
    pub claims: Vec<TopicPartition>,
}

struct Shared {
    status: RwLock<GroupStatus>,
    readiness: watch::Sender<Option<GenerationId>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Shared {
    fn update<F: FnOnce(&mut GroupStatus)>(&self, f: F) {
        f(&mut self.status.write().unwrap_or_else(PoisonError::into_inner));
    }

    fn status(&self) -> GroupStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Read-only view of a running member, for status endpoints.
#[derive(Clone)]
pub struct StatusHandle {
    shared: Arc<Shared>,
}

impl StatusHandle {
    pub fn status(&self) -> GroupStatus {
        self.shared.status()
    }

    /// `Some(generation)` while Stable.
    pub fn ready_generation(&self) -> Option<GenerationId> {
        *self.shared.readiness.borrow()
    }
}

/// Readiness of one join attempt. Armed before joining and consumed when the
/// session turns Stable, so no generation can announce itself twice.
struct ReadySignal<'a> {
    shared: &'a Shared,
}

impl<'a> ReadySignal<'a> {
    fn arm(shared: &'a Shared) -> Self {
        shared.readiness.send_replace(None);
        Self { shared }
    }

    fn fire(self, outcome: &JoinOutcome) {
        self.shared.readiness.send_replace(Some(outcome.generation));
        let _ = self.shared.events.send(SessionEvent::Ready {
            generation: outcome.generation,
            member_id: outcome.member_id.clone(),
            claims: outcome.claims.clone(),
        });
    }
}

/// How one pass through Stable ended
enum SessionEnd {
    /// The generation ran and was torn down
    Stopped(StopReason),
    /// Claims never started; counts as a failed join
    NotStarted(TransportError),
}

struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}

/// One member of a consumer group: joins, consumes its claims, rejoins on
/// every rebalance and closes on cancellation.
pub struct GroupConsumer {
    broker: BrokerConfig,
    group: Arc<GroupConfig>,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
}

impl GroupConsumer {
    pub fn new(
        broker: BrokerConfig,
        group: GroupConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        group.validate()?;
        if broker.endpoints.is_empty() {
            return Err(crate::error::ConfigError::Missing("BROKER_ADDRS").into());
        }

        let (readiness, _) = watch::channel(None);
        let (events, _) = broadcast::channel(64);
        let status = GroupStatus {
            group_id: group.group_id.clone(),
            member_id: None,
            generation: None,
            state: SessionState::Idle,
            claims: Vec::new(),
        };

        Ok(Self {
            broker,
            group: Arc::new(group),
            connector,
            shared: Arc::new(Shared {
                status: RwLock::new(status),
                readiness,
                events,
            }),
        })
    }

    pub fn from_config(config: &AppConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::new(config.broker.clone(), config.group.clone(), connector)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn readiness(&self) -> watch::Receiver<Option<GenerationId>> {
        self.shared.readiness.subscribe()
    }

    pub fn status(&self) -> GroupStatus {
        self.shared.status()
    }

    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle {
            shared: self.shared.clone(),
        }
    }

    fn transition(&self, next: SessionState) {
        self.shared.update(|status| {
            if status.state != next {
                info!(group = %status.group_id, from = %status.state, to = %next, "Session state");
                status.state = next;
            }
        });
    }

    /// Runs until `shutdown` flips to `true` or a fatal error occurs.
    /// Rebalances and transient transport failures are absorbed here.
    pub async fn run<H>(&self, handler: Arc<H>, mut shutdown: watch::Receiver<bool>) -> Result<()>
    where
        H: MessageHandler + ?Sized + 'static,
    {
        let client = match self.connect(&mut shutdown).await {
            Ok(Some(client)) => client,
            Ok(None) => {
                self.close(None).await;
                return Ok(());
            }
            Err(e) => {
                error!(group = %self.group.group_id, error = %e, "Cannot reach cluster");
                self.close(None).await;
                return Err(e);
            }
        };

        let coordinator = Arc::new(GroupCoordinator::new(
            client.clone(),
            self.group.clone(),
            self.broker.client_id.clone(),
        ));

        let result = self
            .join_loop(&client, &coordinator, handler, &mut shutdown)
            .await;
        if let Err(e) = &result {
            error!(group = %self.group.group_id, error = %e, fatal = e.is_fatal(), "Consumer group stopped");
        }

        self.transition(SessionState::Closing);
        coordinator.leave().await;
        self.close(Some(&client)).await;
        result
    }

    async fn connect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Arc<dyn BrokerClient>>> {
        let mut backoff = Backoff::new(self.group.retry_backoff, self.group.max_retry_backoff);
        let mut attempts = 0u32;

        loop {
            if is_cancelled(shutdown) {
                return Ok(None);
            }
            attempts += 1;
            match self.connector.connect(&self.broker).await {
                Ok(client) => {
                    info!(
                        client_id = %self.broker.client_id,
                        user = self.broker.username().unwrap_or("anonymous"),
                        attempts,
                        "✓ Connected to cluster"
                    );
                    return Ok(Some(client));
                }
                Err(e) if e.is_retriable() && attempts < self.group.max_join_attempts => {
                    let delay = backoff.next_delay();
                    warn!(attempts, ?delay, error = %e, "Connect failed, retrying");
                    tokio::select! {
                        _ = cancelled(shutdown) => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(ConsumerError::from_transport(e, attempts)),
            }
        }
    }

    async fn join_loop<H>(
        &self,
        client: &Arc<dyn BrokerClient>,
        coordinator: &Arc<GroupCoordinator>,
        handler: Arc<H>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()>
    where
        H: MessageHandler + ?Sized + 'static,
    {
        let mut backoff = Backoff::new(self.group.retry_backoff, self.group.max_retry_backoff);
        let mut failures = 0u32;

        loop {
            if is_cancelled(shutdown) {
                return Ok(());
            }

            let ready = ReadySignal::arm(&self.shared);
            self.transition(SessionState::Joining);

            let joined = tokio::select! {
                biased;
                _ = cancelled(shutdown) => return Ok(()),
                joined = coordinator.join() => joined,
            };

            let error = match joined {
                Ok(outcome) => {
                    match self
                        .run_session(client, coordinator, outcome, handler.clone(), ready, shutdown)
                        .await?
                    {
                        SessionEnd::Stopped(StopReason::Cancelled) => return Ok(()),
                        SessionEnd::Stopped(reason) => {
                            failures = 0;
                            backoff.reset();
                            debug!(group = %self.group.group_id, %reason, "Rejoining");
                            continue;
                        }
                        SessionEnd::NotStarted(e) => e,
                    }
                }
                Err(e) => e,
            };

            if !error.is_retriable() {
                return Err(ConsumerError::from_transport(error, failures + 1));
            }
            // the coordinator asked for another round, nothing failed
            if error.is_rebalance() {
                debug!(group = %self.group.group_id, error = %error, "Rebalance during join, rejoining");
                continue;
            }

            failures += 1;
            if failures >= self.group.max_join_attempts {
                return Err(ConsumerError::from_transport(error, failures));
            }
            let delay = backoff.next_delay();
            warn!(group = %self.group.group_id, failures, ?delay, error = %error, "Join failed, backing off");
            tokio::select! {
                _ = cancelled(shutdown) => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One generation: Stable until something stops it, then Revoking until
    /// every claim is gone and the final commit went out.
    async fn run_session<H>(
        &self,
        client: &Arc<dyn BrokerClient>,
        coordinator: &Arc<GroupCoordinator>,
        outcome: JoinOutcome,
        handler: Arc<H>,
        ready: ReadySignal<'_>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd>
    where
        H: MessageHandler + ?Sized + 'static,
    {
        let generation = outcome.generation;
        let member_id = outcome.member_id.clone();
        let committer = Arc::new(OffsetCommitter::new(
            client.clone(),
            self.group.group_id.clone(),
            member_id.clone(),
            generation,
        ));

        let starts = match committer
            .start_offsets(&outcome.claims, self.group.initial_offset)
            .await
        {
            Ok(starts) => starts,
            Err(e) => {
                warn!(generation, error = %e, "Cannot resolve start offsets");
                return Ok(SessionEnd::NotStarted(e));
            }
        };

        let session = Arc::new(SessionContext::new(
            self.group.group_id.clone(),
            member_id.clone(),
            generation,
            outcome.claims.clone(),
            committer.clone(),
        ));
        handler.setup(&session).await.map_err(ConsumerError::Handler)?;

        let stop = StopSignal::new();
        let heartbeat_done = StopSignal::new();
        let heartbeat = coordinator.spawn_heartbeat(
            generation,
            member_id.clone(),
            stop.clone(),
            heartbeat_done.listener(),
        );

        self.shared.update(|status| {
            status.member_id = Some(member_id.clone());
            status.generation = Some(generation);
            status.claims = outcome.claims.clone();
        });
        self.transition(SessionState::Stable);
        ready.fire(&outcome);

        let commits = tokio::spawn(
            committer
                .clone()
                .run_periodic(self.group.commit_interval, stop.listener()),
        );

        let options = FetchOptions::from(self.group.as_ref());
        let mut claims = JoinSet::new();
        for tp in &outcome.claims {
            let start = starts.get(tp).copied().unwrap_or_default();
            let runner = ClaimRunner {
                claim: Claim::new(tp.clone(), generation, start),
                client: client.clone(),
                handler: handler.clone(),
                session: session.clone(),
                stop: stop.clone(),
                options: options.clone(),
                policy: self.group.processing_errors,
            };
            claims.spawn(runner.run());
        }

        let mut listener = stop.listener();
        let reason = tokio::select! {
            reason = listener.stopped() => reason,
            _ = cancelled(shutdown) => stop.trigger(StopReason::Cancelled),
        };

        self.transition(SessionState::Revoking);
        self.shared.readiness.send_replace(None);
        self.shared.update(|status| status.claims.clear());
        let _ = self
            .shared
            .events
            .send(SessionEvent::Revoking { generation, reason });
        info!(group = %self.group.group_id, member = %member_id, generation, %reason, "Revoking claims");

        let mut failure = None;
        while let Some(joined) = claims.join_next().await {
            match joined {
                Ok(ClaimExit::Halted(err)) => {
                    failure.get_or_insert(err);
                }
                Ok(exit) => debug!(?exit, "Claim finished"),
                Err(e) => error!(error = %e, "Claim task failed"),
            }
        }
        if let Err(e) = commits.await {
            error!(error = %e, "Commit task failed");
        }

        if let Err(e) = handler.cleanup(&session).await {
            warn!(generation, error = %e, "Session cleanup failed");
        }
        match committer.seal_and_commit().await {
            Ok(partitions) => info!(generation, partitions, "Final commit issued"),
            Err(e) => warn!(
                generation,
                error = %e,
                "Final commit failed, next generation replays from the last commit"
            ),
        }

        heartbeat_done.trigger(StopReason::Cancelled);
        if let Err(e) = heartbeat.await {
            error!(error = %e, "Heartbeat task failed");
        }
        let _ = self.shared.events.send(SessionEvent::Revoked { generation });

        match failure {
            Some(err) => Err(err),
            None => Ok(SessionEnd::Stopped(reason)),
        }
    }

    async fn close(&self, client: Option<&Arc<dyn BrokerClient>>) {
        self.transition(SessionState::Closing);
        if let Some(client) = client {
            if let Err(e) = client.close().await {
                warn!(error = %e, "Closing transport failed");
            }
        }
        self.shared.readiness.send_replace(None);
        self.shared.update(|status| {
            status.generation = None;
            status.claims.clear();
        });
        self.transition(SessionState::Closed);
        let _ = self.shared.events.send(SessionEvent::Closed);
    }
}
