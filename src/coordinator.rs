use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::app_config::GroupConfig;
use crate::assignment::{member_slice, AssignmentContext, PartitionAssignor};
use crate::error::TransportError;
use crate::infra::transport::{BrokerClient, JoinGroupRequest};
use crate::models::{Assignment, GenerationId, GroupMember, MemberId, TopicPartition};
use crate::session::{StopListener, StopReason, StopSignal};

/// Result of a completed join: the generation, who is in it, and what this
/// member owns.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub generation: GenerationId,
    pub member_id: MemberId,
    pub leader: MemberId,
    pub members: Vec<GroupMember>,
    /// the global mapping every member computed
    pub assignment: Assignment,
    /// this member's slice of it
    pub claims: Vec<TopicPartition>,
}

impl JoinOutcome {
    pub fn is_leader(&self) -> bool {
        self.member_id == self.leader
    }
}

/// Client side of the group membership protocol.
pub struct GroupCoordinator {
    client: Arc<dyn BrokerClient>,
    config: Arc<GroupConfig>,
    client_id: String,
    assignor: Box<dyn PartitionAssignor>,
    member_id: Mutex<Option<MemberId>>,
}

impl GroupCoordinator {
    pub fn new(client: Arc<dyn BrokerClient>, config: Arc<GroupConfig>, client_id: String) -> Self {
        let assignor = config.strategy.assignor();
        Self {
            client,
            config,
            client_id,
            assignor,
            member_id: Mutex::new(None),
        }
    }

    pub fn member_id(&self) -> Option<MemberId> {
        self.member_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_member_id(&self, member_id: Option<MemberId>) {
        *self.member_id.lock().unwrap_or_else(PoisonError::into_inner) = member_id;
    }

    /// Joins the group and computes this member's partitions.
    ///
    /// Blocks until the coordinator closes the join barrier. Every member
    /// runs the same assignor over the same membership list and metadata,
    /// so the slices line up without anyone distributing them.
    pub async fn join(&self) -> Result<JoinOutcome, TransportError> {
        let response = self
            .client
            .join_group(JoinGroupRequest {
                group_id: self.config.group_id.clone(),
                member_id: self.member_id(),
                client_id: self.client_id.clone(),
                topics: self.config.topics.clone(),
                session_timeout: self.config.session_timeout,
                rebalance_timeout: self.config.rebalance_timeout,
            })
            .await?;
        self.set_member_id(Some(response.member_id.clone()));

        let topics: Vec<String> = response
            .members
            .iter()
            .flat_map(|m| m.topics.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let metadata = self.client.metadata(&topics).await?;

        let assignment = self.assignor.assign(&AssignmentContext {
            members: &response.members,
            topics: &metadata,
        });
        let claims = member_slice(&assignment, &response.member_id);

        let outcome = JoinOutcome {
            generation: response.generation,
            member_id: response.member_id,
            leader: response.leader,
            members: response.members,
            assignment,
            claims,
        };
        info!(
            group = %self.config.group_id,
            member = %outcome.member_id,
            generation = outcome.generation,
            members = outcome.members.len(),
            leader = outcome.is_leader(),
            strategy = self.assignor.name(),
            claims = outcome.claims.len(),
            "✓ Joined group"
        );
        Ok(outcome)
    }

    /// Heartbeats on a fixed interval until `done` fires, independently of
    /// claim processing. A rebalance or an unacknowledged session stops the
    /// session; heartbeats keep flowing while claims drain.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        generation: GenerationId,
        member_id: MemberId,
        session: StopSignal,
        done: StopListener,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.heartbeat_loop(generation, member_id, session, done).await })
    }

    async fn heartbeat_loop(
        &self,
        generation: GenerationId,
        member_id: MemberId,
        session: StopSignal,
        mut done: StopListener,
    ) {
        let interval = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_ack = Instant::now();
        let mut signalled = false;

        loop {
            tokio::select! {
                biased;
                _ = done.stopped() => return,
                _ = ticker.tick() => {}
            }

            match self
                .client
                .heartbeat(&self.config.group_id, &member_id, generation)
                .await
            {
                Ok(()) => last_ack = Instant::now(),
                Err(TransportError::RebalanceInProgress(_)) => {
                    last_ack = Instant::now();
                    if !signalled {
                        info!(group = %self.config.group_id, member = %member_id, generation, "Rebalance signalled by coordinator");
                        session.trigger(StopReason::Rebalance);
                        signalled = true;
                    }
                }
                Err(e) if e.is_rebalance() => {
                    warn!(member = %member_id, generation, error = %e, "Member fell out of the generation");
                    if matches!(e, TransportError::UnknownMember(_)) {
                        self.set_member_id(None);
                    }
                    session.trigger(StopReason::Rebalance);
                    return;
                }
                Err(e) => {
                    if last_ack.elapsed() >= self.config.session_timeout {
                        warn!(member = %member_id, generation, error = %e, "No heartbeat acknowledged within session timeout");
                        session.trigger(StopReason::SessionExpired);
                        return;
                    }
                    debug!(member = %member_id, error = %e, "Heartbeat failed");
                }
            }
        }
    }

    /// Best-effort leave so peers rebalance without waiting for expiry.
    pub async fn leave(&self) {
        let Some(member_id) = self.member_id() else {
            return;
        };
        match self.client.leave_group(&self.config.group_id, &member_id).await {
            Ok(()) => info!(group = %self.config.group_id, member = %member_id, "Left group"),
            Err(e) => warn!(group = %self.config.group_id, member = %member_id, error = %e, "Leave group failed"),
        }
        self.set_member_id(None);
    }
}
