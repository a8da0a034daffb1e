use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::app_config::InitialOffset;
use crate::error::TransportError;
use crate::infra::transport::{BrokerClient, OffsetCommitRequest};
use crate::models::{GenerationId, MemberId, TopicPartition};
use crate::session::StopListener;

#[derive(Default)]
struct CommitState {
    /// highest processed offset per partition
    marked: HashMap<TopicPartition, i64>,
    /// last value the broker acknowledged
    committed: HashMap<TopicPartition, i64>,
    sealed: bool,
}

/// Owns the commit state of one generation. Only this type writes offsets
/// to the broker.
pub struct OffsetCommitter {
    client: Arc<dyn BrokerClient>,
    group_id: String,
    member_id: MemberId,
    generation: GenerationId,
    state: Mutex<CommitState>,
    in_flight: tokio::sync::Mutex<()>,
}

impl OffsetCommitter {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        group_id: String,
        member_id: MemberId,
        generation: GenerationId,
    ) -> Self {
        Self {
            client,
            group_id,
            member_id,
            generation,
            state: Mutex::new(CommitState::default()),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, CommitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `offset` as processed. Never moves a partition backwards.
    /// Rejected once the generation is sealed.
    pub fn mark(&self, partition: &TopicPartition, offset: i64) -> bool {
        let mut state = self.state();
        if state.sealed {
            debug!(%partition, offset, generation = self.generation, "Mark after final commit ignored");
            return false;
        }
        let candidate = state.marked.entry(partition.clone()).or_insert(offset);
        if offset > *candidate {
            *candidate = offset;
        }
        true
    }

    pub fn marked(&self, partition: &TopicPartition) -> Option<i64> {
        self.state().marked.get(partition).copied()
    }

    pub fn committed(&self, partition: &TopicPartition) -> Option<i64> {
        self.state().committed.get(partition).copied()
    }

    pub fn is_sealed(&self) -> bool {
        self.state().sealed
    }

    /// Sends every mark that moved past the last acknowledged commit.
    /// Returns how many partitions were written.
    pub async fn commit(&self) -> Result<usize, TransportError> {
        let _serial = self.in_flight.lock().await;

        let pending: HashMap<TopicPartition, i64> = {
            let state = self.state();
            state
                .marked
                .iter()
                .filter(|(tp, offset)| state.committed.get(*tp).map_or(true, |c| **offset > *c))
                .map(|(tp, offset)| (tp.clone(), *offset))
                .collect()
        };
        if pending.is_empty() {
            return Ok(0);
        }

        self.client
            .commit_offsets(OffsetCommitRequest {
                group_id: self.group_id.clone(),
                member_id: self.member_id.clone(),
                generation: self.generation,
                offsets: pending.clone(),
            })
            .await?;

        let written = pending.len();
        {
            let mut state = self.state();
            for (tp, offset) in pending {
                let committed = state.committed.entry(tp).or_insert(offset);
                if offset > *committed {
                    *committed = offset;
                }
            }
        }
        debug!(group = %self.group_id, generation = self.generation, partitions = written, "Offsets committed");
        Ok(written)
    }

    /// Final write of the generation: later marks are refused.
    pub async fn seal_and_commit(&self) -> Result<usize, TransportError> {
        self.state().sealed = true;
        self.commit().await
    }

    /// Commits on every tick until the session stops. Failures wait for the
    /// next tick.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration, mut stop: StopListener) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => return,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.commit().await {
                warn!(
                    group = %self.group_id,
                    generation = self.generation,
                    error = %e,
                    "Offset commit failed, retrying next tick"
                );
            }
        }
    }

    /// Where each claim resumes: right after the committed offset, or at the
    /// configured end of the log when the group never committed.
    pub async fn start_offsets(
        &self,
        claims: &[TopicPartition],
        initial: InitialOffset,
    ) -> Result<HashMap<TopicPartition, i64>, TransportError> {
        let committed = self.client.fetch_offsets(&self.group_id, claims).await?;
        {
            let mut state = self.state();
            for (tp, offset) in &committed {
                state.committed.insert(tp.clone(), *offset);
            }
        }

        let mut starts = HashMap::with_capacity(claims.len());
        for tp in claims {
            let start = match committed.get(tp) {
                Some(offset) => offset + 1,
                None => self.client.list_offset(tp, initial).await?,
            };
            starts.insert(tp.clone(), start);
        }
        Ok(starts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker_config::BrokerConfig;
    use crate::infra::memory::MemoryCluster;
    use crate::infra::transport::{Connector, JoinGroupRequest};

    async fn setup() -> (MemoryCluster, OffsetCommitter) {
        let cluster = MemoryCluster::new(vec!["n1:9091".into()]);
        cluster.create_topic("events", 2);
        let client = cluster
            .connect(&BrokerConfig::new(vec!["n1:9091".into()], "c"))
            .await
            .unwrap();
        let joined = client
            .join_group(JoinGroupRequest {
                group_id: "g".into(),
                member_id: None,
                client_id: "c".into(),
                topics: vec!["events".into()],
                session_timeout: Duration::from_secs(30),
                rebalance_timeout: Duration::from_secs(5),
            })
            .await
            .unwrap();
        let committer = OffsetCommitter::new(client, "g".into(), joined.member_id, joined.generation);
        (cluster, committer)
    }

    #[tokio::test]
    async fn test_marks_are_monotonic() {
        let (_cluster, committer) = setup().await;
        let tp = TopicPartition::new("events", 0);

        committer.mark(&tp, 5);
        committer.mark(&tp, 3);
        assert_eq!(committer.marked(&tp), Some(5));
    }

    #[tokio::test]
    async fn test_commit_sends_only_advanced_partitions() {
        let (cluster, committer) = setup().await;
        let p0 = TopicPartition::new("events", 0);
        let p1 = TopicPartition::new("events", 1);

        committer.mark(&p0, 9);
        committer.mark(&p1, 2);
        assert_eq!(committer.commit().await.unwrap(), 2);
        assert_eq!(committer.commit().await.unwrap(), 0);

        committer.mark(&p1, 3);
        assert_eq!(committer.commit().await.unwrap(), 1);
        assert_eq!(cluster.committed_offset("g", &p0), Some(9));
        assert_eq!(cluster.committed_offset("g", &p1), Some(3));
    }

    #[tokio::test]
    async fn test_failed_commit_retried_later() {
        let (cluster, committer) = setup().await;
        let tp = TopicPartition::new("events", 0);
        committer.mark(&tp, 4);

        cluster.set_reject_commits(true);
        assert!(committer.commit().await.is_err());
        assert_eq!(committer.committed(&tp), None);

        cluster.set_reject_commits(false);
        assert_eq!(committer.commit().await.unwrap(), 1);
        assert_eq!(cluster.committed_offset("g", &tp), Some(4));
    }

    #[tokio::test]
    async fn test_sealed_committer_refuses_marks() {
        let (cluster, committer) = setup().await;
        let tp = TopicPartition::new("events", 1);

        assert!(committer.mark(&tp, 0));
        committer.seal_and_commit().await.unwrap();
        assert!(committer.is_sealed());
        assert!(!committer.mark(&tp, 1));
        assert_eq!(cluster.committed_offset("g", &tp), Some(0));
    }

    #[tokio::test]
    async fn test_start_offsets_resume_after_commit() {
        let (_cluster, committer) = setup().await;
        let p0 = TopicPartition::new("events", 0);
        let p1 = TopicPartition::new("events", 1);
        committer.mark(&p0, 6);
        committer.commit().await.unwrap();

        let starts = committer
            .start_offsets(&[p0.clone(), p1.clone()], InitialOffset::Oldest)
            .await
            .unwrap();
        assert_eq!(starts[&p0], 7);
        assert_eq!(starts[&p1], 0);
    }
}
