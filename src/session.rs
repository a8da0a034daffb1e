use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::models::{GenerationId, MemberId, Message, TopicPartition};
use crate::offsets::OffsetCommitter;

/// Why a session is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The coordinator started a new generation
    Rebalance,
    /// Heartbeats went unacknowledged for a whole session timeout
    SessionExpired,
    /// The caller asked for shutdown
    Cancelled,
    /// A claim hit a processing error under the halt policy
    Halted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopReason::Rebalance => "rebalance",
            StopReason::SessionExpired => "session expired",
            StopReason::Cancelled => "cancelled",
            StopReason::Halted => "halted",
        };
        f.write_str(name)
    }
}

/// One-way stop latch shared by every task of a session. The first reason
/// recorded wins; later triggers only observe it.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<Option<StopReason>>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Records `reason` unless a stop is already in effect; returns the
    /// reason that is in effect afterwards.
    pub fn trigger(&self, reason: StopReason) -> StopReason {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        self.reason().unwrap_or(reason)
    }

    pub fn reason(&self) -> Option<StopReason> {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> StopListener {
        StopListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StopListener {
    rx: watch::Receiver<Option<StopReason>>,
}

impl StopListener {
    pub fn is_stopped(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Resolves once a stop reason is recorded.
    pub async fn stopped(&mut self) -> StopReason {
        loop {
            let current = *self.rx.borrow_and_update();
            if let Some(reason) = current {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                return StopReason::Cancelled;
            }
        }
    }
}

/// Resolves when the caller's shutdown flag flips to `true`. A dropped
/// sender can never cancel, so this then waits forever.
pub async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn is_cancelled(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// What handlers see of the generation they run in.
pub struct SessionContext {
    group_id: String,
    member_id: MemberId,
    generation: GenerationId,
    claims: Vec<TopicPartition>,
    committer: Arc<OffsetCommitter>,
}

impl SessionContext {
    pub fn new(
        group_id: String,
        member_id: MemberId,
        generation: GenerationId,
        claims: Vec<TopicPartition>,
        committer: Arc<OffsetCommitter>,
    ) -> Self {
        Self {
            group_id,
            member_id,
            generation,
            claims,
            committer,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn generation_id(&self) -> GenerationId {
        self.generation
    }

    pub fn claims(&self) -> &[TopicPartition] {
        &self.claims
    }

    /// Marks `message` as processed. Returns `false` once the generation's
    /// final commit has been issued.
    pub fn mark_message(&self, message: &Message) -> bool {
        self.committer.mark(&message.topic_partition(), message.offset)
    }
}
