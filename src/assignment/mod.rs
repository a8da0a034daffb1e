mod range;
mod round_robin;

pub use range::RangeAssignor;
pub use round_robin::RoundRobinAssignor;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::models::{Assignment, GroupMember, MemberId, TopicMetadata, TopicPartition};

/// Everything an assignor sees. Every member runs the same computation on
/// the same input, so nothing here may depend on local state.
pub struct AssignmentContext<'a> {
    pub members: &'a [GroupMember],
    pub topics: &'a [TopicMetadata],
}

impl<'a> AssignmentContext<'a> {
    /// Members sorted by id, duplicates dropped.
    pub fn sorted_members(&self) -> Vec<&'a GroupMember> {
        let mut members: Vec<&GroupMember> = self.members.iter().collect();
        members.sort_by(|a, b| a.member_id.cmp(&b.member_id));
        members.dedup_by(|a, b| a.member_id == b.member_id);
        members
    }

    /// Every partition of every topic, sorted by (topic, partition).
    pub fn sorted_partitions(&self) -> Vec<TopicPartition> {
        let all: BTreeSet<TopicPartition> = self.topics.iter().flat_map(|t| t.partitions()).collect();
        all.into_iter().collect()
    }

    /// Pre-populated result: every member present, even with nothing to own.
    pub fn empty_assignment(&self) -> Assignment {
        self.members
            .iter()
            .map(|m| (m.member_id.clone(), Vec::new()))
            .collect()
    }
}

pub trait PartitionAssignor: Send + Sync {
    fn name(&self) -> &'static str;
    fn assign(&self, context: &AssignmentContext<'_>) -> Assignment;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStrategy {
    #[default]
    RoundRobin,
    Range,
}

impl AssignmentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStrategy::RoundRobin => "roundrobin",
            AssignmentStrategy::Range => "range",
        }
    }

    pub fn assignor(&self) -> Box<dyn PartitionAssignor> {
        match self {
            AssignmentStrategy::RoundRobin => Box::new(RoundRobinAssignor),
            AssignmentStrategy::Range => Box::new(RangeAssignor),
        }
    }
}

impl FromStr for AssignmentStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "roundrobin" => Ok(AssignmentStrategy::RoundRobin),
            "range" => Ok(AssignmentStrategy::Range),
            other => Err(ConfigError::Invalid {
                key: "ASSIGNMENT_STRATEGY",
                reason: format!("unknown strategy '{other}'"),
            }),
        }
    }
}

/// The slice of a global assignment owned by one member.
pub fn member_slice(assignment: &Assignment, member_id: &MemberId) -> Vec<TopicPartition> {
    assignment.get(member_id).cloned().unwrap_or_default()
}
