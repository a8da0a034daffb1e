use super::{AssignmentContext, PartitionAssignor};
use crate::models::Assignment;

/// Deals partitions out one at a time over the sorted member list.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinAssignor;

impl PartitionAssignor for RoundRobinAssignor {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    fn assign(&self, context: &AssignmentContext<'_>) -> Assignment {
        let mut assignment = context.empty_assignment();
        let members = context.sorted_members();
        if members.is_empty() {
            return assignment;
        }

        let mut cursor = 0usize;
        for partition in context.sorted_partitions() {
            // next member in the cycle that subscribes to this topic
            let owner = (0..members.len())
                .map(|step| (cursor + step) % members.len())
                .find(|&idx| members[idx].topics.contains(&partition.topic));

            if let Some(idx) = owner {
                if let Some(owned) = assignment.get_mut(&members[idx].member_id) {
                    owned.push(partition);
                }
                cursor = idx + 1;
            }
        }

        assignment
    }
}
