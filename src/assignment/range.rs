use super::{AssignmentContext, PartitionAssignor};
use crate::models::{Assignment, TopicPartition};

/// Per topic, contiguous partition ranges over the sorted subscribers.
/// With 7 partitions and 3 members: [0,1,2] [3,4] [5,6].
#[derive(Debug, Default, Clone, Copy)]
pub struct RangeAssignor;

impl PartitionAssignor for RangeAssignor {
    fn name(&self) -> &'static str {
        "range"
    }

    fn assign(&self, context: &AssignmentContext<'_>) -> Assignment {
        let mut assignment = context.empty_assignment();
        let members = context.sorted_members();

        let mut topics: Vec<_> = context.topics.iter().collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        topics.dedup_by(|a, b| a.name == b.name);

        for topic in topics {
            let subscribers: Vec<_> = members
                .iter()
                .filter(|m| m.topics.contains(&topic.name))
                .collect();
            if subscribers.is_empty() || topic.partition_count <= 0 {
                continue;
            }

            let per_member = topic.partition_count / subscribers.len() as i32;
            let extra = topic.partition_count % subscribers.len() as i32;

            let mut next = 0;
            for (idx, member) in subscribers.iter().enumerate() {
                let len = per_member + if (idx as i32) < extra { 1 } else { 0 };
                if let Some(owned) = assignment.get_mut(&member.member_id) {
                    owned.extend((next..next + len).map(|p| TopicPartition::new(topic.name.clone(), p)));
                }
                next += len;
            }
        }

        assignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::tests::member;
    use crate::models::TopicMetadata;

    #[test]
    fn test_uneven_split_front_loads_extra() {
        let members = vec![member("c", &["t"]), member("a", &["t"]), member("b", &["t"])];
        let topics = vec![TopicMetadata {
            name: "t".into(),
            partition_count: 7,
        }];

        let assignment = RangeAssignor.assign(&AssignmentContext {
            members: &members,
            topics: &topics,
        });

        let ids = |m: &str| -> Vec<i32> { assignment[m].iter().map(|tp| tp.partition).collect() };
        assert_eq!(ids("a"), vec![0, 1, 2]);
        assert_eq!(ids("b"), vec![3, 4]);
        assert_eq!(ids("c"), vec![5, 6]);
    }

    #[test]
    fn test_more_members_than_partitions() {
        let members = vec![member("a", &["t"]), member("b", &["t"]), member("c", &["t"])];
        let topics = vec![TopicMetadata {
            name: "t".into(),
            partition_count: 2,
        }];

        let assignment = RangeAssignor.assign(&AssignmentContext {
            members: &members,
            topics: &topics,
        });

        assert_eq!(assignment["a"].len(), 1);
        assert_eq!(assignment["b"].len(), 1);
        assert!(assignment["c"].is_empty());
    }
}
