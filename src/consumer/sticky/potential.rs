use std::collections::{BTreeMap, BTreeSet};

use crate::{
    consumer::partition_assignor::GroupMember, metadata::PartitionUniverse, MemberId,
    TopicPartition,
};

/// Which members could own which partitions, derived once from member
/// subscriptions and never changed afterwards.
#[derive(Debug, Clone, Default)]
pub(crate) struct PotentialConsumers {
    /// partition => every member that could consume it
    partition_consumers: BTreeMap<TopicPartition, BTreeSet<MemberId>>,
    /// member => every partition it could consume
    member_partitions: BTreeMap<MemberId, BTreeSet<TopicPartition>>,
    subscriptions_identical: bool,
}

impl PotentialConsumers {
    pub(crate) fn new(members: &[GroupMember], universe: &PartitionUniverse) -> Self {
        let mut potential = PotentialConsumers::default();
        for member in members {
            let eligible = potential
                .member_partitions
                .entry(member.id.clone())
                .or_default();
            for topic in &member.topics {
                for partition in universe.topic_partitions(topic) {
                    potential
                        .partition_consumers
                        .entry(partition.clone())
                        .or_default()
                        .insert(member.id.clone());
                    eligible.insert(partition);
                }
            }
        }
        potential.subscriptions_identical = potential.all_consumer_sets_equal();
        potential
    }

    fn all_consumer_sets_equal(&self) -> bool {
        let mut consumers = self.partition_consumers.values();
        match consumers.next() {
            Some(first) => consumers.all(|other| other == first),
            None => true,
        }
    }

    /// Whether every partition can be consumed by exactly the same members.
    pub(crate) fn subscriptions_identical(&self) -> bool {
        self.subscriptions_identical
    }

    pub(crate) fn can_consume(&self, member: &str, partition: &TopicPartition) -> bool {
        self.member_partitions
            .get(member)
            .map_or(false, |partitions| partitions.contains(partition))
    }

    pub(crate) fn is_consumable(&self, partition: &TopicPartition) -> bool {
        self.partition_consumers.contains_key(partition)
    }

    pub(crate) fn partitions_of(&self, member: &str) -> impl Iterator<Item = &TopicPartition> {
        self.member_partitions
            .get(member)
            .into_iter()
            .flat_map(BTreeSet::iter)
    }

    pub(crate) fn num_partitions_of(&self, member: &str) -> usize {
        self.member_partitions.get(member).map_or(0, BTreeSet::len)
    }

    pub(crate) fn consumable_partitions(&self) -> impl Iterator<Item = &TopicPartition> {
        self.partition_consumers.keys()
    }
}
