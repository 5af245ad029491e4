use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

#[derive(Debug, Clone, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new<S: Into<String>>(topic: S, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Every topic and partition the assignor knows of.
///
/// Topics a member subscribes to that are missing here are ignored when
/// building eligibility, and partitions a member claims that are missing here
/// are dropped from the plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionUniverse {
    topics: BTreeMap<String, BTreeSet<i32>>,
}

impl PartitionUniverse {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_topic<S: Into<String>, I: IntoIterator<Item = i32>>(
        &mut self,
        topic: S,
        partitions: I,
    ) {
        self.topics
            .entry(topic.into())
            .or_default()
            .extend(partitions);
    }

    pub fn topic_partitions(&self, topic: &str) -> impl Iterator<Item = TopicPartition> + '_ {
        self.topics
            .get_key_value(topic)
            .into_iter()
            .flat_map(|(topic, partitions)| {
                partitions
                    .iter()
                    .map(move |partition| TopicPartition::new(topic.clone(), *partition))
            })
    }
}

impl From<&HashMap<String, Vec<i32>>> for PartitionUniverse {
    fn from(topics: &HashMap<String, Vec<i32>>) -> Self {
        let mut universe = PartitionUniverse::new();
        for (topic, partitions) in topics {
            universe.add_topic(topic.clone(), partitions.iter().copied());
        }
        universe
    }
}

impl<S: Into<String>, I: IntoIterator<Item = i32>> FromIterator<(S, I)> for PartitionUniverse {
    fn from_iter<T: IntoIterator<Item = (S, I)>>(iter: T) -> Self {
        let mut universe = PartitionUniverse::new();
        for (topic, partitions) in iter {
            universe.add_topic(topic, partitions);
        }
        universe
    }
}
