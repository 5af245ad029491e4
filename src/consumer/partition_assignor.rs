use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use tracing::debug;

use crate::{
    consumer::sticky::{
        user_data::{StickyMemberMetadata, StickyUserData, UserDataDecoder},
        BalanceStats, Balancer, StickyOptions,
    },
    error::Result,
    metadata::PartitionUniverse,
    MemberId, TopicPartition,
};

/// member => topic => partitions, partitions sorted ascending.
pub type Plan = BTreeMap<MemberId, BTreeMap<String, Vec<i32>>>;

pub trait PartitionAssigner {
    fn name(&self) -> &'static str;

    /// Decides which member consumes which partition of `topics`, a map from
    /// topic to its partition ids.
    fn assign(&self, members: Vec<GroupMember>, topics: &HashMap<String, Vec<i32>>) -> Plan;

    /// User data this member sends along with its subscription.
    fn subscription_user_data(&self) -> Result<Option<Bytes>> {
        Ok(None)
    }

    fn on_assignment(&mut self, _assignment: Assignment, _generation: i32) -> Result<()> {
        Ok(())
    }
}

/// A member of the group as seen by the leader when assigning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupMember {
    pub id: MemberId,
    /// Version of the user data format.
    pub version: i16,
    pub topics: Vec<String>,
    pub user_data: Bytes,
}

impl GroupMember {
    pub fn new<S, I, T>(id: S, topics: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            id: id.into(),
            version: StickyMemberMetadata::MAX_VERSION,
            topics: topics.into_iter().map(Into::into).collect(),
            user_data: Bytes::new(),
        }
    }

    pub fn version(mut self, version: i16) -> Self {
        self.version = version;
        self
    }

    pub fn user_data<B: Into<Bytes>>(mut self, user_data: B) -> Self {
        self.user_data = user_data.into();
        self
    }

    /// Sets the user data to the sticky encoding of `partitions`, at the
    /// member's current version.
    pub fn sticky_user_data<I>(mut self, partitions: I, generation: i32) -> Result<Self>
    where
        I: IntoIterator<Item = TopicPartition>,
    {
        self.user_data = StickyMemberMetadata::new(partitions, generation).encode(self.version)?;
        Ok(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    pub partitions: BTreeMap<String, Vec<i32>>,
}

impl Assignment {
    pub fn new(partitions: BTreeMap<String, Vec<i32>>) -> Self {
        Self { partitions }
    }

    /// Splits a plan into the assignment of every member.
    pub fn from_plan(plan: Plan) -> HashMap<MemberId, Assignment> {
        plan.into_iter()
            .map(|(member, partitions)| (member, Assignment::new(partitions)))
            .collect()
    }

    pub fn topic_partitions(&self) -> impl Iterator<Item = TopicPartition> + '_ {
        self.partitions.iter().flat_map(|(topic, partitions)| {
            partitions
                .iter()
                .map(move |partition| TopicPartition::new(topic.as_str(), *partition))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.values().all(Vec::is_empty)
    }
}

/// The sticky assignor serves two purposes. First, it guarantees an assignment that is as
/// balanced as possible, meaning either:
/// - the numbers of topic partitions assigned to consumers differ by at most one; or
/// - each consumer that has 2+ fewer topic partitions than some other consumer cannot get any of
/// those topic partitions transferred to it.
///
/// Second, it preserves as many existing assignments as possible when a reassignment occurs, so
/// that fewer partitions move from one consumer to another. The first goal takes precedence over
/// the second one.
///
/// Each member remembers what it was assigned and in which generation, and sends it back as
/// subscription user data on the next rebalance. When two members claim the same partition, the
/// claim from the most recent generation wins.
///
/// **Example**. There are three consumers C0, C1, C2, and three topics t0, t1, t2, with 1, 2,
/// and 3 partitions respectively. C0 is subscribed to t0; C1 is subscribed to t0, t1; and C2 is
/// subscribed to t0, t1, t2. Assigning from scratch gives:
///
/// - C0 [t0p0]
/// - C1 [t1p0, t1p1]
/// - C2 [t2p0, t2p1, t2p2]
///
/// If C0 leaves, only t0p0 moves:
///
/// - C1 [t0p0, t1p0, t1p1]
/// - C2 [t2p0, t2p1, t2p2]
#[derive(Debug, Clone, Default)]
pub struct StickyAssignor<D = StickyUserData> {
    options: StickyOptions,
    decoder: D,
    current: Option<StickyMemberMetadata>,
}

impl StickyAssignor {
    pub fn new(options: StickyOptions) -> Self {
        Self::with_decoder(options, StickyUserData)
    }
}

impl<D: UserDataDecoder> StickyAssignor<D> {
    pub fn with_decoder(options: StickyOptions, decoder: D) -> Self {
        Self {
            options,
            decoder,
            current: None,
        }
    }

    pub fn options(&self) -> &StickyOptions {
        &self.options
    }

    pub fn balance(
        &self,
        members: Vec<GroupMember>,
        universe: &PartitionUniverse,
    ) -> (Plan, BalanceStats) {
        Balancer::new(members, universe, &self.decoder, &self.options).run()
    }
}

impl<D: UserDataDecoder> PartitionAssigner for StickyAssignor<D> {
    fn name(&self) -> &'static str {
        "sticky"
    }

    fn assign(&self, members: Vec<GroupMember>, topics: &HashMap<String, Vec<i32>>) -> Plan {
        self.balance(members, &PartitionUniverse::from(topics)).0
    }

    fn subscription_user_data(&self) -> Result<Option<Bytes>> {
        match &self.current {
            Some(current) => current
                .encode(StickyMemberMetadata::MAX_VERSION)
                .map(Some),
            None => Ok(None),
        }
    }

    fn on_assignment(&mut self, assignment: Assignment, generation: i32) -> Result<()> {
        debug!(
            "assigned {} partitions in generation {generation}",
            assignment.topic_partitions().count()
        );
        self.current = Some(StickyMemberMetadata::new(
            assignment.topic_partitions(),
            generation,
        ));
        Ok(())
    }
}
