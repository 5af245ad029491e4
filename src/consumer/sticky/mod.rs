//! Sticky balancing of partitions over the members of a consumer group.
//!
//! The plan the group had before is recovered from member user data, members
//! keep what they still can consume, partitions nobody owns go to the least
//! loaded member that can take them, and finally partitions are moved from
//! more to less loaded members as long as that makes the plan more even.

mod downstream;
mod plan;
mod potential;
mod rebalance;
mod reconcile;
pub mod user_data;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, info};

use crate::{
    consumer::partition_assignor::{GroupMember, Plan},
    metadata::PartitionUniverse,
    MemberId, TopicPartition,
};

use self::{
    plan::MemberPlan, potential::PotentialConsumers, rebalance::Rebalancer,
    reconcile::reconcile, user_data::UserDataDecoder,
};

#[derive(Debug, Clone)]
pub struct StickyOptions {
    /// Upper bound on passes through the members while rebalancing. The
    /// rebalance always terminates on its own, this only caps how long it may
    /// take on very large groups.
    pub max_passes: Option<usize>,
    /// Throw the rebalanced plan away if it is not more even than the plan
    /// the group already had.
    pub revert_unimproved: bool,
}

impl Default for StickyOptions {
    fn default() -> Self {
        Self {
            max_passes: None,
            revert_unimproved: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceStats {
    /// No member reported a prior assignment.
    pub fresh: bool,
    pub passes: usize,
    /// Partitions moved between members while rebalancing, reverted or not.
    pub reassignments: usize,
    /// The rebalanced plan was dropped in favour of the sticky one.
    pub reverted: bool,
    pub score_before: usize,
    pub score_after: usize,
}

/// Balances `topics` over `members` with the default options and user data
/// decoder.
///
/// Every member appears in the returned plan, possibly owning nothing.
/// Partitions of topics no member subscribes to are left out of the plan.
pub fn balance(members: Vec<GroupMember>, topics: &HashMap<String, Vec<i32>>) -> Plan {
    balance_with_stats(members, topics).0
}

pub fn balance_with_stats(
    members: Vec<GroupMember>,
    topics: &HashMap<String, Vec<i32>>,
) -> (Plan, BalanceStats) {
    Balancer::new(
        members,
        &PartitionUniverse::from(topics),
        &user_data::StickyUserData,
        &StickyOptions::default(),
    )
    .run()
}

pub(crate) struct Balancer<'a> {
    members: Vec<GroupMember>,
    universe: &'a PartitionUniverse,
    decoder: &'a dyn UserDataDecoder,
    options: &'a StickyOptions,
}

impl<'a> Balancer<'a> {
    pub(crate) fn new(
        mut members: Vec<GroupMember>,
        universe: &'a PartitionUniverse,
        decoder: &'a dyn UserDataDecoder,
        options: &'a StickyOptions,
    ) -> Self {
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members.dedup_by(|duplicate, kept| {
            let same = duplicate.id == kept.id;
            if same {
                debug!("ignoring duplicate member {}", duplicate.id);
            }
            same
        });
        Self {
            members,
            universe,
            decoder,
            options,
        }
    }

    pub(crate) fn run(self) -> (Plan, BalanceStats) {
        let prior = reconcile(&self.members, self.decoder);
        let potential = PotentialConsumers::new(&self.members, self.universe);

        let mut plan = self.assign_unassigned_partitions(prior.partitions, &potential);

        let mut stats = BalanceStats {
            fresh: prior.fresh,
            score_before: plan.balance_score(),
            ..Default::default()
        };

        if potential.subscriptions_identical() && plan.max_load() - plan.min_load() <= 1 {
            debug!("subscriptions are identical and the plan is already balanced");
            stats.score_after = stats.score_before;
        } else {
            let pre_balance = plan.clone();
            let outcome = Rebalancer::new(&mut plan, &potential)
                .max_passes(self.options.max_passes)
                .run();
            stats.passes = outcome.passes;
            stats.reassignments = outcome.reassignments;
            stats.score_after = plan.balance_score();

            if self.options.revert_unimproved
                && !prior.fresh
                && outcome.reassignments > 0
                && stats.score_after >= stats.score_before
            {
                debug!(
                    "rebalancing did not improve the plan, score before {}, after {}, keeping \
                     the sticky plan",
                    stats.score_before, stats.score_after
                );
                plan = pre_balance;
                stats.reverted = true;
                stats.score_after = stats.score_before;
            }
        }

        info!(
            "balanced {} partitions over {} members, fresh: {}, moved: {}, reverted: {}, score: \
             {} -> {}",
            plan.num_assigned(),
            plan.num_members(),
            stats.fresh,
            stats.reassignments,
            stats.reverted,
            stats.score_before,
            stats.score_after
        );
        (plan.into_plan(), stats)
    }

    /// Keeps every prior partition its owner can still consume and gives all
    /// other consumable partitions to the least loaded member that can
    /// consume them.
    ///
    /// A prior partition nobody can consume anymore, typically because its
    /// topic was deleted, is dropped. A partition whose owner unsubscribed
    /// from its topic is reassigned, as is every partition nobody owned.
    fn assign_unassigned_partitions(
        &self,
        mut prior: BTreeMap<MemberId, Vec<TopicPartition>>,
        potential: &PotentialConsumers,
    ) -> MemberPlan {
        let mut visited = BTreeSet::new();
        let mut unassigned = Vec::new();
        let mut owned = BTreeMap::new();

        for member in &self.members {
            let partitions = prior.remove(&member.id).unwrap_or_default();
            let mut keep = Vec::with_capacity(partitions.len());
            for partition in partitions {
                if !potential.is_consumable(&partition) {
                    debug!(
                        "dropping {partition} from member {}, nobody can consume it",
                        member.id
                    );
                    continue;
                }
                visited.insert(partition.clone());
                if potential.can_consume(&member.id, &partition) {
                    keep.push(partition);
                } else {
                    debug!(
                        "member {} no longer consumes {partition}, reassigning it",
                        member.id
                    );
                    unassigned.push(partition);
                }
            }
            owned.insert(member.id.clone(), keep);
        }

        unassigned.extend(
            potential
                .consumable_partitions()
                .filter(|partition| !visited.contains(*partition))
                .cloned(),
        );

        let mut plan = MemberPlan::new(owned);
        for partition in unassigned {
            let least_loaded = plan
                .ascending()
                .find(|(_, member)| potential.can_consume(member, &partition))
                .map(|(_, member)| member.clone());
            match least_loaded {
                Some(member) => plan.assign(partition, &member),
                None => debug!("{partition} is orphaned, no member can consume it"),
            }
        }
        plan
    }
}
