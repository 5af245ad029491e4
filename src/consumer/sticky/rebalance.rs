use tracing::{debug, trace, warn};

use crate::{
    consumer::sticky::{
        downstream::{Downstreams, Hop},
        plan::MemberPlan,
        potential::PotentialConsumers,
    },
    MemberId, TopicPartition,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RebalanceOutcome {
    /// Full or partial ascents through the members, including the final one
    /// that found nothing to move.
    pub(crate) passes: usize,
    pub(crate) reassignments: usize,
}

struct StealCandidates {
    /// How many partitions each candidate owner has.
    load: usize,
    /// (owner, partition) pairs, the first is the preferred steal.
    candidates: Vec<(MemberId, TopicPartition)>,
}

/// Moves partitions from more loaded to less loaded members until no member
/// can even out the plan any further.
///
/// Every pass ascends the members from the least loaded. The first member
/// that can take a partition in a way that evens out the plan does so, and
/// the pass ends there since the load order changed. A pass that moves
/// nothing ends the rebalance.
///
/// Each move hands one partition from a member to one that owns at least two
/// partitions fewer, possibly through a chain of members that each pass one
/// partition along. That strictly lowers the balance score, so the number of
/// passes is bounded.
pub(crate) struct Rebalancer<'a> {
    plan: &'a mut MemberPlan,
    potential: &'a PotentialConsumers,
    max_passes: Option<usize>,
}

impl<'a> Rebalancer<'a> {
    pub(crate) fn new(plan: &'a mut MemberPlan, potential: &'a PotentialConsumers) -> Self {
        Self {
            plan,
            potential,
            max_passes: None,
        }
    }

    pub(crate) fn max_passes(mut self, max_passes: Option<usize>) -> Self {
        self.max_passes = max_passes;
        self
    }

    pub(crate) fn run(mut self) -> RebalanceOutcome {
        let mut outcome = RebalanceOutcome::default();
        loop {
            if let Some(max_passes) = self.max_passes {
                if outcome.passes >= max_passes {
                    warn!("stopping rebalance after {max_passes} passes, plan may be uneven");
                    break;
                }
            }
            outcome.passes += 1;

            let moved = self.pass();
            if moved == 0 {
                break;
            }
            outcome.reassignments += moved;
        }
        debug!(
            "rebalanced in {} passes, {} partitions moved",
            outcome.passes, outcome.reassignments
        );
        outcome
    }

    /// One ascent through the members. Returns how many partitions moved.
    fn pass(&mut self) -> usize {
        let mut downstreams = Downstreams::default();
        let members: Vec<(usize, MemberId)> = self
            .plan
            .ascending()
            .map(|(load, member)| (load, member.clone()))
            .collect();

        for (load, member) in members {
            if downstreams.is_registered(&member) {
                trace!("{member} is downstream, skipping");
                continue;
            }
            if load == self.potential.num_partitions_of(&member) {
                trace!("{member} owns every partition it can");
                continue;
            }

            let Some(StealCandidates { load: most, candidates }) =
                self.steal_candidates(&member, load, &downstreams)
            else {
                trace!("{member} has no steal candidates");
                continue;
            };

            let moved = if most >= load + 2 {
                let (owner, partition) = &candidates[0];
                debug!("{member}: stealing {partition} from {owner}");
                self.apply(&[Hop {
                    src: owner.clone(),
                    dst: member.clone(),
                    partition: partition.clone(),
                }])
            } else if most == load + 1 {
                self.steal_for_downstream(&member, most, &candidates, &mut downstreams)
            } else {
                self.steal_through_upstream(&member, &candidates, &mut downstreams)
            };

            if moved > 0 {
                return moved;
            }
        }
        0
    }

    /// Owners of partitions `member` could take that are more loaded than
    /// `member`, or as loaded but themselves waiting to take from someone.
    /// Only the owners with the highest load are kept.
    fn steal_candidates(
        &self,
        member: &str,
        load: usize,
        downstreams: &Downstreams,
    ) -> Option<StealCandidates> {
        let mut most = 0;
        let mut candidates = Vec::new();
        for partition in self.potential.partitions_of(member) {
            let Some(owner) = self.plan.owner(partition) else {
                continue;
            };
            if owner == member {
                continue;
            }
            let owner_load = self.plan.load(owner);
            let qualifies =
                owner_load > load || (owner_load == load && downstreams.is_registered(owner));
            if !qualifies || owner_load < most {
                continue;
            }
            if owner_load > most {
                most = owner_load;
                candidates.clear();
            }
            candidates.push((owner.clone(), partition.clone()));
        }

        if candidates.is_empty() {
            None
        } else {
            Some(StealCandidates {
                load: most,
                candidates,
            })
        }
    }

    /// The candidates own exactly one partition more than `member`. Taking
    /// one only helps if somebody less loaded is waiting on `member`, in which
    /// case `member` takes and passes a partition down the waiting chain.
    /// Otherwise `member` registers as waiting on every candidate.
    fn steal_for_downstream(
        &mut self,
        member: &str,
        most: usize,
        candidates: &[(MemberId, TopicPartition)],
        downstreams: &mut Downstreams,
    ) -> usize {
        if downstreams.has_wanters(member) {
            let downstream = downstreams.downstream_of(member);
            let sink = downstream.last().map_or(member, |hop| hop.dst.as_str());
            if most >= self.plan.load(sink) + 2 {
                let (owner, partition) = &candidates[0];
                debug!(
                    "{member}: stealing {partition} from {owner}, bubbling {} hops downstream",
                    downstream.len()
                );
                let mut chain = vec![Hop {
                    src: owner.clone(),
                    dst: member.to_owned(),
                    partition: partition.clone(),
                }];
                chain.extend(downstream);
                return self.apply(&chain);
            }
        }

        register(member, candidates, downstreams);
        0
    }

    /// The candidates own as many partitions as `member` and are waiting to
    /// take from someone themselves. `member` joins the wait, and if the top
    /// of the chain it now hangs from owns at least two partitions more than
    /// the bottom of the chain waiting on `member`, one partition moves along
    /// every link from top to bottom.
    fn steal_through_upstream(
        &mut self,
        member: &str,
        candidates: &[(MemberId, TopicPartition)],
        downstreams: &mut Downstreams,
    ) -> usize {
        register(member, candidates, downstreams);

        let upstream = downstreams.upstream_of(member);
        let Some(top) = upstream.first().map(|hop| hop.src.clone()) else {
            return 0;
        };
        let downstream = downstreams.downstream_of(member);
        let sink = downstream.last().map_or(member, |hop| hop.dst.as_str());

        let (top_load, sink_load) = (self.plan.load(&top), self.plan.load(sink));
        if top_load < sink_load + 2 {
            trace!(
                "{member}: bubbling from {top} ({top_load}) to {sink} ({sink_load}) would not help"
            );
            return 0;
        }

        debug!(
            "{member}: bubbling {} hops down from {top}, {} hops downstream",
            upstream.len(),
            downstream.len()
        );
        let mut chain = upstream;
        chain.extend(downstream);
        self.apply(&chain)
    }

    /// Moves every partition of `chain`, or nothing if any hop is no longer
    /// possible.
    fn apply(&mut self, chain: &[Hop]) -> usize {
        let valid = chain.iter().all(|hop| {
            self.plan.owns(&hop.src, &hop.partition)
                && self.potential.can_consume(&hop.dst, &hop.partition)
        });
        debug_assert!(valid, "invalid chain {chain:?}");
        if !valid {
            return 0;
        }

        for hop in chain {
            self.plan.reassign(&hop.partition, &hop.src, &hop.dst);
        }
        chain.len()
    }
}

fn register(
    member: &str,
    candidates: &[(MemberId, TopicPartition)],
    downstreams: &mut Downstreams,
) {
    for (owner, partition) in candidates {
        trace!("{member}: registering downstream of {owner} for {partition}");
        downstreams.add_partition_want(owner, member, partition);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{consumer::partition_assignor::GroupMember, metadata::PartitionUniverse};

    struct Fixture {
        plan: MemberPlan,
        potential: PotentialConsumers,
    }

    /// `members` are (id, subscribed topics, owned partitions as (topic, index)).
    fn fixture(
        topics: &[(&str, i32)],
        members: &[(&str, &[&str], &[(&str, i32)])],
    ) -> Fixture {
        let universe: PartitionUniverse = topics
            .iter()
            .map(|(topic, partitions)| (*topic, 0..*partitions))
            .collect();
        let group: Vec<_> = members
            .iter()
            .map(|(id, subscribed, _)| GroupMember::new(*id, subscribed.iter().copied()))
            .collect();
        let owned: BTreeMap<_, _> = members
            .iter()
            .map(|(id, _, owned)| {
                (
                    id.to_string(),
                    owned
                        .iter()
                        .map(|(topic, partition)| TopicPartition::new(*topic, *partition))
                        .collect::<Vec<_>>(),
                )
            })
            .collect();
        Fixture {
            plan: MemberPlan::new(owned),
            potential: PotentialConsumers::new(&group, &universe),
        }
    }

    fn loads(plan: &MemberPlan, members: &[&str]) -> Vec<usize> {
        members.iter().map(|member| plan.load(member)).collect()
    }

    #[test]
    fn steals_from_much_more_loaded() {
        let mut fixture = fixture(
            &[("t", 4)],
            &[
                ("a", &["t"], &[("t", 0), ("t", 1), ("t", 2), ("t", 3)]),
                ("b", &["t"], &[]),
            ],
        );

        let outcome = Rebalancer::new(&mut fixture.plan, &fixture.potential).run();
        fixture.plan.assert_consistent();

        assert_eq!(vec![2, 2], loads(&fixture.plan, &["a", "b"]));
        assert_eq!(2, outcome.reassignments);
        assert_eq!(3, outcome.passes);
    }

    #[test]
    fn neutral_steal_is_left_alone() {
        let mut fixture = fixture(
            &[("t", 3)],
            &[
                ("a", &["t"], &[("t", 0), ("t", 1)]),
                ("b", &["t"], &[("t", 2)]),
            ],
        );
        let before = fixture.plan.clone();

        let outcome = Rebalancer::new(&mut fixture.plan, &fixture.potential).run();

        assert_eq!(0, outcome.reassignments);
        assert_eq!(1, outcome.passes);
        assert_eq!(before, fixture.plan);
    }

    #[test]
    fn two_hop_chain_through_downstream() {
        // a can only take from b, b can take from c: c gives to b, b hands
        // one of its x partitions down to a
        let mut fixture = fixture(
            &[("x", 2), ("y", 4)],
            &[
                ("a", &["x"], &[("x", 0)]),
                ("b", &["x", "y"], &[("x", 1), ("y", 0)]),
                ("c", &["y"], &[("y", 1), ("y", 2), ("y", 3)]),
            ],
        );

        let outcome = Rebalancer::new(&mut fixture.plan, &fixture.potential).run();
        fixture.plan.assert_consistent();

        assert_eq!(vec![2, 2, 2], loads(&fixture.plan, &["a", "b", "c"]));
        assert_eq!(2, outcome.reassignments);
        assert!(fixture.plan.owns("a", &TopicPartition::new("x", 1)));
        assert!(fixture.plan.owns("b", &TopicPartition::new("y", 0)));
        assert!(fixture.plan.owns("b", &TopicPartition::new("y", 1)));
    }

    #[test]
    fn three_hop_chain_through_equally_loaded_member() {
        // w can only take from m, m only from o, o only from u; only moving a
        // partition along the whole chain u -> o -> m -> w evens the plan
        let mut fixture = fixture(
            &[("tw", 1), ("tm", 2), ("to", 2), ("tu", 3)],
            &[
                ("w", &["tw", "tm"], &[("tw", 0)]),
                ("b_o", &["to", "tu"], &[("to", 0), ("to", 1)]),
                ("c_m", &["tm", "to"], &[("tm", 0), ("tm", 1)]),
                ("d_u", &["tu"], &[("tu", 0), ("tu", 1), ("tu", 2)]),
            ],
        );

        let outcome = Rebalancer::new(&mut fixture.plan, &fixture.potential).run();
        fixture.plan.assert_consistent();

        assert_eq!(
            vec![2, 2, 2, 2],
            loads(&fixture.plan, &["w", "b_o", "c_m", "d_u"])
        );
        assert_eq!(3, outcome.reassignments);
        assert_eq!(2, outcome.passes);
    }

    #[test]
    fn members_without_eligible_partitions_are_skipped() {
        let mut fixture = fixture(
            &[("t", 2)],
            &[
                ("a", &["t"], &[("t", 0), ("t", 1)]),
                ("b", &["gone"], &[]),
            ],
        );

        let outcome = Rebalancer::new(&mut fixture.plan, &fixture.potential).run();

        assert_eq!(0, outcome.reassignments);
        assert_eq!(vec![2, 0], loads(&fixture.plan, &["a", "b"]));
    }

    #[test]
    fn max_passes_caps_the_loop() {
        let mut fixture = fixture(
            &[("t", 6)],
            &[
                (
                    "a",
                    &["t"],
                    &[("t", 0), ("t", 1), ("t", 2), ("t", 3), ("t", 4), ("t", 5)],
                ),
                ("b", &["t"], &[]),
            ],
        );

        let outcome = Rebalancer::new(&mut fixture.plan, &fixture.potential)
            .max_passes(Some(1))
            .run();
        fixture.plan.assert_consistent();

        assert_eq!(1, outcome.passes);
        assert_eq!(vec![5, 1], loads(&fixture.plan, &["a", "b"]));
    }
}
