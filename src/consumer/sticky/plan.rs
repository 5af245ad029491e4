use std::collections::{BTreeMap, BTreeSet};

use fxhash::FxHashMap;
use tracing::trace;

use crate::{consumer::partition_assignor::Plan, MemberId, TopicPartition};

/// The plan being balanced: which member owns which partitions.
///
/// Besides the plan itself this keeps two views that must never drift from
/// it: the members ordered by how many partitions they own, and the owner of
/// every assigned partition. Ownership only changes through [`assign`] and
/// [`reassign`], which update all three together.
///
/// [`assign`]: MemberPlan::assign
/// [`reassign`]: MemberPlan::reassign
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct MemberPlan {
    partitions: BTreeMap<MemberId, Vec<TopicPartition>>,
    // (owned count, member); the count goes first so that iteration runs from
    // the least to the most loaded member, ties broken by member id
    by_load: BTreeSet<(usize, MemberId)>,
    owners: FxHashMap<TopicPartition, MemberId>,
}

impl MemberPlan {
    /// Builds the plan from partitions that are already known to have a
    /// single owner.
    pub(crate) fn new(partitions: BTreeMap<MemberId, Vec<TopicPartition>>) -> Self {
        let mut by_load = BTreeSet::new();
        let mut owners = FxHashMap::default();
        for (member, owned) in &partitions {
            by_load.insert((owned.len(), member.clone()));
            for partition in owned {
                let previous = owners.insert(partition.clone(), member.clone());
                debug_assert!(previous.is_none(), "{partition} owned twice");
            }
        }
        Self {
            partitions,
            by_load,
            owners,
        }
    }

    pub(crate) fn num_members(&self) -> usize {
        self.partitions.len()
    }

    pub(crate) fn num_assigned(&self) -> usize {
        self.owners.len()
    }

    pub(crate) fn load(&self, member: &str) -> usize {
        self.partitions.get(member).map_or(0, Vec::len)
    }

    pub(crate) fn owner(&self, partition: &TopicPartition) -> Option<&MemberId> {
        self.owners.get(partition)
    }

    pub(crate) fn owns(&self, member: &str, partition: &TopicPartition) -> bool {
        self.owner(partition).map_or(false, |owner| owner == member)
    }

    /// Members from the least to the most loaded.
    pub(crate) fn ascending(&self) -> impl Iterator<Item = (usize, &MemberId)> {
        self.by_load.iter().map(|(load, member)| (*load, member))
    }

    pub(crate) fn min_load(&self) -> usize {
        self.by_load.first().map_or(0, |(load, _)| *load)
    }

    pub(crate) fn max_load(&self) -> usize {
        self.by_load.last().map_or(0, |(load, _)| *load)
    }

    /// Gives an unowned partition to `member`.
    pub(crate) fn assign(&mut self, partition: TopicPartition, member: &str) {
        debug_assert!(!self.owners.contains_key(&partition));
        let Some(owned) = self.partitions.get_mut(member) else {
            return;
        };
        self.by_load.remove(&(owned.len(), member.to_owned()));
        owned.push(partition.clone());
        self.by_load.insert((owned.len(), member.to_owned()));
        self.owners.insert(partition, member.to_owned());
    }

    /// Moves `partition` from `src` to `dst`. The only way ownership changes
    /// once balancing has started.
    pub(crate) fn reassign(&mut self, partition: &TopicPartition, src: &str, dst: &str) {
        debug_assert!(self.owns(src, partition), "{src} does not own {partition}");
        if src == dst || !self.partitions.contains_key(dst) {
            return;
        }
        let Some(owned) = self.partitions.get_mut(src) else {
            return;
        };
        let Some(idx) = owned.iter().position(|owned| owned == partition) else {
            return;
        };

        // entries must leave the index before their sort key changes
        self.by_load.remove(&(owned.len(), src.to_owned()));
        owned.swap_remove(idx);
        self.by_load.insert((owned.len(), src.to_owned()));

        if let Some(owned) = self.partitions.get_mut(dst) {
            self.by_load.remove(&(owned.len(), dst.to_owned()));
            owned.push(partition.clone());
            self.by_load.insert((owned.len(), dst.to_owned()));
        }

        self.owners.insert(partition.clone(), dst.to_owned());
        trace!("reassigned {partition} from {src} to {dst}");
    }

    /// How unevenly the partitions are spread: the sum, over every pair of
    /// members, of the difference in how many partitions they own. Zero is a
    /// perfectly even plan.
    pub(crate) fn balance_score(&self) -> usize {
        // with loads sorted ascending, the i-th load is larger than or equal
        // to each of the i loads before it
        let mut score = 0;
        let mut preceding = 0;
        for (i, (load, _)) in self.by_load.iter().enumerate() {
            score += load * i - preceding;
            preceding += load;
        }
        score
    }

    pub(crate) fn into_plan(self) -> Plan {
        self.partitions
            .into_iter()
            .map(|(member, owned)| {
                let mut topics: BTreeMap<String, Vec<i32>> = BTreeMap::new();
                for TopicPartition { topic, partition } in owned {
                    topics.entry(topic).or_default().push(partition);
                }
                topics.values_mut().for_each(|partitions| partitions.sort_unstable());
                (member, topics)
            })
            .collect()
    }

    /// Panics if the load index or the owner map disagree with the plan.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let expected: BTreeSet<_> = self
            .partitions
            .iter()
            .map(|(member, owned)| (owned.len(), member.clone()))
            .collect();
        assert_eq!(expected, self.by_load);

        let mut owned = 0;
        for (member, partitions) in &self.partitions {
            for partition in partitions {
                assert_eq!(Some(member), self.owners.get(partition));
                owned += 1;
            }
        }
        assert_eq!(owned, self.owners.len());
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn tp(partition: i32) -> TopicPartition {
        TopicPartition::new("t0", partition)
    }

    fn plan(members: Vec<(&str, Vec<i32>)>) -> MemberPlan {
        MemberPlan::new(
            members
                .into_iter()
                .map(|(member, partitions)| {
                    (member.to_string(), partitions.into_iter().map(tp).collect())
                })
                .collect(),
        )
    }

    /// The pairwise definition the closed form in `balance_score` must agree with.
    fn pairwise_score(plan: &MemberPlan) -> usize {
        let loads: Vec<_> = plan.ascending().map(|(load, _)| load).collect();
        let mut score = 0;
        for (i, a) in loads.iter().enumerate() {
            for b in &loads[i + 1..] {
                score += a.abs_diff(*b);
            }
        }
        score
    }

    #[test]
    fn ascending_breaks_ties_by_member() {
        let plan = plan(vec![("c", vec![0]), ("b", vec![1, 2]), ("a", vec![3])]);
        plan.assert_consistent();

        assert_eq!(
            vec![(1, "a"), (1, "c"), (2, "b")],
            plan.ascending()
                .map(|(load, member)| (load, member.as_str()))
                .collect::<Vec<_>>()
        );
        assert_eq!(1, plan.min_load());
        assert_eq!(2, plan.max_load());
    }

    #[test]
    fn reassign_keeps_views_in_step() {
        let mut plan = plan(vec![("a", vec![0, 1, 2]), ("b", vec![])]);

        plan.reassign(&tp(1), "a", "b");
        plan.assert_consistent();
        assert_eq!(2, plan.load("a"));
        assert_eq!(1, plan.load("b"));
        assert_eq!(Some(&"b".to_string()), plan.owner(&tp(1)));
        assert!(plan.owns("a", &tp(0)));
        assert!(!plan.owns("a", &tp(1)));

        assert_eq!(
            vec![(1, "b"), (2, "a")],
            plan.ascending()
                .map(|(load, member)| (load, member.as_str()))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn assign_unowned_partition() {
        let mut plan = plan(vec![("a", vec![0]), ("b", vec![])]);
        plan.assign(tp(5), "b");
        plan.assert_consistent();
        assert_eq!(2, plan.num_assigned());
        assert!(plan.owns("b", &tp(5)));
    }

    #[test]
    fn balance_score_sums_pairwise_deltas() {
        assert_eq!(0, plan(vec![("a", vec![0]), ("b", vec![1])]).balance_score());
        assert_eq!(0, plan(vec![]).balance_score());

        let uneven = plan(vec![
            ("a", vec![0, 1, 2, 3]),
            ("b", vec![4]),
            ("c", vec![]),
            ("d", vec![5, 6]),
        ]);
        // |4-1| + |4-0| + |4-2| + |1-0| + |1-2| + |0-2|
        assert_eq!(13, uneven.balance_score());
        assert_eq!(pairwise_score(&uneven), uneven.balance_score());
    }

    #[test]
    fn into_plan_groups_and_sorts_by_topic() {
        let plan = MemberPlan::new(
            [
                (
                    "a".to_string(),
                    vec![
                        TopicPartition::new("t1", 2),
                        TopicPartition::new("t0", 1),
                        TopicPartition::new("t1", 0),
                    ],
                ),
                ("b".to_string(), vec![]),
            ]
            .into_iter()
            .collect(),
        );

        let plan = plan.into_plan();
        assert_eq!(2, plan.len());
        assert!(plan["b"].is_empty());
        assert_eq!(vec![1], plan["a"]["t0"]);
        assert_eq!(vec![0, 2], plan["a"]["t1"]);
    }
}
