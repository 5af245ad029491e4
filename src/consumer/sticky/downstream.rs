use std::collections::HashSet;

use fxhash::FxHashMap;

use crate::{MemberId, TopicPartition};

/// One partition moving one link along a chain of members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Hop {
    pub(crate) src: MemberId,
    pub(crate) dst: MemberId,
    pub(crate) partition: TopicPartition,
}

/// Members that could take a partition from a more loaded member, but for
/// whom doing so alone would not make the plan any more even.
///
/// If B owns 2 partitions and A owns 3, B taking one from A only swaps their
/// loads, so B registers that it wants one of A's partitions instead. Should A
/// later get a partition from someone owning 4, A hands one down to B and the
/// net effect is the 4 giving to the 2. Chains of such wants can grow longer
/// than two links; they are always unwound through the most recently
/// registered want first.
///
/// The ledger only describes the plan as it was when the wants were
/// registered, so it is thrown away as soon as the plan changes, and a want
/// never has to be marked as served.
#[derive(Debug, Default)]
pub(crate) struct Downstreams {
    /// server => members waiting to take from it, most recent last
    wanters_by_server: FxHashMap<MemberId, Vec<MemberId>>,
    /// wanter => servers in the order they were registered, each with the
    /// partitions the wanter would take from it
    wants: FxHashMap<MemberId, Vec<(MemberId, Vec<TopicPartition>)>>,
}

impl Downstreams {
    /// Registers that `wanter` would take `partition` from `server`.
    pub(crate) fn add_partition_want(
        &mut self,
        server: &str,
        wanter: &str,
        partition: &TopicPartition,
    ) {
        let wants = self.wants.entry(wanter.to_owned()).or_default();
        match wants.iter_mut().find(|(who, _)| who == server) {
            Some((_, partitions)) => partitions.push(partition.clone()),
            None => {
                wants.push((server.to_owned(), vec![partition.clone()]));
                self.wanters_by_server
                    .entry(server.to_owned())
                    .or_default()
                    .push(wanter.to_owned());
            }
        }
    }

    /// Whether `member` is waiting to take a partition from someone.
    pub(crate) fn is_registered(&self, member: &str) -> bool {
        self.wants.contains_key(member)
    }

    /// Whether anybody is waiting to take a partition from `member`.
    pub(crate) fn has_wanters(&self, member: &str) -> bool {
        self.wanters_by_server
            .get(member)
            .map_or(false, |wanters| !wanters.is_empty())
    }

    /// The chain of hand-offs starting at `from`: `from` gives to the member
    /// that most recently registered a want on it, which gives to its own most
    /// recent wanter, and so on until a member nobody waits on.
    pub(crate) fn downstream_of(&self, from: &str) -> Vec<Hop> {
        let mut hops = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(from.to_owned());

        let mut on = from.to_owned();
        while let Some(wanter) = self
            .wanters_by_server
            .get(&on)
            .and_then(|wanters| wanters.last())
        {
            let Some(partition) = self.last_want(wanter, &on) else {
                break;
            };
            if !visited.insert(wanter.clone()) {
                break;
            }
            hops.push(Hop {
                src: on.clone(),
                dst: wanter.clone(),
                partition: partition.clone(),
            });
            on = wanter.clone();
        }
        hops
    }

    /// The chain of hand-offs ending at `to`: `to` takes from the server it
    /// most recently registered a want on, which takes from its own most
    /// recent server, and so on up to a member that wants nothing. Hops are
    /// ordered from the top of the chain down to `to`.
    pub(crate) fn upstream_of(&self, to: &str) -> Vec<Hop> {
        let mut hops = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(to.to_owned());

        let mut on = to.to_owned();
        while let Some((server, partitions)) = self
            .wants
            .get(&on)
            .and_then(|wants| wants.last())
        {
            let Some(partition) = partitions.last() else {
                break;
            };
            if !visited.insert(server.clone()) {
                break;
            }
            hops.push(Hop {
                src: server.clone(),
                dst: on.clone(),
                partition: partition.clone(),
            });
            on = server.clone();
        }
        hops.reverse();
        hops
    }

    fn last_want(&self, wanter: &str, server: &str) -> Option<&TopicPartition> {
        self.wants
            .get(wanter)?
            .iter()
            .find(|(who, _)| who == server)
            .and_then(|(_, partitions)| partitions.last())
    }
}
