use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::{
    consumer::{
        partition_assignor::GroupMember,
        sticky::user_data::{UserDataDecoder, DEFAULT_GENERATION},
    },
    MemberId, TopicPartition,
};

/// The assignment the group had before this rebalance, as far as it can be
/// recovered from member user data.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PriorPlan {
    pub(crate) partitions: BTreeMap<MemberId, Vec<TopicPartition>>,
    /// No member reported owning anything: the group is assigned from scratch.
    pub(crate) fresh: bool,
}

struct Claim<'a> {
    member: &'a str,
    generation: i32,
}

/// Decodes every member's user data and settles partitions claimed by more
/// than one member.
///
/// A member may rejoin with user data from an older generation and claim a
/// partition that has moved on since; the claim from the highest generation
/// wins. Claims sharing a generation should not happen, only the first one
/// seen is kept. `members` must be sorted by id.
pub(crate) fn reconcile(members: &[GroupMember], decoder: &dyn UserDataDecoder) -> PriorPlan {
    let mut claims: BTreeMap<TopicPartition, Vec<Claim>> = BTreeMap::new();

    for member in members {
        let (partitions, generation) = match decoder.decode(member.version, &member.user_data) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(
                    "ignoring user data of member {}, version {}: {err}",
                    member.id, member.version
                );
                (Vec::new(), DEFAULT_GENERATION)
            }
        };
        debug!(
            "member {} reports {} partitions at generation {generation}",
            member.id,
            partitions.len()
        );

        for partition in partitions {
            let partition_claims = claims.entry(partition).or_default();
            if let Some(other) = partition_claims
                .iter()
                .find(|claim| claim.generation == generation)
            {
                debug!(
                    "dropping claim of member {} at generation {generation}, already claimed by {}",
                    member.id, other.member
                );
                continue;
            }
            partition_claims.push(Claim {
                member: &member.id,
                generation,
            });
        }
    }

    let mut partitions: BTreeMap<MemberId, Vec<TopicPartition>> = BTreeMap::new();
    for (partition, partition_claims) in claims {
        let mut winner: Option<&Claim> = None;
        for claim in &partition_claims {
            if winner.map_or(true, |winner| claim.generation > winner.generation) {
                winner = Some(claim);
            }
        }
        if let Some(winner) = winner {
            if partition_claims.len() > 1 {
                debug!(
                    "{partition} claimed by {} members, keeping {} at generation {}",
                    partition_claims.len(),
                    winner.member,
                    winner.generation
                );
            }
            partitions
                .entry(winner.member.to_owned())
                .or_default()
                .push(partition);
        }
    }

    let fresh = partitions.is_empty();
    PriorPlan { partitions, fresh }
}
