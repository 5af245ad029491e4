pub mod consumer;

mod error;
pub use error::{Error, Result};
pub mod metadata;

pub use consumer::{
    partition_assignor::{Assignment, GroupMember, PartitionAssigner, Plan, StickyAssignor},
    sticky::{balance, balance_with_stats, BalanceStats, StickyOptions},
};
pub use metadata::{PartitionUniverse, TopicPartition};

pub type MemberId = String;
