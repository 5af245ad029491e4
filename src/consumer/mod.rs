pub mod partition_assignor;
pub mod sticky;
