// DAG execution engine for one destination's partition

pub mod assign;
pub mod executor;
pub mod graph;

pub use assign::{AssignStrategy, RoundRobin, Wrapping};
pub use executor::{DagExecutor, PartitionRun, PartitionState};
pub use graph::PartitionDag;
