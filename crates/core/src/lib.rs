// Core types and functionality for dagfleet: distributed DAG execution

pub mod cluster;
pub mod config;
pub mod dag;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod metrics;
pub mod types;
pub mod worker;

pub use error::{DistError, Result};
pub use types::*;
