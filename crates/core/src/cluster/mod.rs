// Cluster distributor: remote command channel, sessions, install/run/serve

pub mod client;
pub mod distributor;
pub mod install;
pub mod net;
pub mod remote;
pub mod serve;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use client::SchedulerClient;
pub use distributor::{ClusterDistributor, PartitionOutcome, RunReport};
pub use install::{DestinationOutcome, InstallReport, StepOutcome};
pub use net::{default_ipv4, find_free_port, host_of, is_local};
pub use remote::{BackgroundJobs, CommandOutput, CommandRunner, FlushedJob, ShellRunner};
pub use serve::{ServeAction, ServeOptions, ServePayload};
pub use session::{ClusterSession, SessionCounters, SessionSnapshot, SessionStatus, WorkerProcess};
