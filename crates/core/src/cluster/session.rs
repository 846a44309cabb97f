//! Cluster session: scheduler, worker processes, background jobs and counters.

use super::client::SchedulerClient;
use super::remote::BackgroundJobs;
use crate::error::Result;
use crate::types::ModeBits;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Running,
    Degraded,
    Error,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    /// Whether a session in this state owns live processes
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Degraded)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub running: u32,
    pub unhealthy: u32,
    pub restarted: u32,
}

/// One launched worker process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProcess {
    /// Process name, `<group>-<slot>`
    pub id: String,
    pub address: String,
    pub pid: Option<u32>,
    pub healthy: bool,
}

/// Serializable view of a session, persisted between CLI invocations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub status: SessionStatus,
    pub app: String,
    pub target: String,
    pub mode: ModeBits,
    pub scheduler: Option<String>,
    pub scheduler_pid: Option<u32>,
    pub workers: Vec<WorkerProcess>,
    /// Background jobs that had not finished when the snapshot was taken
    pub pending: Vec<String>,
    pub counters: SessionCounters,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    pub fn new(app: impl Into<String>, target: impl Into<String>, mode: ModeBits) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: SessionStatus::Idle,
            app: app.into(),
            target: target.into(),
            mode,
            scheduler: None,
            scheduler_pid: None,
            workers: Vec::new(),
            pending: Vec::new(),
            counters: SessionCounters::default(),
            started_at: None,
            stopped_at: None,
        }
    }

    /// Addresses of the healthy workers
    pub fn worker_addresses(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|w| w.healthy)
            .map(|w| w.address.clone())
            .collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load a saved snapshot, `None` when nothing was saved.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read(path)?;
        Ok(Some(serde_json::from_slice(&content)?))
    }
}

struct SessionState {
    snapshot: SessionSnapshot,
    client: Option<SchedulerClient>,
}

/// A scheduler plus worker-process group, owned by the caller.
///
/// Reads go through an `RwLock`; `start` and `stop` additionally hold the
/// lifecycle lock so they never interleave.
pub struct ClusterSession {
    lifecycle: Mutex<()>,
    state: RwLock<SessionState>,
    jobs: BackgroundJobs,
}

impl ClusterSession {
    pub fn new(app: impl Into<String>, target: impl Into<String>, mode: ModeBits) -> Self {
        Self::from_snapshot(SessionSnapshot::new(app, target, mode))
    }

    /// Rebuild a session from a persisted snapshot. The scheduler connection is
    /// not restored.
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        Self {
            lifecycle: Mutex::new(()),
            state: RwLock::new(SessionState {
                snapshot,
                client: None,
            }),
            jobs: BackgroundJobs::new(),
        }
    }

    /// Serialize start/stop against each other
    pub async fn lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }

    pub fn jobs(&self) -> &BackgroundJobs {
        &self.jobs
    }

    /// Current snapshot with the live pending-job list
    pub async fn snapshot(&self) -> SessionSnapshot {
        let mut snapshot = self.state.read().await.snapshot.clone();
        let pending = self.jobs.pending().await;
        if !pending.is_empty() {
            snapshot.pending = pending;
        }
        snapshot
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.read().await.snapshot.status
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.client.is_some()
    }

    /// Apply `f` to the snapshot under the write lock
    pub async fn update<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut SessionSnapshot) -> T,
    {
        f(&mut self.state.write().await.snapshot)
    }

    pub async fn set_client(&self, client: SchedulerClient) {
        self.state.write().await.client = Some(client);
    }

    /// Drop the scheduler connection, closing it if one was open
    pub async fn drop_client(&self) {
        let client = self.state.write().await.client.take();
        if let Some(client) = client {
            client.close().await;
        }
    }

    /// Persist the current snapshot to `path`
    pub async fn save(&self, path: &Path) -> Result<()> {
        self.snapshot().await.save(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&SessionStatus::Degraded).unwrap(), "\"degraded\"");
        assert_eq!(SessionStatus::Stopped.to_string(), "stopped");
        assert!(SessionStatus::Running.is_active());
        assert!(!SessionStatus::Idle.is_active());
    }

    #[test]
    fn test_snapshot_round_trip_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("flight/session.json");

        assert!(SessionSnapshot::load(&path).unwrap().is_none());

        let mut snapshot = SessionSnapshot::new("flight", "flight_trajectory", ModeBits::DASK);
        snapshot.status = SessionStatus::Running;
        snapshot.workers.push(WorkerProcess {
            id: "pandas-worker-0".to_string(),
            address: "10.0.0.2".to_string(),
            pid: Some(4242),
            healthy: true,
        });
        snapshot.counters.running = 1;
        snapshot.save(&path).unwrap();

        let loaded = SessionSnapshot::load(&path).unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.worker_addresses(), vec!["10.0.0.2".to_string()]);
    }

    #[tokio::test]
    async fn test_update_is_visible_in_snapshot() {
        let session = ClusterSession::new("flight", "flight", ModeBits::PYTHON);
        assert_eq!(session.status().await, SessionStatus::Idle);

        session
            .update(|s| {
                s.status = SessionStatus::Running;
                s.counters.restarted += 1;
            })
            .await;

        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.status, SessionStatus::Running);
        assert_eq!(snapshot.counters.restarted, 1);
        assert!(!session.is_connected().await);
    }
}
