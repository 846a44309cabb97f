//! `serve` lifecycle of a cluster session: start, status, stop and health.

use super::client::SchedulerClient;
use super::distributor::ClusterDistributor;
use super::net::{default_ipv4, find_free_port, host_of, is_local};
use super::remote::shell_quote;
use super::session::{ClusterSession, SessionCounters, SessionSnapshot, SessionStatus, WorkerProcess};
use crate::config::{render_template, AppSettings};
use crate::error::{DistError, Result};
use crate::health::{HealthFormat, HealthOutcome, HealthReport, SlaConfig, SlaOverrides};
use crate::types::{destination_slots, AppEnv, Destinations, ModeBits};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServeAction {
    Start,
    Status,
    Stop,
    Health,
}

impl FromStr for ServeAction {
    type Err = DistError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "status" => Ok(Self::Status),
            "stop" => Ok(Self::Stop),
            "health" => Ok(Self::Health),
            other => Err(DistError::config(format!(
                "unknown serve action '{other}' (expected start, status, stop or health)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// `host` to launch the scheduler on, or `host:port` to attach to a running one
    pub scheduler: Option<String>,
    pub destinations: Destinations,
    pub mode: ModeBits,
    /// Kill the worker processes on `stop`
    pub shutdown_on_stop: bool,
    pub sla: SlaOverrides,
    pub health_output_path: Option<PathBuf>,
    pub health_format: HealthFormat,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            scheduler: None,
            destinations: Destinations::new(),
            mode: ModeBits::DASK,
            shutdown_on_stop: true,
            sla: SlaOverrides::default(),
            health_output_path: None,
            health_format: HealthFormat::Json,
        }
    }
}

/// Payload returned by every `serve` action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServePayload {
    pub status: SessionStatus,
    #[serde(default)]
    pub workers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<SessionCounters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthOutcome>,
}

impl ServePayload {
    fn with_status(status: SessionStatus) -> Self {
        Self {
            status,
            workers: Vec::new(),
            scheduler: None,
            pending: Vec::new(),
            counters: None,
            health: None,
        }
    }

    fn live(snapshot: &SessionSnapshot) -> Self {
        Self {
            status: snapshot.status,
            workers: snapshot.worker_addresses(),
            scheduler: snapshot.scheduler.clone(),
            pending: snapshot.pending.clone(),
            counters: Some(snapshot.counters),
            health: None,
        }
    }
}

/// A worker launch, kept so a failed one can be relaunched
struct Launch {
    id: String,
    address: String,
    command: String,
}

/// `nohup` the command and print the pid of the detached process
fn detached(prefix: &str, command: &str, log_name: &str) -> String {
    format!(
        "{prefix}nohup sh -c {} > /tmp/dagfleet-{log_name}.log 2>&1 & echo $!",
        shell_quote(command)
    )
}

fn parse_pid(stdout: &str) -> Option<u32> {
    stdout.lines().rev().find_map(|line| line.trim().parse().ok())
}

/// `host:port` with a numeric port, the form used to attach to a scheduler
fn has_port(address: &str) -> bool {
    let address = address.rsplit_once('@').map_or(address, |(_, host)| host);
    if let Some(rest) = address.strip_prefix('[') {
        return rest
            .split_once("]:")
            .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    }
    address
        .split_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok())
}

impl ClusterDistributor {
    /// Run one lifecycle action against `session` and persist its new state.
    pub async fn serve(
        &self,
        env: &AppEnv,
        action: ServeAction,
        options: &ServeOptions,
        session: &ClusterSession,
    ) -> Result<ServePayload> {
        tracing::debug!("serve {:?} for {}", action, env.app);

        match action {
            ServeAction::Start => {
                let started = self.start_session(env, options, session).await;
                self.save_session(env, session).await?;
                started?;
                Ok(ServePayload::live(&session.snapshot().await))
            }
            ServeAction::Status => {
                let snapshot = session.snapshot().await;
                if snapshot.status.is_active() {
                    Ok(ServePayload::live(&snapshot))
                } else {
                    Ok(ServePayload::with_status(SessionStatus::Idle))
                }
            }
            ServeAction::Stop => {
                self.stop_session(options.shutdown_on_stop, session).await;
                self.save_session(env, session).await?;
                Ok(ServePayload::with_status(SessionStatus::Stopped))
            }
            ServeAction::Health => {
                let outcome = self.health(env, options, session).await?;
                let mut payload = ServePayload::live(&session.snapshot().await);
                payload.status = outcome.report.status;
                payload.health = Some(outcome);
                Ok(payload)
            }
        }
    }

    /// Evaluate the session against its SLA, writing the report when an output
    /// path is configured.
    pub async fn health(
        &self,
        env: &AppEnv,
        options: &ServeOptions,
        session: &ClusterSession,
    ) -> Result<HealthOutcome> {
        let settings = match AppSettings::load(&env.apps_path, &env.app) {
            Ok(settings) => settings.health,
            Err(e) => {
                tracing::warn!("Ignoring unreadable settings of {}: {}", env.app, e);
                Default::default()
            }
        };
        let sla = SlaConfig::resolve(&options.sla, &settings);
        let outcome = HealthOutcome::new(HealthReport::from(&session.snapshot().await), sla);

        if let Some(path) = &options.health_output_path {
            outcome.write_to(path, options.health_format)?;
        }
        Ok(outcome)
    }

    /// Launch (or attach to) the scheduler and the worker process group.
    ///
    /// A no-op when the session is already running.
    pub(crate) async fn start_session(
        &self,
        env: &AppEnv,
        options: &ServeOptions,
        session: &ClusterSession,
    ) -> Result<()> {
        let _lifecycle = session.lifecycle().await;
        if session.status().await.is_active() {
            tracing::info!("Session for {} already running", env.app);
            return Ok(());
        }

        let group = env.worker_kind()?.process_group();
        let slots = destination_slots(&options.destinations);
        if slots.is_empty() {
            return Err(DistError::config("no destinations to serve"));
        }

        session
            .update(|s| {
                s.status = SessionStatus::Idle;
                s.app = env.app.clone();
                s.target = env.target.clone();
                s.mode = options.mode;
                s.scheduler = None;
                s.scheduler_pid = None;
                s.workers.clear();
                s.pending.clear();
                s.counters = SessionCounters::default();
                s.started_at = Some(chrono::Utc::now());
                s.stopped_at = None;
            })
            .await;

        let scheduler = if options.mode.pooled() {
            match self.launch_scheduler(env, options, session).await {
                Ok(address) => address,
                Err(e) => {
                    session.update(|s| s.status = SessionStatus::Error).await;
                    return Err(e);
                }
            }
        } else {
            String::new()
        };

        let prefixes = self.prefixes(&slots).await;
        let timeout = self.config.command_timeout();
        let launches: Vec<Launch> = slots
            .iter()
            .enumerate()
            .map(|(index, address)| {
                let id = format!("{group}-{index}");
                let index = index.to_string();
                let wenv = self.wenv_for(address, env);
                let command = render_template(
                    &self.config.cluster.worker_command,
                    &[
                        ("wenv", wenv.as_str()),
                        ("app", env.app.as_str()),
                        ("scheduler", scheduler.as_str()),
                        ("worker_kind", group),
                        ("index", index.as_str()),
                    ],
                );
                let prefix = prefixes.get(address).map(String::as_str).unwrap_or_default();
                Launch {
                    command: detached(prefix, &command, &id),
                    address: address.clone(),
                    id,
                }
            })
            .collect();

        for launch in &launches {
            session
                .jobs()
                .spawn(self.runner.clone(), &launch.id, &launch.address, &launch.command, timeout)
                .await;
        }
        let flushed = session.jobs().flush().await;

        let mut counters = SessionCounters::default();
        let mut workers = Vec::with_capacity(launches.len());
        for (launch, job) in launches.iter().zip(flushed) {
            let first = match job.result {
                Ok(output) if output.success() => parse_pid(&output.stdout),
                Ok(output) => {
                    tracing::warn!(
                        "Worker {} on {} failed to launch ({:?}): {}",
                        launch.id,
                        launch.address,
                        output.exit_code,
                        output.stderr.trim()
                    );
                    None
                }
                Err(e) => {
                    tracing::warn!("Worker {} on {} failed to launch: {}", launch.id, launch.address, e);
                    None
                }
            };

            let pid = match first {
                Some(pid) => Some(pid),
                None => {
                    let relaunched = match self.runner.run(&launch.address, &launch.command, timeout).await {
                        Ok(output) if output.success() => parse_pid(&output.stdout),
                        _ => None,
                    };
                    if relaunched.is_some() {
                        counters.restarted += 1;
                        tracing::info!("Worker {} relaunched on {}", launch.id, launch.address);
                    }
                    relaunched
                }
            };

            match pid {
                Some(_) => counters.running += 1,
                None => {
                    counters.unhealthy += 1;
                    tracing::error!("Worker {} on {} is unhealthy", launch.id, launch.address);
                }
            }
            workers.push(WorkerProcess {
                id: launch.id.clone(),
                address: launch.address.clone(),
                pid,
                healthy: pid.is_some(),
            });
        }

        let status = match (counters.running, counters.unhealthy) {
            (_, 0) => SessionStatus::Running,
            (0, _) => SessionStatus::Error,
            _ => SessionStatus::Degraded,
        };
        session
            .update(|s| {
                s.workers = workers;
                s.counters = counters;
                s.status = status;
            })
            .await;

        tracing::info!(
            "Session for {} is {}: {} running, {} unhealthy, {} restarted",
            env.app,
            status,
            counters.running,
            counters.unhealthy,
            counters.restarted
        );
        Ok(())
    }

    /// Attach to `host:port`, or launch a scheduler on a free port and connect.
    async fn launch_scheduler(
        &self,
        env: &AppEnv,
        options: &ServeOptions,
        session: &ClusterSession,
    ) -> Result<String> {
        let cluster = &self.config.cluster;

        if let Some(address) = options.scheduler.as_deref().filter(|a| has_port(a)) {
            let target = address.rsplit_once('@').map_or(address, |(_, host)| host);
            let client = SchedulerClient::connect(target, self.config.connect_timeout(), CONNECT_RETRY_INTERVAL).await?;
            session.set_client(client).await;
            session.update(|s| s.scheduler = Some(target.to_string())).await;
            tracing::info!("Attached to scheduler {}", target);
            return Ok(target.to_string());
        }

        let launch_host = options
            .scheduler
            .clone()
            .unwrap_or_else(|| default_ipv4().to_string());
        let host = host_of(&launch_host).to_string();
        let port = if is_local(&host) {
            find_free_port(cluster.port_range_start, cluster.port_range_end, cluster.port_attempts)?
        } else {
            cluster.port_range_start
        };
        let port_str = port.to_string();

        let command = render_template(&cluster.scheduler_command, &[("host", host.as_str()), ("port", port_str.as_str())]);
        let prefix = self.env_prefix(&launch_host).await?;
        let launch = detached(&prefix, &command, &format!("scheduler-{port}"));
        let output = self
            .runner
            .run(&launch_host, &launch, self.config.command_timeout())
            .await?;

        let pid = parse_pid(&output.stdout).filter(|_| output.success());
        if pid.is_none() {
            return Err(DistError::Build {
                address: launch_host,
                command,
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        let address = format!("{host}:{port}");
        session
            .update(|s| {
                s.scheduler = Some(address.clone());
                s.scheduler_pid = pid;
            })
            .await;

        let client = SchedulerClient::connect(&address, self.config.connect_timeout(), CONNECT_RETRY_INTERVAL).await?;
        session.set_client(client).await;
        tracing::info!("Scheduler for {} listening on {}", env.app, address);
        Ok(address)
    }

    /// Environment prefix per distinct address; unreachable addresses get none.
    async fn prefixes(&self, slots: &[String]) -> BTreeMap<String, String> {
        let addresses: BTreeSet<&String> = slots.iter().collect();
        let probes = addresses.into_iter().map(|address| async move {
            let prefix = self.env_prefix(address).await.unwrap_or_else(|e| {
                tracing::warn!("Environment probe on {} failed: {}", address, e);
                String::new()
            });
            (address.clone(), prefix)
        });
        join_all(probes).await.into_iter().collect()
    }

    /// Flush background jobs, drop the scheduler connection and optionally kill
    /// the launched processes. Safe to call repeatedly and after a partial start.
    pub(crate) async fn stop_session(&self, shutdown: bool, session: &ClusterSession) {
        let _lifecycle = session.lifecycle().await;

        for job in session.jobs().flush().await {
            if let Err(e) = job.result {
                tracing::warn!("Background job {} on {} failed: {}", job.id, job.address, e);
            }
        }
        session.drop_client().await;

        let snapshot = session.snapshot().await;
        if shutdown {
            let timeout = self.config.command_timeout();
            let mut kills: Vec<(String, u32)> = snapshot
                .workers
                .iter()
                .filter_map(|w| w.pid.map(|pid| (w.address.clone(), pid)))
                .collect();
            if let (Some(scheduler), Some(pid)) = (&snapshot.scheduler, snapshot.scheduler_pid) {
                kills.push((host_of(scheduler).to_string(), pid));
            }

            let kills = kills.iter().map(|(address, pid)| async move {
                let command = format!("kill {pid} 2>/dev/null || true");
                if let Err(e) = self.runner.run(address, &command, timeout).await {
                    tracing::warn!("Could not stop pid {} on {}: {}", pid, address, e);
                }
            });
            join_all(kills).await;
        }

        session
            .update(|s| {
                if s.status != SessionStatus::Stopped {
                    s.stopped_at = Some(chrono::Utc::now());
                }
                s.status = SessionStatus::Stopped;
                s.workers.clear();
                s.pending.clear();
                s.counters.running = 0;
                s.scheduler_pid = None;
            })
            .await;
        tracing::info!("Session for {} stopped", snapshot.app);
    }
}
