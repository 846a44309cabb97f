use super::net::is_local;
use super::remote::{shell_quote, CommandRunner, ShellRunner};
use super::serve::ServeOptions;
use super::session::{ClusterSession, SessionSnapshot};
use crate::config::DistributorConfig;
use crate::dag::{DagExecutor, PartitionRun, PartitionState};
use crate::dispatch::{PlanCache, WorkDispatcher};
use crate::error::{DistError, Result};
use crate::types::{destination_slots, AppEnv, Destinations, ModeBits};
use crate::worker::{DependencyInstaller, Worker, WorkerRegistry};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Directory below the application's remote work dir that receives plan files
const REMOTE_PLAN_DIR: &str = ".dagfleet";

/// Outcome of one destination slot in a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionOutcome {
    pub index: usize,
    pub address: String,
    pub partition: Option<usize>,
    pub state: PartitionState,
    pub elapsed_secs: f64,
    pub results: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PartitionOutcome {
    pub fn from_result(index: usize, address: &str, result: Result<PartitionRun>) -> Self {
        match result {
            Ok(run) => Self {
                index: run.index,
                address: address.to_string(),
                partition: run.partition,
                state: run.state,
                elapsed_secs: run.elapsed_secs,
                results: run.results,
                error: None,
            },
            Err(e) => {
                tracing::error!("Destination {} ({}) failed: {}", index, address, e);
                Self {
                    index,
                    address: address.to_string(),
                    partition: None,
                    state: PartitionState::from_error(&e),
                    elapsed_secs: 0.0,
                    results: BTreeMap::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Done, or nothing was assigned
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && matches!(self.state, PartitionState::Done | PartitionState::Pending)
    }
}

/// Aggregate result of [`ClusterDistributor::run`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub app: String,
    pub target: String,
    pub plan_id: String,
    pub cache_key: String,
    pub plan_path: PathBuf,
    /// The plan came from the cache
    pub reused: bool,
    pub mode: ModeBits,
    pub partitions: Vec<PartitionOutcome>,
    pub elapsed_secs: f64,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.partitions.iter().all(PartitionOutcome::succeeded)
    }

    pub fn failed(&self) -> Vec<&PartitionOutcome> {
        self.partitions.iter().filter(|p| !p.succeeded()).collect()
    }
}

/// Installs, runs and serves an application across a set of destinations
pub struct ClusterDistributor {
    pub(crate) config: DistributorConfig,
    pub(crate) runner: Arc<dyn CommandRunner>,
    dispatcher: WorkDispatcher,
}

impl ClusterDistributor {
    pub fn new(config: DistributorConfig, registry: Arc<WorkerRegistry>) -> Self {
        Self {
            runner: Arc::new(ShellRunner::new(&config.cluster)),
            dispatcher: WorkDispatcher::new(registry, config.paths.cache_dir.clone()),
            config,
        }
    }

    /// Replace the command channel, e.g. with a recording runner in tests
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_installer(mut self, installer: Arc<dyn DependencyInstaller>) -> Self {
        self.dispatcher = self.dispatcher.with_installer(installer);
        self
    }

    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &WorkDispatcher {
        &self.dispatcher
    }

    /// Session for `env` as persisted by an earlier invocation, or a new idle one.
    pub fn load_session(&self, env: &AppEnv, mode: ModeBits) -> Result<ClusterSession> {
        let path = self.config.paths.session_file(&env.app);
        match SessionSnapshot::load(&path)? {
            Some(snapshot) => {
                tracing::debug!("Loaded session {} from {}", snapshot.id, path.display());
                Ok(ClusterSession::from_snapshot(snapshot))
            }
            None => Ok(ClusterSession::new(&env.app, &env.target, mode)),
        }
    }

    /// Persist `session` where [`Self::load_session`] finds it
    pub async fn save_session(&self, env: &AppEnv, session: &ClusterSession) -> Result<()> {
        session.save(&self.config.paths.session_file(&env.app)).await
    }

    /// Shell prefix sourcing the destination's environment files, if any.
    pub(crate) async fn env_prefix(&self, address: &str) -> Result<String> {
        let probe = r#"for f in "$HOME/.local/bin/env" "$HOME/.cargo/env"; do [ -f "$f" ] && echo "source:$f"; done; true"#;
        let output = self
            .runner
            .run(address, probe, self.config.command_timeout())
            .await?;

        let prefix = output
            .stdout
            .lines()
            .filter_map(|line| line.trim().strip_prefix("source:"))
            .map(|path| format!(". {} && ", shell_quote(path)))
            .collect::<String>();
        Ok(prefix)
    }

    /// Work directory holding the application on `address`
    pub(crate) fn wenv_for(&self, address: &str, env: &AppEnv) -> String {
        if is_local(address) {
            return std::path::absolute(&env.apps_path)
                .unwrap_or_else(|_| env.apps_path.clone())
                .display()
                .to_string();
        }
        let wenv = &self.config.cluster.remote_wenv;
        if wenv.starts_with('/') {
            wenv.clone()
        } else {
            format!("$HOME/{wenv}")
        }
    }

    /// Build (or reuse) the plan for `env` and execute every destination slot.
    ///
    /// Configuration errors (unsupported base worker, unknown worker, failed
    /// build) surface before any cluster action. With the DASK bit a session
    /// is started when `session` is not running; a session created here is
    /// always stopped again before returning.
    pub async fn run(
        &self,
        env: &AppEnv,
        mode: ModeBits,
        scheduler: Option<&str>,
        destinations: &Destinations,
        args: &Value,
        session: Option<&ClusterSession>,
    ) -> Result<RunReport> {
        env.worker_kind()?;
        let slots = destination_slots(destinations);
        if slots.is_empty() {
            return Err(DistError::config("no destinations given"));
        }

        let started = Instant::now();
        let cached = self.dispatcher.build_or_reuse(env, destinations, args)?;
        let local_worker = if slots.iter().any(|a| is_local(a)) {
            Some(self.dispatcher.resolve_worker(&env.app, args)?)
        } else {
            None
        };

        let owned = (mode.pooled() && session.is_none())
            .then(|| ClusterSession::new(&env.app, &env.target, mode));

        if let Some(session) = session.or(owned.as_ref()) {
            if mode.pooled() && !session.status().await.is_active() {
                let options = ServeOptions {
                    scheduler: scheduler.map(str::to_string),
                    destinations: destinations.clone(),
                    mode,
                    ..ServeOptions::default()
                };
                if let Err(e) = self.start_session(env, &options, session).await {
                    if owned.is_some() {
                        self.stop_session(true, session).await;
                    }
                    return Err(e);
                }
            }
        }

        // Nothing below returns early: every slot failure lands in its outcome
        let executions = slots.iter().enumerate().map(|(index, address)| {
            let worker = local_worker.clone();
            let plan_path = cached.path.clone();
            let partitions = &cached.plan.partitions;
            async move {
                let result = match worker {
                    Some(worker) if is_local(address) => {
                        self.executor(worker, mode).execute(index, partitions).await
                    }
                    _ => {
                        return self
                            .run_remote(env, mode, index, address, &plan_path)
                            .await
                    }
                };
                PartitionOutcome::from_result(index, address, result)
            }
        });
        let partitions = join_all(executions).await;

        if let Some(session) = &owned {
            self.stop_session(true, session).await;
        }

        let report = RunReport {
            app: env.app.clone(),
            target: env.target.clone(),
            plan_id: cached.plan.plan_id.clone(),
            cache_key: cached.key.to_string(),
            plan_path: cached.path.clone(),
            reused: cached.reused,
            mode,
            partitions,
            elapsed_secs: started.elapsed().as_secs_f64(),
        };

        tracing::info!(
            "Run of {} finished: {}/{} destinations succeeded in {:.3}s",
            env.target,
            report.partitions.len() - report.failed().len(),
            report.partitions.len(),
            report.elapsed_secs
        );
        Ok(report)
    }

    fn executor(&self, worker: Arc<dyn Worker>, mode: ModeBits) -> DagExecutor {
        DagExecutor::new(worker, mode).with_pool_size(self.config.execution.pool_size)
    }

    /// Ship the plan file to `address` and execute the slot there through the
    /// worker-side `exec` command.
    async fn run_remote(
        &self,
        env: &AppEnv,
        mode: ModeBits,
        index: usize,
        address: &str,
        plan_path: &Path,
    ) -> PartitionOutcome {
        let timeout = self.config.command_timeout();
        let remote_dir = format!("{}/{}/{}", self.config.cluster.remote_wenv, env.app, REMOTE_PLAN_DIR);
        let Some(file_name) = plan_path.file_name().and_then(|n| n.to_str()) else {
            let error = DistError::config(format!("invalid plan path {}", plan_path.display()));
            return PartitionOutcome::from_result(index, address, Err(error));
        };

        let result: Result<PartitionOutcome> = async {
            let copied = self.runner.copy_to(address, plan_path, &remote_dir, timeout).await?;
            if !copied.success() {
                return Err(DistError::connection(
                    address,
                    format!("copying plan failed: {}", copied.stderr.trim()),
                ));
            }

            let prefix = self.env_prefix(address).await?;
            let wenv = self.wenv_for(address, env);
            let command = format!(
                "{prefix}cd {wenv}/{app} && {bin} exec --app {app} --plan {dir}/{file} --index {index} --mode {mode}",
                app = shell_quote(&env.app),
                bin = self.config.cluster.remote_bin,
                dir = REMOTE_PLAN_DIR,
                file = shell_quote(file_name),
                mode = mode.0,
            );
            let output = self.runner.run(address, &command, timeout).await?;

            match serde_json::from_str::<PartitionOutcome>(output.stdout.trim()) {
                Ok(mut outcome) => {
                    outcome.index = index;
                    outcome.address = address.to_string();
                    Ok(outcome)
                }
                Err(_) => Err(DistError::NodeFailed {
                    node: format!("destination-{index}"),
                    message: format!(
                        "remote exec exited with {:?}: {}",
                        output.exit_code,
                        output.stderr.trim()
                    ),
                }),
            }
        }
        .await;

        result.unwrap_or_else(|e| PartitionOutcome::from_result(index, address, Err(e)))
    }

    /// Worker side of a remote run: execute slot `index` of a shipped plan.
    pub async fn exec_partition(
        &self,
        app: &str,
        plan_path: &Path,
        index: usize,
        mode: ModeBits,
    ) -> Result<PartitionRun> {
        let plan = PlanCache::load_path(plan_path)?;
        let worker = self.dispatcher.resolve_worker(app, &plan.target_args)?;
        self.executor(worker, mode).execute(index, &plan.partitions).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::{output, FakeRunner};
    use crate::config::PathsConfig;
    use crate::types::{BaseWorkerKind, PlanNode};
    use crate::worker::{DistributionBuild, NodeCall};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    /// One chain `load -> square` per slot, values taken from the slot number
    struct ChainWorker;

    impl Worker for ChainWorker {
        fn build_distribution(&self, destinations: &Destinations) -> anyhow::Result<DistributionBuild> {
            let slots: u32 = destinations.values().sum();
            let partitions = (0..slots)
                .map(|i| {
                    vec![
                        PlanNode::new("load", "load").arg(json!(i + 1)),
                        PlanNode::new("square", "square").after("load"),
                    ]
                })
                .collect();
            Ok(DistributionBuild {
                partitions,
                plan_id: "chain".to_string(),
                ..DistributionBuild::default()
            })
        }

        fn invoke(&self, call: &NodeCall) -> anyhow::Result<Value> {
            match call.function.as_str() {
                "load" => Ok(call.args[0].as_value().cloned().unwrap_or(Value::Null)),
                "square" => {
                    let n = call.prior["load"].as_i64().unwrap_or_default();
                    Ok(json!(n * n))
                }
                other => anyhow::bail!("unknown function {other}"),
            }
        }
    }

    /// Slot 0 gets a two-node cycle, slot 1 the `load -> square` chain
    struct SplitWorker;

    impl Worker for SplitWorker {
        fn build_distribution(&self, _destinations: &Destinations) -> anyhow::Result<DistributionBuild> {
            Ok(DistributionBuild {
                partitions: vec![
                    vec![
                        PlanNode::new("ping", "load").after("pong"),
                        PlanNode::new("pong", "load").after("ping"),
                    ],
                    vec![
                        PlanNode::new("load", "load").arg(json!(3)),
                        PlanNode::new("square", "square").after("load"),
                    ],
                ],
                plan_id: "split".to_string(),
                ..DistributionBuild::default()
            })
        }

        fn invoke(&self, call: &NodeCall) -> anyhow::Result<Value> {
            ChainWorker.invoke(call)
        }
    }

    fn distributor(temp_dir: &TempDir, runner: Arc<FakeRunner>) -> ClusterDistributor {
        let registry = Arc::new(WorkerRegistry::new());
        registry.register("chain", BaseWorkerKind::Dag, |_| Ok(Arc::new(ChainWorker) as Arc<dyn Worker>));
        registry.register("split", BaseWorkerKind::Dag, |_| Ok(Arc::new(SplitWorker) as Arc<dyn Worker>));

        let config = DistributorConfig {
            paths: PathsConfig {
                cache_dir: temp_dir.path().join("cache"),
                state_dir: temp_dir.path().join("state"),
            },
            ..DistributorConfig::default()
        };
        ClusterDistributor::new(config, registry).with_runner(runner)
    }

    fn env(temp_dir: &TempDir) -> AppEnv {
        AppEnv::new("chain", "dag-worker").with_apps_path(temp_dir.path().join("apps"))
    }

    #[tokio::test]
    async fn test_unsupported_base_worker_fails_fast() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::ok());
        let distributor = distributor(&temp_dir, runner.clone());
        let env = AppEnv::new("chain", "spark-worker");
        let destinations = Destinations::from([("127.0.0.1".to_string(), 1)]);

        let result = distributor
            .run(&env, ModeBits::PYTHON, None, &destinations, &Value::Null, None)
            .await;

        assert!(matches!(result, Err(DistError::Configuration(_))));
        assert!(runner.commands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_worker_fails_before_any_cluster_action() {
        let temp_dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let scheduler = listener.local_addr().unwrap().to_string();
        let runner = Arc::new(FakeRunner::ok());
        let distributor = distributor(&temp_dir, runner.clone());
        let env = AppEnv::new("ghost", "pandas-worker").with_apps_path(temp_dir.path().join("apps"));
        let destinations = Destinations::from([("203.0.113.7".to_string(), 1)]);

        let result = distributor
            .run(&env, ModeBits::DASK, Some(&scheduler), &destinations, &json!({}), None)
            .await;

        assert!(matches!(result, Err(DistError::Configuration(_))));
        assert!(runner.commands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_owned_session_is_stopped_after_run() {
        let temp_dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let scheduler = listener.local_addr().unwrap().to_string();
        let runner = Arc::new(FakeRunner::new(|_, command, _| {
            if command.contains(" exec ") {
                Ok(output(0, r#"{"index":0,"address":"local","partition":0,"state":"done","elapsed_secs":0.1,"results":{}}"#))
            } else if command.contains("nohup") {
                Ok(output(0, "4242\n"))
            } else {
                Ok(output(0, ""))
            }
        }));
        let distributor = distributor(&temp_dir, runner.clone());
        let destinations = Destinations::from([("203.0.113.7".to_string(), 2)]);

        let report = distributor
            .run(&env(&temp_dir), ModeBits::DASK, Some(&scheduler), &destinations, &json!({}), None)
            .await
            .unwrap();
        assert!(report.success());

        let commands = runner.commands_for("203.0.113.7");
        let launched = commands.iter().filter(|c| c.contains("nohup")).count();
        let killed = commands.iter().filter(|c| c.starts_with("kill 4242")).count();
        assert_eq!(launched, 2);
        assert_eq!(killed, launched);
    }

    #[tokio::test]
    async fn test_cyclic_partition_fails_alone() {
        let temp_dir = TempDir::new().unwrap();
        let distributor = distributor(&temp_dir, Arc::new(FakeRunner::ok()));
        let env = AppEnv::new("split", "dag-worker").with_apps_path(temp_dir.path().join("apps"));
        let destinations = Destinations::from([("127.0.0.1".to_string(), 2)]);

        let report = distributor
            .run(&env, ModeBits::PYTHON, None, &destinations, &json!({}), None)
            .await
            .unwrap();

        assert_eq!(report.partitions[0].state, PartitionState::CycleError);
        assert!(report.partitions[0].results.is_empty());
        assert_eq!(report.partitions[1].state, PartitionState::Done);
        assert_eq!(report.partitions[1].results["square"], json!(9));
        assert_eq!(report.failed().len(), 1);
        assert_eq!(report.failed()[0].index, 0);
    }

    #[tokio::test]
    async fn test_local_run_executes_every_slot() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::ok());
        let distributor = distributor(&temp_dir, runner.clone());
        let destinations = Destinations::from([("127.0.0.1".to_string(), 2)]);

        let report = distributor
            .run(&env(&temp_dir), ModeBits::PYTHON, None, &destinations, &json!({}), None)
            .await
            .unwrap();

        assert!(report.success());
        assert!(!report.reused);
        assert_eq!(report.partitions.len(), 2);
        assert_eq!(report.partitions[0].results["square"], json!(1));
        assert_eq!(report.partitions[1].results["square"], json!(4));
        assert!(report.plan_path.exists());

        let again = distributor
            .run(&env(&temp_dir), ModeBits::PYTHON, None, &destinations, &json!({}), None)
            .await
            .unwrap();
        assert!(again.reused);
        assert_eq!(again.cache_key, report.cache_key);
    }

    #[tokio::test]
    async fn test_remote_slot_ships_plan_and_parses_outcome() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new(|_, command, _| {
            if command.contains(" exec ") {
                Ok(output(
                    0,
                    r#"{"index":0,"address":"local","partition":0,"state":"done","elapsed_secs":0.5,"results":{"square":1}}"#,
                ))
            } else {
                Ok(output(0, "source:/home/agi/.local/bin/env\n"))
            }
        }));
        let distributor = distributor(&temp_dir, runner.clone());
        let destinations = Destinations::from([("203.0.113.7".to_string(), 1)]);

        let report = distributor
            .run(&env(&temp_dir), ModeBits::PYTHON, None, &destinations, &json!({}), None)
            .await
            .unwrap();

        assert!(report.success());
        let outcome = &report.partitions[0];
        assert_eq!(outcome.address, "203.0.113.7");
        assert_eq!(outcome.results["square"], json!(1));

        let copies = runner.copies.lock().unwrap().clone();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].2, "wenv/chain/.dagfleet");

        let exec = runner
            .commands_for("203.0.113.7")
            .into_iter()
            .find(|c| c.contains(" exec "))
            .unwrap();
        assert!(exec.starts_with(". '/home/agi/.local/bin/env' && cd $HOME/wenv/'chain' && dagfleet exec"));
        assert!(exec.contains("--index 0 --mode 1"));
    }

    #[tokio::test]
    async fn test_unreachable_remote_is_reported_per_destination() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new(|address, _, _| {
            Err(DistError::connection(address, "timed out"))
        }));
        let distributor = distributor(&temp_dir, runner);
        let destinations = Destinations::from([
            ("127.0.0.1".to_string(), 1),
            ("203.0.113.7".to_string(), 1),
        ]);

        let report = distributor
            .run(&env(&temp_dir), ModeBits::PYTHON, None, &destinations, &json!({}), None)
            .await
            .unwrap();

        assert!(!report.success());
        assert!(report.partitions[0].succeeded());
        assert_eq!(report.failed().len(), 1);
        assert_eq!(report.failed()[0].address, "203.0.113.7");
    }

    #[tokio::test]
    async fn test_exec_partition_from_plan_file() {
        let temp_dir = TempDir::new().unwrap();
        let distributor = distributor(&temp_dir, Arc::new(FakeRunner::ok()));
        let destinations = Destinations::from([("10.0.0.9".to_string(), 3)]);
        let cached = distributor
            .dispatcher()
            .build_or_reuse(&env(&temp_dir), &destinations, &json!({}))
            .unwrap();

        let run = distributor
            .exec_partition("chain", &cached.path, 2, ModeBits::DASK)
            .await
            .unwrap();
        assert_eq!(run.partition, Some(2));
        assert_eq!(run.results["square"], json!(9));

        let idle = distributor
            .exec_partition("chain", &cached.path, 7, ModeBits::PYTHON)
            .await
            .unwrap();
        assert_eq!(idle.partition, None);
        assert_eq!(idle.elapsed_secs, 0.0);
    }
}
