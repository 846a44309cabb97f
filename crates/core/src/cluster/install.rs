use super::distributor::ClusterDistributor;
use super::net::{host_of, is_local};
use super::remote::CommandOutput;
use crate::config::render_template;
use crate::dispatch::remove_build_artifacts;
use crate::error::{DistError, Result};
use crate::types::{AppEnv, Destinations, ModeBits};
use futures::future::join_all;
use serde::{Deserialize, Serialize};

/// One install command and what it printed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationOutcome {
    pub address: String,
    pub success: bool,
    pub steps: Vec<StepOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-destination result of [`ClusterDistributor::install`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallReport {
    pub app: String,
    pub mode: ModeBits,
    pub destinations: Vec<DestinationOutcome>,
}

impl InstallReport {
    pub fn success(&self) -> bool {
        self.destinations.iter().all(|d| d.success)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.destinations
            .iter()
            .filter(|d| !d.success)
            .map(|d| d.address.as_str())
            .collect()
    }
}

impl ClusterDistributor {
    /// Install the application on every destination (and the scheduler host).
    ///
    /// Destinations are handled concurrently and independently: a failing one
    /// is recorded in the report without aborting the others.
    pub async fn install(
        &self,
        env: &AppEnv,
        destinations: &Destinations,
        mode: ModeBits,
        scheduler: Option<&str>,
    ) -> Result<InstallReport> {
        if destinations.is_empty() && scheduler.is_none() {
            return Err(DistError::config("no destinations given"));
        }

        if mode.contains(ModeBits::CYTHON) && env.app_dir().is_dir() {
            remove_build_artifacts(&env.app_dir())?;
        }

        let mut addresses: Vec<String> = destinations.keys().cloned().collect();
        if let Some(scheduler) = scheduler {
            let host = host_of(scheduler);
            if !addresses.iter().any(|a| host_of(a) == host) {
                addresses.push(scheduler_address(scheduler));
            }
        }

        tracing::info!(
            "Installing {} ({}) on {} destinations",
            env.app,
            mode,
            addresses.len()
        );

        let outcomes = join_all(
            addresses
                .iter()
                .map(|address| self.install_destination(env, address, mode)),
        )
        .await;

        let report = InstallReport {
            app: env.app.clone(),
            mode,
            destinations: outcomes,
        };
        if !report.success() {
            tracing::warn!("Install failed on: {}", report.failed().join(", "));
        }
        Ok(report)
    }

    async fn install_destination(&self, env: &AppEnv, address: &str, mode: ModeBits) -> DestinationOutcome {
        let mut steps = Vec::new();
        let result = self.install_steps(env, address, mode, &mut steps).await;

        match result {
            Ok(()) => {
                tracing::info!("Installed {} on {}", env.app, address);
                DestinationOutcome {
                    address: address.to_string(),
                    success: true,
                    steps,
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!("Install on {} failed: {}", address, e);
                DestinationOutcome {
                    address: address.to_string(),
                    success: false,
                    steps,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn install_steps(
        &self,
        env: &AppEnv,
        address: &str,
        mode: ModeBits,
        steps: &mut Vec<StepOutcome>,
    ) -> Result<()> {
        let timeout = self.config.command_timeout();
        let prefix = self.env_prefix(address).await?;
        let wenv = self.wenv_for(address, env);

        if !is_local(address) {
            self.run_step(address, "", &format!("mkdir -p {wenv}"), steps).await?;

            let remote_wenv = &self.config.cluster.remote_wenv;
            let copied = self
                .runner
                .copy_to(address, &env.app_dir(), remote_wenv, timeout)
                .await?;
            let command = format!("copy {} -> {}", env.app_dir().display(), remote_wenv);
            record(steps, address, command, copied)?;
        }

        for (_, bit) in ModeBits::ALL.iter().filter(|(bit, _)| mode.contains(*bit)) {
            for template in self.config.install.steps_for(bit) {
                let command = render_template(
                    template,
                    &[("wenv", wenv.as_str()), ("app", env.app.as_str())],
                );
                self.run_step(address, &prefix, &command, steps).await?;
            }
        }

        Ok(())
    }

    async fn run_step(
        &self,
        address: &str,
        prefix: &str,
        command: &str,
        steps: &mut Vec<StepOutcome>,
    ) -> Result<()> {
        let output = self
            .runner
            .run(address, &format!("{prefix}{command}"), self.config.command_timeout())
            .await?;
        record(steps, address, command.to_string(), output)
    }
}

/// Append the step; a non-zero exit becomes a build error for the destination
fn record(
    steps: &mut Vec<StepOutcome>,
    address: &str,
    command: String,
    output: CommandOutput,
) -> Result<()> {
    let success = output.success();
    steps.push(StepOutcome {
        command: command.clone(),
        exit_code: output.exit_code,
        stdout: output.stdout,
        stderr: output.stderr.clone(),
    });
    if success {
        return Ok(());
    }
    Err(DistError::Build {
        address: address.to_string(),
        command,
        exit_code: output.exit_code,
        stderr: output.stderr,
    })
}

/// Scheduler host as an ssh destination, without the port
fn scheduler_address(scheduler: &str) -> String {
    let (user, rest) = match scheduler.rsplit_once('@') {
        Some((user, rest)) => (Some(user), rest),
        None => (None, scheduler),
    };
    let host = host_of(rest);
    match user {
        Some(user) => format!("{user}@{host}"),
        None => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::{output, FakeRunner};
    use crate::config::{DistributorConfig, PathsConfig};
    use crate::worker::WorkerRegistry;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn distributor(temp_dir: &TempDir, runner: Arc<FakeRunner>) -> ClusterDistributor {
        let config = DistributorConfig {
            paths: PathsConfig {
                cache_dir: temp_dir.path().join("cache"),
                state_dir: temp_dir.path().join("state"),
            },
            ..DistributorConfig::default()
        };
        ClusterDistributor::new(config, Arc::new(WorkerRegistry::new())).with_runner(runner)
    }

    fn env(temp_dir: &TempDir) -> AppEnv {
        let env = AppEnv::new("flight", "dag-worker").with_apps_path(temp_dir.path().join("apps"));
        std::fs::create_dir_all(env.app_dir()).unwrap();
        env
    }

    #[tokio::test]
    async fn test_one_failing_destination_does_not_abort_others() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new(|address, command, _| {
            if address == "203.0.113.8" && command.contains("uv sync") {
                Ok(output(1, ""))
            } else {
                Ok(output(0, ""))
            }
        }));
        let distributor = distributor(&temp_dir, runner.clone());
        let destinations = Destinations::from([
            ("203.0.113.7".to_string(), 2),
            ("203.0.113.8".to_string(), 1),
        ]);

        let report = distributor
            .install(&env(&temp_dir), &destinations, ModeBits::PYTHON | ModeBits::DASK, None)
            .await
            .unwrap();

        assert!(!report.success());
        assert_eq!(report.destinations.len(), 2);
        assert_eq!(report.failed(), vec!["203.0.113.8"]);

        let ok = &report.destinations[0];
        assert!(ok.success);
        // mkdir, copy, python step, dask step
        assert_eq!(ok.steps.len(), 4);
        assert!(ok.steps[3].command.contains("dask distributed"));

        let failed = &report.destinations[1];
        assert!(failed.error.as_ref().unwrap().contains("uv sync"));
        // The dask step never ran after the failing python step
        assert!(!runner
            .commands_for("203.0.113.8")
            .iter()
            .any(|c| c.contains("dask distributed")));
    }

    #[tokio::test]
    async fn test_unreachable_destination_is_recorded() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new(|address, _, _| {
            Err(DistError::connection(address, "connection refused"))
        }));
        let distributor = distributor(&temp_dir, runner);
        let destinations = Destinations::from([("203.0.113.9".to_string(), 1)]);

        let report = distributor
            .install(&env(&temp_dir), &destinations, ModeBits::PYTHON, None)
            .await
            .unwrap();

        assert!(!report.success());
        assert!(report.destinations[0].error.as_ref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_local_destination_skips_copy_and_scheduler_is_added() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::ok());
        let distributor = distributor(&temp_dir, runner.clone());
        let destinations = Destinations::from([("127.0.0.1".to_string(), 1)]);

        let report = distributor
            .install(&env(&temp_dir), &destinations, ModeBits::PYTHON, Some("agi@203.0.113.1:8786"))
            .await
            .unwrap();

        assert!(report.success());
        let addresses: Vec<_> = report.destinations.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(addresses, vec!["127.0.0.1", "agi@203.0.113.1"]);

        let copies = runner.copies.lock().unwrap().clone();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].0, "agi@203.0.113.1");

        let local = runner.commands_for("127.0.0.1");
        let apps = std::path::absolute(temp_dir.path().join("apps")).unwrap();
        assert!(local
            .iter()
            .any(|c| c == &format!("cd {}/flight && uv sync --quiet", apps.display())));
    }

    #[tokio::test]
    async fn test_cython_cleans_local_artifacts_first() {
        let temp_dir = TempDir::new().unwrap();
        let env = env(&temp_dir);
        std::fs::create_dir_all(env.app_dir().join("build")).unwrap();
        std::fs::write(env.app_dir().join("kernel.so"), b"").unwrap();
        let distributor = distributor(&temp_dir, Arc::new(FakeRunner::ok()));
        let destinations = Destinations::from([("127.0.0.1".to_string(), 1)]);

        let report = distributor
            .install(&env, &destinations, ModeBits::PYTHON | ModeBits::CYTHON, None)
            .await
            .unwrap();

        assert!(report.success());
        assert!(!env.app_dir().join("build").exists());
        assert!(!env.app_dir().join("kernel.so").exists());
    }

    #[test]
    fn test_scheduler_address() {
        assert_eq!(scheduler_address("10.0.0.1:8786"), "10.0.0.1");
        assert_eq!(scheduler_address("agi@10.0.0.1:8786"), "agi@10.0.0.1");
        assert_eq!(scheduler_address("10.0.0.1"), "10.0.0.1");
    }
}
