//! Distributor configuration (`dagfleet.toml`) and per-application settings.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistributorConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub install: InstallConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub paths: PathsConfig,
}

impl DistributorConfig {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            tracing::info!(
                "Configuration file {} not found, using defaults",
                config_path.display()
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,

    #[serde(default = "default_scp_binary")]
    pub scp_binary: String,

    #[serde(default = "default_ssh_options")]
    pub ssh_options: Vec<String>,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    #[serde(default = "default_port_attempts")]
    pub port_attempts: usize,

    /// Command template launching the scheduler; `{port}` and `{host}` are substituted
    #[serde(default = "default_scheduler_command")]
    pub scheduler_command: String,

    /// Command template launching one worker process; `{scheduler}`,
    /// `{worker_kind}`, `{index}`, `{app}` and `{wenv}` are substituted
    #[serde(default = "default_worker_command")]
    pub worker_command: String,

    /// Binary invoked on remote destinations to execute a partition
    #[serde(default = "default_remote_bin")]
    pub remote_bin: String,

    /// Remote work directory, relative to the remote home directory
    #[serde(default = "default_remote_wenv")]
    pub remote_wenv: String,
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_scp_binary() -> String {
    "scp".to_string()
}

fn default_ssh_options() -> Vec<String> {
    vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "ConnectTimeout=10".to_string(),
    ]
}

fn default_command_timeout_secs() -> u64 {
    120
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_port_range_start() -> u16 {
    8786
}

fn default_port_range_end() -> u16 {
    8886
}

fn default_port_attempts() -> usize {
    20
}

fn default_scheduler_command() -> String {
    "dask scheduler --host {host} --port {port}".to_string()
}

fn default_worker_command() -> String {
    "cd {wenv}/{app} && dask worker tcp://{scheduler} --name {worker_kind}-{index}".to_string()
}

fn default_remote_bin() -> String {
    "dagfleet".to_string()
}

fn default_remote_wenv() -> String {
    "wenv".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            ssh_binary: default_ssh_binary(),
            scp_binary: default_scp_binary(),
            ssh_options: default_ssh_options(),
            command_timeout_secs: default_command_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            port_attempts: default_port_attempts(),
            scheduler_command: default_scheduler_command(),
            worker_command: default_worker_command(),
            remote_bin: default_remote_bin(),
            remote_wenv: default_remote_wenv(),
        }
    }
}

/// Commands issued per mode bit during install. `{app}` and `{wenv}` are substituted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    #[serde(default = "default_python_steps")]
    pub python: Vec<String>,

    #[serde(default = "default_cython_steps")]
    pub cython: Vec<String>,

    #[serde(default = "default_dask_steps")]
    pub dask: Vec<String>,

    #[serde(default = "default_rapids_steps")]
    pub rapids: Vec<String>,
}

fn default_python_steps() -> Vec<String> {
    vec!["cd {wenv}/{app} && uv sync --quiet".to_string()]
}

fn default_cython_steps() -> Vec<String> {
    vec!["cd {wenv}/{app} && uv run python setup.py build_ext --inplace".to_string()]
}

fn default_dask_steps() -> Vec<String> {
    vec!["cd {wenv}/{app} && uv pip install --quiet dask distributed".to_string()]
}

fn default_rapids_steps() -> Vec<String> {
    vec!["nvidia-smi -L".to_string()]
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            python: default_python_steps(),
            cython: default_cython_steps(),
            dask: default_dask_steps(),
            rapids: default_rapids_steps(),
        }
    }
}

impl InstallConfig {
    /// Steps for one named mode bit
    pub fn steps_for(&self, bit: &str) -> &[String] {
        match bit {
            "python" => &self.python,
            "cython" => &self.cython,
            "dask" => &self.dask,
            "rapids" => &self.rapids,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Upper bound on concurrently running nodes in pooled mode
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".dagfleet/cache")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".dagfleet/state")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            state_dir: default_state_dir(),
        }
    }
}

impl PathsConfig {
    /// Location of the persisted session snapshot for an application
    pub fn session_file(&self, app: &str) -> PathBuf {
        self.state_dir.join(app).join("session.json")
    }
}

/// Per-application settings (`<apps_path>/<app>/app_settings.toml`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub health: HealthSettings,
}

/// SLA values an application may pin in its settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSettings {
    pub allow_idle: Option<bool>,
    pub max_unhealthy: Option<u32>,
    pub max_restart_rate: Option<f64>,
}

impl AppSettings {
    pub const FILE_NAME: &'static str = "app_settings.toml";

    /// Load an application's settings; a missing file yields defaults.
    pub fn load(apps_path: &Path, app: &str) -> Result<Self> {
        let path = apps_path.join(app).join(Self::FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(toml::from_str(&content)?)
    }
}

/// Substitute `{key}` placeholders in a command template.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}
