//! Workers shipped with the binary.
//!
//! `command` runs one shell command per node. Its invocation arguments carry the
//! graph directly:
//!
//! ```json
//! {"partitions": [[{"name": "fetch", "command": "curl -s ..."},
//!                  {"name": "count", "command": "wc -l", "after": ["fetch"], "parse": "trim"}]]}
//! ```
//!
//! Any other application can ship a `dagfleet-worker.json` manifest in its
//! directory (`{"base": "pandas-worker", "args": {...}}`); [`ManifestInstaller`]
//! registers it as a command worker the first time the app is resolved.

use anyhow::{bail, Context, Result};
use dagfleet_core::types::{BaseWorkerKind, Callable, Destinations, NodeInfo, PlanNode};
use dagfleet_core::worker::{
    DependencyInstaller, DispatchTable, DistributionBuild, NodeCall, Worker, WorkerRegistry,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

pub const COMMAND_APP: &str = "command";

/// Environment variable holding the JSON results of a node's dependencies
pub const PRIOR_ENV: &str = "DAGFLEET_PRIOR";

/// Register every builtin worker
pub fn register_builtin(registry: &WorkerRegistry) {
    registry.register(COMMAND_APP, BaseWorkerKind::Dag, |args| {
        Ok(Arc::new(CommandWorker::from_args(args)?) as Arc<dyn Worker>)
    });
}

/// Worker description an application directory may provide
pub const MANIFEST_FILE: &str = "dagfleet-worker.json";

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerManifest {
    #[serde(default = "default_base")]
    pub base: String,
    /// Default invocation arguments of the command worker
    #[serde(default)]
    pub args: Value,
}

fn default_base() -> String {
    BaseWorkerKind::Dag.process_group().to_string()
}

impl WorkerManifest {
    pub fn path(apps_path: &Path, app: &str) -> PathBuf {
        apps_path.join(app).join(MANIFEST_FILE)
    }

    pub fn load(apps_path: &Path, app: &str) -> Result<Option<Self>> {
        let path = Self::path(apps_path, app);
        if !path.exists() {
            return Ok(None);
        }
        let content =
            std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let manifest = serde_json::from_str(&content)
            .with_context(|| format!("Invalid worker manifest {}", path.display()))?;
        Ok(Some(manifest))
    }
}

/// Invocation arguments override the manifest defaults key by key
fn merged_args(defaults: &Value, args: &Value) -> Value {
    match (defaults, args) {
        (Value::Object(base), Value::Object(overrides)) => {
            let mut merged = base.clone();
            merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
            Value::Object(merged)
        }
        (_, Value::Null) => defaults.clone(),
        _ => args.clone(),
    }
}

/// Registers an application's command worker from its manifest
pub struct ManifestInstaller {
    apps_path: PathBuf,
}

impl ManifestInstaller {
    pub fn new(apps_path: impl Into<PathBuf>) -> Self {
        Self {
            apps_path: apps_path.into(),
        }
    }
}

impl DependencyInstaller for ManifestInstaller {
    fn install(&self, app: &str, registry: &WorkerRegistry) -> Result<()> {
        let Some(manifest) = WorkerManifest::load(&self.apps_path, app)? else {
            bail!("{} not found", WorkerManifest::path(&self.apps_path, app).display());
        };
        let base: BaseWorkerKind = manifest.base.parse()?;
        let defaults = manifest.args;
        CommandWorker::from_args(&defaults).with_context(|| format!("Invalid arguments in the manifest of {app}"))?;

        registry.register(app, base, move |args| {
            Ok(Arc::new(CommandWorker::from_args(&merged_args(&defaults, args))?) as Arc<dyn Worker>)
        });
        tracing::info!("Registered command worker for {} ({})", app, base.process_group());
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CommandNode {
    name: String,
    command: String,
    #[serde(default)]
    after: Vec<String>,
    /// Output parser, one of the dispatch table symbols
    #[serde(default)]
    parse: Option<String>,
    #[serde(default = "default_weight")]
    weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CommandArgs {
    #[serde(default)]
    partitions: Vec<Vec<CommandNode>>,
    /// Working directory of every command
    #[serde(default)]
    workdir: Option<PathBuf>,
}

pub struct CommandWorker {
    args: CommandArgs,
    parsers: DispatchTable,
}

fn parsers() -> DispatchTable {
    let text = |args: &[Value]| args.first().and_then(Value::as_str).unwrap_or_default().to_string();

    let mut table = DispatchTable::new();
    table.register(Callable::named("trim", move |args| json!(text(args).trim())));
    table.register(Callable::named("lines", move |args| {
        json!(text(args).lines().map(str::to_string).collect::<Vec<_>>())
    }));
    table.register(Callable::named("json", move |args| {
        serde_json::from_str(&text(args)).unwrap_or(Value::Null)
    }));
    table
}

impl CommandWorker {
    pub fn from_args(args: &Value) -> Result<Self> {
        let args: CommandArgs = if args.is_null() {
            CommandArgs::default()
        } else {
            serde_json::from_value(args.clone()).context("Invalid arguments for the command worker")?
        };
        Ok(Self {
            args,
            parsers: parsers(),
        })
    }
}

impl Worker for CommandWorker {
    fn build_distribution(&self, destinations: &Destinations) -> Result<DistributionBuild> {
        let slots: u32 = destinations.values().sum();
        if self.args.partitions.len() > slots as usize {
            tracing::warn!(
                "{} partitions for {} destination slots; the extra partitions will not run",
                self.args.partitions.len(),
                slots
            );
        }

        let mut partitions = Vec::with_capacity(self.args.partitions.len());
        let mut partitions_info = Vec::with_capacity(self.args.partitions.len());

        for nodes in &self.args.partitions {
            let mut partition = Vec::with_capacity(nodes.len());
            for entry in nodes {
                let mut node = PlanNode::new(&entry.name, "sh").arg(json!(entry.command));
                if let Some(parse) = &entry.parse {
                    let Some(parser) = self.parsers.get(parse) else {
                        bail!("node '{}' uses unknown parser '{}'", entry.name, parse);
                    };
                    node = node.kwarg("parse", parser.clone());
                }
                for dependency in &entry.after {
                    node = node.after(dependency);
                }
                partition.push(node);
            }
            partitions_info.push(
                nodes
                    .iter()
                    .map(|entry| NodeInfo {
                        name: entry.name.clone(),
                        weight: entry.weight,
                    })
                    .collect(),
            );
            partitions.push(partition);
        }

        Ok(DistributionBuild {
            partitions,
            partitions_info,
            plan_id: COMMAND_APP.to_string(),
            partition_label: "partition".to_string(),
            unit_label: "commands".to_string(),
        })
    }

    fn invoke(&self, call: &NodeCall) -> Result<Value> {
        if call.function != "sh" {
            bail!("command worker cannot run function '{}'", call.function);
        }
        let Some(command) = call.args.first().and_then(|a| a.as_value()).and_then(Value::as_str) else {
            bail!("node '{}' has no command", call.node);
        };

        let mut process = Command::new("sh");
        process
            .arg("-c")
            .arg(command)
            .env(PRIOR_ENV, serde_json::to_string(&call.prior)?);
        if let Some(workdir) = &self.args.workdir {
            process.current_dir(workdir);
        }

        tracing::debug!("[{}] $ {}", call.node, command);
        let output = process
            .output()
            .with_context(|| format!("Failed to spawn `{command}`"))?;
        if !output.status.success() {
            bail!(
                "`{}` exited with {:?}: {}",
                command,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = Value::String(String::from_utf8_lossy(&output.stdout).into_owned());
        match call.kwargs.get("parse").and_then(|arg| self.parsers.resolve(arg)) {
            Some(parser) => Ok(parser.call(&[stdout])),
            None => Ok(stdout),
        }
    }
}
