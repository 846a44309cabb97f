use crate::workers::{self, ManifestInstaller, WorkerManifest};
use anyhow::{bail, Context, Result};
use dagfleet_core::cluster::ClusterDistributor;
use dagfleet_core::config::DistributorConfig;
use dagfleet_core::types::{AppEnv, Destinations};
use dagfleet_core::worker::WorkerRegistry;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Configuration and worker registry shared by every subcommand
pub struct CliContext {
    pub config: DistributorConfig,
    pub apps_path: PathBuf,
    registry: Arc<WorkerRegistry>,
}

impl CliContext {
    pub fn load(config_path: &Path, apps_path: PathBuf) -> Result<Self> {
        if !config_path.exists() {
            tracing::debug!("Configuration file {} not found, using defaults", config_path.display());
        }
        let config = DistributorConfig::load(config_path)
            .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

        let registry = Arc::new(WorkerRegistry::new());
        workers::register_builtin(&registry);

        Ok(Self {
            config,
            apps_path,
            registry,
        })
    }

    /// Application environment; the base worker defaults to the registered
    /// one, then to the one named in the app's manifest.
    pub fn env(&self, app: &str, target: Option<&str>, base_worker: Option<&str>) -> AppEnv {
        let base_worker = base_worker
            .map(str::to_string)
            .or_else(|| self.registry.base_of(app).map(|b| b.process_group().to_string()))
            .or_else(|| match WorkerManifest::load(&self.apps_path, app) {
                Ok(manifest) => manifest.map(|m| m.base),
                Err(e) => {
                    tracing::warn!("{:#}", e);
                    None
                }
            })
            .unwrap_or_else(|| "dag-worker".to_string());

        let env = AppEnv::new(app, base_worker).with_apps_path(&self.apps_path);
        match target {
            Some(target) => env.with_target(target),
            None => env,
        }
    }

    pub fn distributor(&self) -> ClusterDistributor {
        ClusterDistributor::new(self.config.clone(), self.registry.clone())
            .with_installer(Arc::new(ManifestInstaller::new(&self.apps_path)))
    }
}

/// Parse `host=units` (units default to 1)
pub fn parse_destination(value: &str) -> std::result::Result<(String, u32), String> {
    let (host, units) = match value.split_once('=') {
        Some((host, units)) => {
            let units = units
                .trim()
                .parse::<u32>()
                .map_err(|e| format!("invalid unit count in '{value}': {e}"))?;
            (host.trim(), units)
        }
        None => (value.trim(), 1),
    };
    if host.is_empty() {
        return Err(format!("missing host in '{value}'"));
    }
    Ok((host.to_string(), units))
}

/// Merge repeated hosts by summing their units
pub fn collect_destinations(pairs: &[(String, u32)]) -> Destinations {
    let mut destinations = Destinations::new();
    for (host, units) in pairs {
        *destinations.entry(host.clone()).or_default() += units;
    }
    destinations
}

/// Inline JSON, or `@path` to a JSON file; absent means `{}`
pub fn parse_target_args(raw: Option<&str>) -> Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Object(Default::default()));
    };

    let (source, content) = match raw.strip_prefix('@') {
        Some(path) => (
            path.to_string(),
            std::fs::read_to_string(path).with_context(|| format!("Failed to read arguments file {path}"))?,
        ),
        None => ("--args".to_string(), raw.to_string()),
    };

    let value: Value = serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {source}"))?;
    if !value.is_object() && !value.is_null() {
        bail!("Arguments in {source} must be a JSON object");
    }
    Ok(value)
}
