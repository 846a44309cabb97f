//! Application worker contract and the name -> constructor registry.

use crate::error::{DistError, Result};
use crate::types::{BaseWorkerKind, Callable, Destinations, NodeArg, NodeInfo, Partition};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// What a worker's `build_distribution` hands back to the dispatcher
#[derive(Debug, Clone, Default)]
pub struct DistributionBuild {
    pub partitions: Vec<Partition>,
    pub partitions_info: Vec<Vec<NodeInfo>>,
    pub plan_id: String,
    pub partition_label: String,
    pub unit_label: String,
}

/// One node invocation, with the results of its completed dependencies
#[derive(Debug, Clone)]
pub struct NodeCall {
    pub node: String,
    pub function: String,
    pub args: Vec<NodeArg>,
    pub kwargs: BTreeMap<String, NodeArg>,
    /// Dependency results keyed by dependency name
    pub prior: BTreeMap<String, Value>,
}

/// Capability interface implemented by every plugged-in application
pub trait Worker: Send + Sync {
    /// Split the application's work into one partition per destination slot
    fn build_distribution(&self, destinations: &Destinations) -> anyhow::Result<DistributionBuild>;

    /// Execute one node
    fn invoke(&self, call: &NodeCall) -> anyhow::Result<Value>;

    /// Called once a partition has finished with its final result map
    fn on_complete(&self, _results: &BTreeMap<String, Value>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Constructs a worker from the invocation arguments
pub type WorkerFactory = Arc<dyn Fn(&Value) -> anyhow::Result<Arc<dyn Worker>> + Send + Sync>;

struct RegisteredWorker {
    base: BaseWorkerKind,
    factory: WorkerFactory,
}

/// Registry resolving application names to worker constructors
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, RegisteredWorker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a worker constructor under an application name
    pub fn register<F>(&self, app: impl Into<String>, base: BaseWorkerKind, factory: F)
    where
        F: Fn(&Value) -> anyhow::Result<Arc<dyn Worker>> + Send + Sync + 'static,
    {
        let app = app.into();
        tracing::debug!("Registering worker for app {} ({:?})", app, base);
        self.workers.write().unwrap().insert(
            app,
            RegisteredWorker {
                base,
                factory: Arc::new(factory),
            },
        );
    }

    pub fn contains(&self, app: &str) -> bool {
        self.workers.read().unwrap().contains_key(app)
    }

    /// Base class an application's worker was registered with
    pub fn base_of(&self, app: &str) -> Option<BaseWorkerKind> {
        self.workers.read().unwrap().get(app).map(|w| w.base)
    }

    /// Registered application names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Construct the worker registered for `app`
    pub fn create(&self, app: &str, args: &Value) -> Result<Arc<dyn Worker>> {
        let factory = self
            .workers
            .read()
            .unwrap()
            .get(app)
            .map(|w| w.factory.clone())
            .ok_or_else(|| DistError::config(format!("no worker registered for app '{app}'")))?;

        factory(args).map_err(DistError::Other)
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Hook run once when an application's worker cannot be resolved
pub trait DependencyInstaller: Send + Sync {
    /// Make the worker for `app` available, typically by registering it
    fn install(&self, app: &str, registry: &WorkerRegistry) -> anyhow::Result<()>;
}

/// Symbol -> callable table a worker uses to resolve persisted function references
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    entries: HashMap<String, Callable>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, callable: Callable) {
        self.entries.insert(callable.symbol().to_string(), callable);
    }

    pub fn get(&self, symbol: &str) -> Option<&Callable> {
        self.entries.get(symbol)
    }

    /// Resolve an argument to a callable, whether embedded or symbolic
    pub fn resolve(&self, arg: &NodeArg) -> Option<Callable> {
        match arg {
            NodeArg::Callable(callable) => Some(callable.clone()),
            NodeArg::Symbol(symbol) => self.get(symbol).cloned(),
            NodeArg::Value(_) => None,
        }
    }
}
