use crate::error::{DistError, Result};
use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Destination mapping: address -> number of worker units on that address
pub type Destinations = BTreeMap<String, u32>;

/// One destination's slice of the task DAG
pub type Partition = Vec<PlanNode>;

/// Expand a destination mapping into its ordered worker slots.
///
/// Addresses are visited in ascending order and each address appears once per
/// unit, so slot `i` is the destination index used for partition assignment.
pub fn destination_slots(destinations: &Destinations) -> Vec<String> {
    destinations
        .iter()
        .flat_map(|(address, units)| std::iter::repeat(address.clone()).take(*units as usize))
        .collect()
}

/// Execution-mode bitmask selecting install steps and the DAG strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModeBits(pub u32);

impl ModeBits {
    pub const PYTHON: ModeBits = ModeBits(1);
    pub const CYTHON: ModeBits = ModeBits(2);
    pub const DASK: ModeBits = ModeBits(4);
    pub const RAPIDS: ModeBits = ModeBits(16);

    /// All named bits, in install order.
    pub const ALL: [(ModeBits, &'static str); 4] = [
        (Self::PYTHON, "python"),
        (Self::CYTHON, "cython"),
        (Self::DASK, "dask"),
        (Self::RAPIDS, "rapids"),
    ];

    pub fn contains(self, other: ModeBits) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Nodes run across a bounded pool instead of one at a time.
    pub fn pooled(self) -> bool {
        self.contains(Self::DASK)
    }

    /// Names of the bits that are set, in install order.
    pub fn names(self) -> Vec<&'static str> {
        Self::ALL
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl std::ops::BitOr for ModeBits {
    type Output = ModeBits;

    fn bitor(self, rhs: Self) -> Self::Output {
        ModeBits(self.0 | rhs.0)
    }
}

impl std::fmt::Display for ModeBits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.names();
        if names.is_empty() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "{} ({})", self.0, names.join("|"))
        }
    }
}

/// Supported worker base classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseWorkerKind {
    Dag,
    Pandas,
    Polars,
    Fireducks,
    Agent,
}

impl BaseWorkerKind {
    /// Name of the worker process group started for this kind
    pub fn process_group(&self) -> &'static str {
        match self {
            Self::Dag => "dag-worker",
            Self::Pandas => "pandas-worker",
            Self::Polars => "polars-worker",
            Self::Fireducks => "fireducks-worker",
            Self::Agent => "agent-worker",
        }
    }
}

impl FromStr for BaseWorkerKind {
    type Err = DistError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace(['-', '_'], "");
        let stem = normalized.strip_suffix("worker").unwrap_or(&normalized);
        match stem {
            "dag" => Ok(Self::Dag),
            "pandas" => Ok(Self::Pandas),
            "polars" => Ok(Self::Polars),
            "fireducks" => Ok(Self::Fireducks),
            "agent" => Ok(Self::Agent),
            _ => Err(DistError::config(format!(
                "unsupported worker base class '{s}' (expected one of dag-worker, pandas-worker, polars-worker, fireducks-worker, agent-worker)"
            ))),
        }
    }
}

/// Application environment a distribution is built for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppEnv {
    /// Application name, also the worker registry key
    pub app: String,
    /// Target identity, part of the plan cache key
    pub target: String,
    /// Worker base class the application's worker derives from
    pub base_worker: String,
    /// Directory holding one sub-directory per application
    pub apps_path: PathBuf,
}

impl AppEnv {
    pub fn new(app: impl Into<String>, base_worker: impl Into<String>) -> Self {
        let app = app.into();
        Self {
            target: app.clone(),
            app,
            base_worker: base_worker.into(),
            apps_path: PathBuf::from("apps"),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_apps_path(mut self, apps_path: impl Into<PathBuf>) -> Self {
        self.apps_path = apps_path.into();
        self
    }

    pub fn app_dir(&self) -> PathBuf {
        self.apps_path.join(&self.app)
    }

    /// Resolve the base worker class, failing with a configuration error
    pub fn worker_kind(&self) -> Result<BaseWorkerKind> {
        self.base_worker.parse()
    }
}

/// Literal tag persisted in place of an anonymous callable
pub const ANONYMOUS_CALLABLE: &str = "<lambda>";

const SYMBOL_KEY: &str = "$symbol";

type NativeFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// In-memory function reference a worker may embed in a node's arguments.
///
/// Never persisted: plans store [`Callable::symbol`] instead.
#[derive(Clone)]
pub struct Callable {
    name: Option<String>,
    func: NativeFn,
}

impl Callable {
    pub fn named<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        Self {
            name: Some(name.into()),
            func: Arc::new(func),
        }
    }

    pub fn anonymous<F>(func: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        Self {
            name: None,
            func: Arc::new(func),
        }
    }

    /// Stable symbolic name used in persisted plans
    pub fn symbol(&self) -> &str {
        self.name.as_deref().unwrap_or(ANONYMOUS_CALLABLE)
    }

    pub fn call(&self, args: &[Value]) -> Value {
        (self.func)(args)
    }
}

impl std::fmt::Debug for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callable").field("symbol", &self.symbol()).finish()
    }
}

/// A positional or keyword argument of a plan node
#[derive(Debug, Clone)]
pub enum NodeArg {
    Value(Value),
    /// Symbolic function reference, resolved through the worker's dispatch table
    Symbol(String),
    Callable(Callable),
}

impl NodeArg {
    /// Replace an embedded callable by its symbolic name.
    pub fn sanitize(&mut self) {
        if let NodeArg::Callable(callable) = self {
            *self = NodeArg::Symbol(callable.symbol().to_string());
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            NodeArg::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            NodeArg::Symbol(symbol) => Some(symbol),
            NodeArg::Callable(callable) => Some(callable.symbol()),
            NodeArg::Value(_) => None,
        }
    }
}

impl From<Value> for NodeArg {
    fn from(value: Value) -> Self {
        NodeArg::Value(value)
    }
}

impl From<Callable> for NodeArg {
    fn from(callable: Callable) -> Self {
        NodeArg::Callable(callable)
    }
}

impl PartialEq for NodeArg {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (NodeArg::Value(a), NodeArg::Value(b)) => a == b,
            (NodeArg::Value(_), _) | (_, NodeArg::Value(_)) => false,
            (a, b) => a.as_symbol() == b.as_symbol(),
        }
    }
}

impl Serialize for NodeArg {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            NodeArg::Value(value) => value.serialize(serializer),
            NodeArg::Symbol(_) | NodeArg::Callable(_) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(SYMBOL_KEY, &self.as_symbol())?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for NodeArg {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if let Value::Object(map) = &value {
            if map.len() == 1 {
                if let Some(Value::String(symbol)) = map.get(SYMBOL_KEY) {
                    return Ok(NodeArg::Symbol(symbol.clone()));
                }
            }
        }
        Ok(NodeArg::Value(value))
    }
}

/// A named unit of work within a partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Unique name within the partition; results are recorded under it
    pub name: String,
    /// Symbolic function name dispatched by the worker
    pub function: String,
    #[serde(default)]
    pub args: Vec<NodeArg>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, NodeArg>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl PlanNode {
    pub fn new(name: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            function: function.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<NodeArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, arg: impl Into<NodeArg>) -> Self {
        self.kwargs.insert(key.into(), arg.into());
        self
    }

    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn sanitize(&mut self) {
        self.args.iter_mut().for_each(NodeArg::sanitize);
        self.kwargs.values_mut().for_each(NodeArg::sanitize);
    }
}

/// Reporting-only description of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    #[serde(default)]
    pub weight: f64,
}

/// Serialized DAG-per-destination produced by a worker's `build_distribution`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionPlan {
    pub target: String,
    pub plan_id: String,
    pub partition_label: String,
    pub unit_label: String,
    /// Destination mapping the plan was built for
    pub workers: Destinations,
    /// Invocation arguments the plan was built for
    pub target_args: Value,
    pub partitions: Vec<Partition>,
    #[serde(default)]
    pub partitions_info: Vec<Vec<NodeInfo>>,
    pub created_at: DateTime<Utc>,
}

impl DistributionPlan {
    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(|p| p.is_empty())
    }

    pub fn node_count(&self) -> usize {
        self.partitions.iter().map(|p| p.len()).sum()
    }

    /// Replace every embedded callable by its symbolic name
    pub fn sanitize(&mut self) {
        self.partitions
            .iter_mut()
            .flat_map(|p| p.iter_mut())
            .for_each(PlanNode::sanitize);
    }
}
