use crate::error::Result;
use crate::types::{Destinations, DistributionPlan};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// Plan cache key: SHA-256 over the canonical JSON of (target, destinations, args)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    pub fn compute(target: &str, destinations: &Destinations, args: &Value) -> Result<Self> {
        use sha2::{Digest, Sha256};

        let canonical = serde_json::to_vec(&json!({
            "target": target,
            "workers": destinations,
            "target_args": args,
        }))?;
        Ok(Self(hex::encode(Sha256::digest(&canonical))))
    }

    /// Abbreviated form for logs
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Filesystem-backed store of distribution plans, one JSON file per key
#[derive(Debug, Clone)]
pub struct PlanCache {
    base_path: PathBuf,
}

impl PlanCache {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn plan_path(&self, app: &str, key: &CacheKey) -> PathBuf {
        self.base_path
            .join(app)
            .join(format!("distribution_{}.json", key.0))
    }

    /// Look up a plan built for exactly these destinations and arguments.
    ///
    /// Unreadable or mismatching entries count as a miss.
    pub fn lookup(
        &self,
        app: &str,
        key: &CacheKey,
        destinations: &Destinations,
        args: &Value,
    ) -> Option<DistributionPlan> {
        let path = self.plan_path(app, key);
        if !path.exists() {
            return None;
        }

        let plan = match Self::load_path(&path) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!("Ignoring unreadable plan {}: {}", path.display(), e);
                return None;
            }
        };

        if &plan.workers != destinations || &plan.target_args != args {
            tracing::warn!("Ignoring stale plan {} (key collision)", path.display());
            return None;
        }

        Some(plan)
    }

    /// Persist a plan; the write goes through a temporary file so readers
    /// never observe a partial plan.
    pub fn store(&self, app: &str, key: &CacheKey, plan: &DistributionPlan) -> Result<PathBuf> {
        let path = self.plan_path(app, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(plan)?)?;
        std::fs::rename(&tmp, &path)?;

        Ok(path)
    }

    pub fn load_path(path: &Path) -> Result<DistributionPlan> {
        let content = std::fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }
}
