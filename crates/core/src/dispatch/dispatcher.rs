use super::plan_cache::{CacheKey, PlanCache};
use crate::error::{DistError, Result};
use crate::types::{AppEnv, Destinations, DistributionPlan};
use crate::worker::{DependencyInstaller, Worker, WorkerRegistry};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

/// A plan together with where it lives in the cache
#[derive(Debug, Clone)]
pub struct CachedPlan {
    pub key: CacheKey,
    pub path: PathBuf,
    pub plan: DistributionPlan,
    /// True when the plan came from the cache instead of a fresh build
    pub reused: bool,
}

/// Builds distribution plans through the application's worker and caches them
pub struct WorkDispatcher {
    registry: Arc<WorkerRegistry>,
    cache: PlanCache,
    installer: Option<Arc<dyn DependencyInstaller>>,
}

impl WorkDispatcher {
    pub fn new(registry: Arc<WorkerRegistry>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            cache: PlanCache::new(cache_dir),
            installer: None,
        }
    }

    pub fn with_installer(mut self, installer: Arc<dyn DependencyInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn cache(&self) -> &PlanCache {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Return the cached plan for (target, destinations, args), building it
    /// through the application's worker on a miss. At most one build happens
    /// per key.
    pub fn build_or_reuse(
        &self,
        env: &AppEnv,
        destinations: &Destinations,
        args: &Value,
    ) -> Result<CachedPlan> {
        let key = CacheKey::compute(&env.target, destinations, args)?;

        if let Some(plan) = self.cache.lookup(&env.app, &key, destinations, args) {
            tracing::info!("Reusing cached plan {} for {}", key.short(), env.target);
            return Ok(CachedPlan {
                path: self.cache.plan_path(&env.app, &key),
                key,
                plan,
                reused: true,
            });
        }

        let worker = self.resolve_worker(&env.app, args)?;
        let build = worker.build_distribution(destinations)?;

        if !build.partitions_info.is_empty() && build.partitions_info.len() != build.partitions.len() {
            tracing::warn!(
                "Worker for {} returned info for {} partitions but {} partitions",
                env.app,
                build.partitions_info.len(),
                build.partitions.len()
            );
        }

        let mut plan = DistributionPlan {
            target: env.target.clone(),
            plan_id: build.plan_id,
            partition_label: build.partition_label,
            unit_label: build.unit_label,
            workers: destinations.clone(),
            target_args: args.clone(),
            partitions: build.partitions,
            partitions_info: build.partitions_info,
            created_at: chrono::Utc::now(),
        };
        plan.sanitize();

        let path = self.cache.store(&env.app, &key, &plan)?;
        tracing::info!(
            "Built plan {} for {}: {} partitions, {} nodes",
            key.short(),
            env.target,
            plan.partitions.len(),
            plan.node_count()
        );

        Ok(CachedPlan {
            key,
            path,
            plan,
            reused: false,
        })
    }

    /// Construct the application's worker. When it is not registered, the
    /// dependency installer runs once and the lookup is retried once.
    pub fn resolve_worker(&self, app: &str, args: &Value) -> Result<Arc<dyn Worker>> {
        if !self.registry.contains(app) {
            let Some(installer) = &self.installer else {
                return Err(DistError::config(format!(
                    "no worker registered for app '{app}'"
                )));
            };

            tracing::warn!("Worker for {} not found, attempting install", app);
            if let Err(e) = installer.install(app, &self.registry) {
                tracing::warn!("Installing worker for {} failed: {:#}", app, e);
            }

            if !self.registry.contains(app) {
                return Err(DistError::config(format!(
                    "no worker registered for app '{app}' after install attempt"
                )));
            }
        }

        self.registry.create(app, args)
    }
}
