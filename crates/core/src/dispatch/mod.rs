// Plan building, caching and artifact cleanup

pub mod cleanup;
pub mod dispatcher;
pub mod plan_cache;

pub use cleanup::{recover_from_permission_error, remove_build_artifacts, remove_path};
pub use dispatcher::{CachedPlan, WorkDispatcher};
pub use plan_cache::{CacheKey, PlanCache};
