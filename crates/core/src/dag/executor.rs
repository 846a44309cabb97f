use super::assign::{AssignStrategy, RoundRobin};
use super::graph::PartitionDag;
use crate::error::{DistError, Result};
use crate::types::{ModeBits, Partition, PlanNode};
use crate::worker::{NodeCall, Worker};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Lifecycle of one partition inside the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    Pending,
    Sorted,
    Executing,
    Done,
    CycleError,
    Failed,
}

impl PartitionState {
    /// Terminal state for a partition that failed with `error`
    pub fn from_error(error: &DistError) -> Self {
        match error {
            DistError::Cycle { .. } => Self::CycleError,
            _ => Self::Failed,
        }
    }
}

/// Result of executing the partition assigned to one destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionRun {
    /// Destination index
    pub index: usize,
    /// Partition executed, `None` when the index was not assigned one
    pub partition: Option<usize>,
    pub state: PartitionState,
    pub elapsed_secs: f64,
    /// Node names in the order they completed
    pub order: Vec<String>,
    pub results: BTreeMap<String, Value>,
}

impl PartitionRun {
    fn idle(index: usize) -> Self {
        Self {
            index,
            partition: None,
            state: PartitionState::Pending,
            elapsed_secs: 0.0,
            order: Vec::new(),
            results: BTreeMap::new(),
        }
    }
}

/// Runs one destination's partition in dependency order
pub struct DagExecutor {
    worker: Arc<dyn Worker>,
    mode: ModeBits,
    pool_size: usize,
    strategy: Arc<dyn AssignStrategy>,
}

impl DagExecutor {
    pub fn new(worker: Arc<dyn Worker>, mode: ModeBits) -> Self {
        Self {
            worker,
            mode,
            pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            strategy: Arc::new(RoundRobin),
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn AssignStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Execute the partition assigned to destination `index`.
    ///
    /// An unassigned index or an empty partition returns immediately with zero
    /// elapsed time. A cyclic partition fails with [`DistError::Cycle`] before
    /// any node runs.
    pub async fn execute(&self, index: usize, partitions: &[Partition]) -> Result<PartitionRun> {
        let mut run = PartitionRun::idle(index);

        let Some(partition) = self.strategy.assign(index, partitions.len()) else {
            tracing::debug!("No partition assigned to destination {}", index);
            return Ok(run);
        };
        let nodes = partitions.get(partition).ok_or_else(|| {
            DistError::config(format!(
                "partition {} assigned to destination {} is out of range ({} partitions)",
                partition,
                index,
                partitions.len()
            ))
        })?;
        run.partition = Some(partition);

        if nodes.is_empty() {
            return Ok(run);
        }

        let started = Instant::now();
        let dag = PartitionDag::from_nodes(partition, nodes)?;
        run.state = PartitionState::Sorted;
        tracing::debug!(
            "Partition {} sorted: {} nodes, {} entry nodes",
            partition,
            dag.len(),
            dag.entry_nodes().len()
        );

        run.state = PartitionState::Executing;
        let (order, results) = if self.mode.pooled() {
            self.execute_pooled(&dag).await?
        } else {
            self.execute_sequential(&dag).await?
        };

        self.worker.on_complete(&results)?;

        run.order = order;
        run.results = results;
        run.state = PartitionState::Done;
        run.elapsed_secs = started.elapsed().as_secs_f64();

        tracing::info!(
            "Partition {} done on destination {}: {} nodes in {:.3}s",
            partition,
            index,
            run.order.len(),
            run.elapsed_secs
        );

        Ok(run)
    }

    async fn execute_sequential(
        &self,
        dag: &PartitionDag<'_>,
    ) -> Result<(Vec<String>, BTreeMap<String, Value>)> {
        let mut order = Vec::with_capacity(dag.len());
        let mut results = BTreeMap::new();

        for node in dag.topological_order() {
            let call = node_call(node, &results);
            let value = invoke(self.worker.clone(), call).await?;
            order.push(node.name.clone());
            results.insert(node.name.clone(), value);
        }

        Ok((order, results))
    }

    /// Run nodes across a bounded pool. A node is only spawned once every
    /// dependency has produced a result.
    async fn execute_pooled(
        &self,
        dag: &PartitionDag<'_>,
    ) -> Result<(Vec<String>, BTreeMap<String, Value>)> {
        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        let mut tasks: JoinSet<(String, Result<Value>)> = JoinSet::new();
        let mut started: HashSet<String> = HashSet::new();
        let mut completed: HashSet<String> = HashSet::new();
        let mut order = Vec::with_capacity(dag.len());
        let mut results = BTreeMap::new();

        loop {
            for node in dag.ready_nodes(&completed, &started) {
                started.insert(node.name.clone());

                let call = node_call(node, &results);
                let worker = self.worker.clone();
                let semaphore = semaphore.clone();

                tasks.spawn(async move {
                    let name = call.node.clone();
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return (
                            name.clone(),
                            Err(DistError::NodeFailed {
                                node: name,
                                message: "worker pool closed".to_string(),
                            }),
                        );
                    };
                    (name, invoke(worker, call).await)
                });
            }

            if tasks.is_empty() {
                break;
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };

            match joined {
                Ok((name, Ok(value))) => {
                    completed.insert(name.clone());
                    order.push(name.clone());
                    results.insert(name, value);
                }
                Ok((_, Err(e))) => {
                    tasks.abort_all();
                    return Err(e);
                }
                Err(join_error) => {
                    tasks.abort_all();
                    return Err(DistError::NodeFailed {
                        node: "<pool>".to_string(),
                        message: join_error.to_string(),
                    });
                }
            }
        }

        if completed.len() != dag.len() {
            return Err(DistError::config(format!(
                "only {} of {} nodes became ready",
                completed.len(),
                dag.len()
            )));
        }

        Ok((order, results))
    }
}

fn node_call(node: &PlanNode, results: &BTreeMap<String, Value>) -> NodeCall {
    let prior = node
        .dependencies
        .iter()
        .filter_map(|dep| results.get(dep).map(|value| (dep.clone(), value.clone())))
        .collect();

    NodeCall {
        node: node.name.clone(),
        function: node.function.clone(),
        args: node.args.clone(),
        kwargs: node.kwargs.clone(),
        prior,
    }
}

async fn invoke(worker: Arc<dyn Worker>, call: NodeCall) -> Result<Value> {
    let node = call.node.clone();
    tracing::debug!("Invoking node {} ({})", node, call.function);

    let joined = tokio::task::spawn_blocking(move || worker.invoke(&call)).await;
    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(DistError::NodeFailed {
            node,
            message: format!("{e:#}"),
        }),
        Err(join_error) => Err(DistError::NodeFailed {
            node,
            message: join_error.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Destinations;
    use crate::worker::DistributionBuild;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records invocations and checks that every dependency already completed.
    #[derive(Default)]
    struct RecordingWorker {
        invoked: Mutex<Vec<String>>,
        completed: Mutex<HashSet<String>>,
        finished: Mutex<Option<BTreeMap<String, Value>>>,
        fail_on: Option<String>,
    }

    impl Worker for RecordingWorker {
        fn build_distribution(&self, _destinations: &Destinations) -> anyhow::Result<DistributionBuild> {
            Ok(DistributionBuild::default())
        }

        fn invoke(&self, call: &NodeCall) -> anyhow::Result<Value> {
            {
                let completed = self.completed.lock().unwrap();
                for dep in call.prior.keys() {
                    assert!(completed.contains(dep), "{} ran before {}", call.node, dep);
                }
            }
            self.invoked.lock().unwrap().push(call.node.clone());

            if self.fail_on.as_deref() == Some(call.node.as_str()) {
                anyhow::bail!("boom");
            }

            std::thread::sleep(Duration::from_millis(5));
            let upstream: i64 = call.prior.values().filter_map(|v| v.as_i64()).sum();
            self.completed.lock().unwrap().insert(call.node.clone());
            Ok(json!(upstream + 1))
        }

        fn on_complete(&self, results: &BTreeMap<String, Value>) -> anyhow::Result<()> {
            *self.finished.lock().unwrap() = Some(results.clone());
            Ok(())
        }
    }

    fn diamond() -> Partition {
        vec![
            PlanNode::new("d", "join").after("b").after("c"),
            PlanNode::new("b", "left").after("a"),
            PlanNode::new("c", "right").after("a"),
            PlanNode::new("a", "load"),
        ]
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    fn assert_diamond(run: &PartitionRun) {
        assert_eq!(run.state, PartitionState::Done);
        assert_eq!(run.order.len(), 4);
        assert!(position(&run.order, "a") < position(&run.order, "b"));
        assert!(position(&run.order, "a") < position(&run.order, "c"));
        assert!(position(&run.order, "b") < position(&run.order, "d"));
        assert!(position(&run.order, "c") < position(&run.order, "d"));
        // a=1, b=c=2, d=5
        assert_eq!(run.results["d"], json!(5));
    }

    #[tokio::test]
    async fn test_sequential_diamond() {
        let worker = Arc::new(RecordingWorker::default());
        let executor = DagExecutor::new(worker.clone(), ModeBits::PYTHON);

        let run = executor.execute(0, &[diamond()]).await.unwrap();
        assert_diamond(&run);

        let invoked = worker.invoked.lock().unwrap().clone();
        assert_eq!(invoked, run.order);
        assert_eq!(worker.finished.lock().unwrap().as_ref(), Some(&run.results));
    }

    #[tokio::test]
    async fn test_pooled_diamond() {
        let worker = Arc::new(RecordingWorker::default());
        let executor = DagExecutor::new(worker.clone(), ModeBits::DASK).with_pool_size(3);

        let run = executor.execute(0, &[diamond()]).await.unwrap();
        assert_diamond(&run);

        let mut invoked = worker.invoked.lock().unwrap().clone();
        invoked.sort();
        assert_eq!(invoked, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_only_assigned_partition_runs() {
        let partitions = vec![
            vec![PlanNode::new("p0", "f")],
            vec![PlanNode::new("p1-a", "f"), PlanNode::new("p1-b", "f").after("p1-a")],
            vec![PlanNode::new("p2", "f")],
        ];
        let worker = Arc::new(RecordingWorker::default());
        let executor = DagExecutor::new(worker.clone(), ModeBits::PYTHON);

        let run = executor.execute(1, &partitions).await.unwrap();
        assert_eq!(run.partition, Some(1));
        assert_eq!(*worker.invoked.lock().unwrap(), vec!["p1-a", "p1-b"]);
    }

    #[tokio::test]
    async fn test_out_of_range_index_is_noop() {
        let worker = Arc::new(RecordingWorker::default());
        let executor = DagExecutor::new(worker.clone(), ModeBits::PYTHON);

        let run = executor.execute(5, &[diamond()]).await.unwrap();
        assert_eq!(run.partition, None);
        assert_eq!(run.elapsed_secs, 0.0);
        assert!(worker.invoked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_plan_returns_immediately() {
        let worker = Arc::new(RecordingWorker::default());
        let executor = DagExecutor::new(worker.clone(), ModeBits::DASK);

        let run = executor.execute(0, &[]).await.unwrap();
        assert_eq!(run.elapsed_secs, 0.0);
        assert!(run.results.is_empty());

        let run = executor.execute(0, &[Vec::new()]).await.unwrap();
        assert_eq!(run.partition, Some(0));
        assert_eq!(run.elapsed_secs, 0.0);
        assert!(worker.finished.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cycle_aborts_before_any_node() {
        let worker = Arc::new(RecordingWorker::default());
        let executor = DagExecutor::new(worker.clone(), ModeBits::PYTHON);
        let cyclic = vec![PlanNode::new("a", "f").after("b"), PlanNode::new("b", "f").after("a")];

        let err = executor.execute(0, &[cyclic]).await.unwrap_err();
        assert!(matches!(err, DistError::Cycle { partition: 0, .. }));
        assert_eq!(PartitionState::from_error(&err), PartitionState::CycleError);
        assert!(worker.invoked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_node_failure_fails_partition() {
        let worker = Arc::new(RecordingWorker {
            fail_on: Some("b".to_string()),
            ..Default::default()
        });
        let executor = DagExecutor::new(worker.clone(), ModeBits::DASK).with_pool_size(2);

        let err = executor.execute(0, &[diamond()]).await.unwrap_err();
        assert!(matches!(err, DistError::NodeFailed { ref node, .. } if node == "b"));
        assert!(!worker.invoked.lock().unwrap().contains(&"d".to_string()));
    }

    #[tokio::test]
    async fn test_custom_strategy() {
        let partitions = vec![vec![PlanNode::new("first", "f")], vec![PlanNode::new("second", "f")]];
        let worker = Arc::new(RecordingWorker::default());
        let executor = DagExecutor::new(worker.clone(), ModeBits::PYTHON)
            .with_strategy(Arc::new(|_index: usize, count: usize| count.checked_sub(1)));

        let run = executor.execute(0, &partitions).await.unwrap();
        assert_eq!(run.partition, Some(1));
        assert_eq!(*worker.invoked.lock().unwrap(), vec!["second"]);
    }
}
