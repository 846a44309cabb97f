use crate::error::{DistError, Result};
use crate::types::PlanNode;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// DAG representation of one partition
pub struct PartitionDag<'a> {
    graph: DiGraph<&'a PlanNode, ()>,
    order: Vec<NodeIndex>,
}

impl<'a> PartitionDag<'a> {
    /// Build and topologically sort the dependency graph of a partition
    pub fn from_nodes(partition: usize, nodes: &'a [PlanNode]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut node_indices = HashMap::new();

        // Add all nodes
        for node in nodes {
            let idx = graph.add_node(node);
            if node_indices.insert(node.name.as_str(), idx).is_some() {
                return Err(DistError::config(format!(
                    "node '{}' defined twice in partition {}",
                    node.name, partition
                )));
            }
        }

        // Add dependency edges (dep -> node)
        for node in nodes {
            let node_idx = node_indices[node.name.as_str()];
            for dep in &node.dependencies {
                let dep_idx = node_indices.get(dep.as_str()).ok_or_else(|| {
                    DistError::config(format!(
                        "dependency '{}' of node '{}' not found in partition {}",
                        dep, node.name, partition
                    ))
                })?;
                graph.add_edge(*dep_idx, node_idx, ());
            }
        }

        let order = petgraph::algo::toposort(&graph, None).map_err(|cycle| DistError::Cycle {
            partition,
            node: graph[cycle.node_id()].name.clone(),
        })?;

        Ok(Self {
            graph,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Nodes in topological order (dependencies first)
    pub fn topological_order(&self) -> Vec<&'a PlanNode> {
        self.order.iter().map(|idx| self.graph[*idx]).collect()
    }

    /// Nodes with no dependencies
    pub fn entry_nodes(&self) -> Vec<&'a PlanNode> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, petgraph::Direction::Incoming)
                    .count()
                    == 0
            })
            .map(|n| self.graph[n])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Vec<PlanNode> {
        vec![
            PlanNode::new("d", "join").after("b").after("c"),
            PlanNode::new("b", "left").after("a"),
            PlanNode::new("a", "load"),
            PlanNode::new("c", "right").after("a"),
        ]
    }

    fn position(order: &[&PlanNode], name: &str) -> usize {
        order.iter().position(|n| n.name == name).unwrap()
    }

    #[test]
    fn test_diamond_order() {
        let nodes = diamond();
        let dag = PartitionDag::from_nodes(0, &nodes).unwrap();
        let order = dag.topological_order();

        assert_eq!(order.len(), 4);
        assert!(position(&order, "a") < position(&order, "b"));
        assert!(position(&order, "a") < position(&order, "c"));
        assert!(position(&order, "b") < position(&order, "d"));
        assert!(position(&order, "c") < position(&order, "d"));

        let entry: Vec<_> = dag.entry_nodes().iter().map(|n| n.name.clone()).collect();
        assert_eq!(entry, vec!["a".to_string()]);
    }

    #[test]
    fn test_cyclic_partition_rejected() {
        let nodes = vec![
            PlanNode::new("a", "f").after("b"),
            PlanNode::new("b", "g").after("a"),
        ];

        let result = PartitionDag::from_nodes(3, &nodes);
        assert!(matches!(result, Err(DistError::Cycle { partition: 3, .. })));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let nodes = vec![PlanNode::new("a", "f").after("ghost")];
        let result = PartitionDag::from_nodes(0, &nodes);
        assert!(matches!(result, Err(DistError::Configuration(_))));
    }

    #[test]
    fn test_ready_nodes() {
        let nodes = diamond();
        let dag = PartitionDag::from_nodes(0, &nodes).unwrap();

        let mut completed = HashSet::new();
        let mut started = HashSet::new();
        let ready: Vec<_> = dag.ready_nodes(&completed, &started).iter().map(|n| n.name.clone()).collect();
        assert_eq!(ready, vec!["a".to_string()]);

        completed.insert("a".to_string());
        started.insert("a".to_string());
        let mut ready: Vec<_> = dag.ready_nodes(&completed, &started).iter().map(|n| n.name.clone()).collect();
        ready.sort();
        assert_eq!(ready, vec!["b".to_string(), "c".to_string()]);
    }
}
