//! Process graph model: node/edge shape and structural validation (C1).

use std::collections::{HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeClass {
    Start,
    UserTask,
    ReceiveTask,
    ExclusiveGateway,
    ParallelGateway,
    End,
}

impl NodeClass {
    pub fn requires_assignee(&self) -> bool {
        matches!(self, NodeClass::UserTask | NodeClass::ReceiveTask)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    pub clazz: NodeClass,
    /// Default assignee expression, resolved by the variable resolver (C2).
    #[serde(default)]
    pub processor: Vec<Value>,
    #[serde(default)]
    pub process_method: Option<String>,
    /// User ids cc'd on notifications raised while this node is active.
    #[serde(default)]
    pub cc: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    /// AND-combined clauses; empty means "always matches" (the common case
    /// for non-gateway edges).
    #[serde(default)]
    pub condition_expression: Vec<crate::condition::Clause>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub id: i64,
    pub name: String,
    pub graph: Graph,
    pub submit_count: i64,
    /// Ordered notification channel codes raised while this process is
    /// running (1 = email, further codes reserved). Sourced from the
    /// process definition, not per-work-order.
    #[serde(default)]
    pub notice: Vec<i64>,
}

impl Graph {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn edges_from(&self, node_id: &str) -> Vec<&GraphEdge> {
        self.edges.iter().filter(|e| e.source == node_id).collect()
    }

    pub fn edges_to(&self, node_id: &str) -> Vec<&GraphEdge> {
        self.edges.iter().filter(|e| e.target == node_id).collect()
    }

    pub fn start_node(&self) -> Result<&GraphNode, EngineError> {
        let starts: Vec<&GraphNode> = self
            .nodes
            .iter()
            .filter(|n| n.clazz == NodeClass::Start)
            .collect();
        match starts.len() {
            1 => Ok(starts[0]),
            0 => Err(EngineError::GraphMalformed("no start node".into())),
            n => Err(EngineError::GraphMalformed(format!(
                "expected exactly one start node, found {n}"
            ))),
        }
    }

    /// A parallel gateway is a *fork* when it has exactly one inbound edge
    /// and more than one outbound edge; a *join* is the mirror image.
    pub fn is_fork(&self, node_id: &str) -> bool {
        self.edges_to(node_id).len() <= 1 && self.edges_from(node_id).len() > 1
    }

    pub fn is_join(&self, node_id: &str) -> bool {
        self.edges_to(node_id).len() > 1 && self.edges_from(node_id).len() <= 1
    }

    /// Structural validation: duplicate ids, dangling edge endpoints, the
    /// start-node cardinality check, reachability from start, and
    /// fork/join edge-count pairing for parallel gateways.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut seen_ids = HashSet::new();
        for node in &self.nodes {
            if !seen_ids.insert(node.id.as_str()) {
                return Err(EngineError::GraphMalformed(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
        }

        for edge in &self.edges {
            if self.node(&edge.source).is_none() {
                return Err(EngineError::GraphMalformed(format!(
                    "edge {} has unknown source {}",
                    edge.id, edge.source
                )));
            }
            if self.node(&edge.target).is_none() {
                return Err(EngineError::GraphMalformed(format!(
                    "edge {} has unknown target {}",
                    edge.id, edge.target
                )));
            }
        }

        let start = self.start_node()?;

        if !self.nodes.iter().any(|n| n.clazz == NodeClass::End) {
            return Err(EngineError::GraphMalformed("no end node".into()));
        }

        let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
        let mut g = DiGraph::<&str, ()>::new();
        for node in &self.nodes {
            let idx = g.add_node(node.id.as_str());
            index_of.insert(node.id.as_str(), idx);
        }
        for edge in &self.edges {
            g.add_edge(index_of[edge.source.as_str()], index_of[edge.target.as_str()], ());
        }

        let mut dfs = Dfs::new(&g, index_of[start.id.as_str()]);
        let mut reached = HashSet::new();
        while let Some(idx) = dfs.next(&g) {
            reached.insert(idx);
        }
        for node in &self.nodes {
            if !reached.contains(&index_of[node.id.as_str()]) {
                return Err(EngineError::GraphMalformed(format!(
                    "node {} is unreachable from the start node",
                    node.id
                )));
            }
        }

        for node in &self.nodes {
            if node.clazz != NodeClass::ParallelGateway {
                continue;
            }
            let inbound = self.edges_to(&node.id).len();
            let outbound = self.edges_from(&node.id).len();
            let is_fork = inbound <= 1 && outbound > 1;
            let is_join = inbound > 1 && outbound <= 1;
            if !is_fork && !is_join {
                return Err(EngineError::GraphMalformed(format!(
                    "parallel gateway {} is neither a fork nor a join ({} in, {} out)",
                    node.id, inbound, outbound
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, clazz: NodeClass) -> GraphNode {
        GraphNode {
            id: id.to_string(),
            label: id.to_string(),
            clazz,
            processor: vec![],
            process_method: None,
            cc: vec![],
        }
    }

    fn edge(id: &str, source: &str, target: &str) -> GraphEdge {
        GraphEdge {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            condition_expression: vec![],
        }
    }

    #[test]
    fn linear_graph_is_valid() {
        let g = Graph {
            nodes: vec![
                node("n1", NodeClass::Start),
                node("n2", NodeClass::UserTask),
                node("n3", NodeClass::End),
            ],
            edges: vec![edge("e1", "n1", "n2"), edge("e2", "n2", "n3")],
        };
        assert!(g.validate().is_ok());
    }

    #[test]
    fn unreachable_node_is_rejected() {
        let g = Graph {
            nodes: vec![
                node("n1", NodeClass::Start),
                node("n2", NodeClass::End),
                node("n3", NodeClass::UserTask),
            ],
            edges: vec![edge("e1", "n1", "n2")],
        };
        assert!(matches!(g.validate(), Err(EngineError::GraphMalformed(_))));
    }

    #[test]
    fn multiple_start_nodes_rejected() {
        let g = Graph {
            nodes: vec![
                node("n1", NodeClass::Start),
                node("n2", NodeClass::Start),
                node("n3", NodeClass::End),
            ],
            edges: vec![edge("e1", "n1", "n3"), edge("e2", "n2", "n3")],
        };
        assert!(matches!(g.validate(), Err(EngineError::GraphMalformed(_))));
    }

    #[test]
    fn unpaired_parallel_gateway_rejected() {
        let g = Graph {
            nodes: vec![
                node("n1", NodeClass::Start),
                node("n2", NodeClass::ParallelGateway),
                node("n3", NodeClass::End),
            ],
            edges: vec![edge("e1", "n1", "n2"), edge("e2", "n2", "n3")],
        };
        assert!(matches!(g.validate(), Err(EngineError::GraphMalformed(_))));
    }
}
