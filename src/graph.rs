//! Relationship graph
//!
//! Derived view of the record store: typed nodes keyed by stable
//! identity, typed edges, and embedding search over node payloads.
//! Everything here can be rebuilt from the authoritative store, so
//! writes are modeled as upserts and losing the graph loses nothing.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AgentError;
use crate::store::cosine_similarity;
use crate::Result;

/// Closed set of node labels. Acts as the allowlist for anything
/// (LLM output included) that wants to name a label, so arbitrary
/// strings never reach the graph backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Transaction,
    Merchant,
    Event,
    Entry,
    ChatThread,
    Person,
    Project,
    Place,
    Topic,
}

impl NodeKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            NodeKind::Transaction => "Transaction",
            NodeKind::Merchant => "Merchant",
            NodeKind::Event => "Event",
            NodeKind::Entry => "Entry",
            NodeKind::ChatThread => "ChatThread",
            NodeKind::Person => "Person",
            NodeKind::Project => "Project",
            NodeKind::Place => "Place",
            NodeKind::Topic => "Topic",
        }
    }

    /// Map a free-form label onto the closed set. Unknown labels
    /// collapse to Topic rather than minting new node kinds.
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "transaction" => NodeKind::Transaction,
            "merchant" => NodeKind::Merchant,
            "event" => NodeKind::Event,
            "entry" => NodeKind::Entry,
            "chatthread" | "thread" => NodeKind::ChatThread,
            "person" => NodeKind::Person,
            "project" => NodeKind::Project,
            "place" => NodeKind::Place,
            _ => NodeKind::Topic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    PaidTo,
    SameDay,
    Discussed,
}

impl EdgeKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            EdgeKind::PaidTo => "PAID_TO",
            EdgeKind::SameDay => "SAME_DAY",
            EdgeKind::Discussed => "DISCUSSED",
        }
    }
}

/// (kind, key) identity of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub kind: NodeKind,
    pub key: String,
}

impl NodeRef {
    pub fn new(kind: NodeKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub kind: NodeKind,
    pub key: String,
    pub properties: Value,
    pub embedding: Option<Vec<f32>>,
}

/// Embedding search hit.
#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: GraphNode,
    pub score: f32,
}

/// Storage seam for the graph. The production deployment would sit a
/// driver-backed implementation here; the sync engine and tools only
/// ever see the trait.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Insert or update a node by (kind, key). Properties are replaced
    /// wholesale; a missing embedding leaves any existing one in place.
    async fn upsert_node(
        &self,
        kind: NodeKind,
        key: &str,
        properties: Value,
        embedding: Option<Vec<f32>>,
    ) -> Result<()>;

    /// Insert an edge if absent. Returns true when the edge was
    /// newly created, false when it already existed.
    async fn upsert_edge(&self, from: &NodeRef, to: &NodeRef, kind: EdgeKind) -> Result<bool>;

    /// K nearest nodes of a kind by cosine similarity over stored
    /// embeddings. Nodes without embeddings never match.
    async fn nearest_by_embedding(
        &self,
        kind: NodeKind,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredNode>>;

    /// One-hop neighborhood of a node, either direction.
    async fn neighbors(&self, node: &NodeRef) -> Result<Vec<GraphNode>>;

    async fn nodes_of_kind(&self, kind: NodeKind) -> Result<Vec<GraphNode>>;

    async fn node_count(&self) -> Result<usize>;

    async fn edge_count(&self) -> Result<usize>;
}

//
// ================= In-memory implementation =================
//

#[derive(Default)]
struct GraphInner {
    nodes: HashMap<NodeRef, GraphNode>,
    edges: HashSet<(NodeRef, NodeRef, EdgeKind)>,
}

/// Process-local graph. Upserts by identity give the same idempotence
/// contract a MERGE-based backend would.
#[derive(Default)]
pub struct InMemoryGraphStore {
    inner: RwLock<GraphInner>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn upsert_node(
        &self,
        kind: NodeKind,
        key: &str,
        properties: Value,
        embedding: Option<Vec<f32>>,
    ) -> Result<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| AgentError::GraphUnavailable("graph lock poisoned".to_string()))?;

        let node_ref = NodeRef::new(kind, key);
        let existing_embedding = inner
            .nodes
            .get(&node_ref)
            .and_then(|n| n.embedding.clone());

        inner.nodes.insert(
            node_ref,
            GraphNode {
                kind,
                key: key.to_string(),
                properties,
                embedding: embedding.or(existing_embedding),
            },
        );

        Ok(())
    }

    async fn upsert_edge(&self, from: &NodeRef, to: &NodeRef, kind: EdgeKind) -> Result<bool> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| AgentError::GraphUnavailable("graph lock poisoned".to_string()))?;

        Ok(inner.edges.insert((from.clone(), to.clone(), kind)))
    }

    async fn nearest_by_embedding(
        &self,
        kind: NodeKind,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredNode>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| AgentError::GraphUnavailable("graph lock poisoned".to_string()))?;

        let mut scored: Vec<ScoredNode> = inner
            .nodes
            .values()
            .filter(|n| n.kind == kind)
            .filter_map(|n| {
                n.embedding.as_ref().map(|e| ScoredNode {
                    node: n.clone(),
                    score: cosine_similarity(query, e),
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn neighbors(&self, node: &NodeRef) -> Result<Vec<GraphNode>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| AgentError::GraphUnavailable("graph lock poisoned".to_string()))?;

        let mut found = Vec::new();
        for (from, to, _) in &inner.edges {
            let other = if from == node {
                to
            } else if to == node {
                from
            } else {
                continue;
            };

            if let Some(neighbor) = inner.nodes.get(other) {
                found.push(neighbor.clone());
            }
        }

        Ok(found)
    }

    async fn nodes_of_kind(&self, kind: NodeKind) -> Result<Vec<GraphNode>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| AgentError::GraphUnavailable("graph lock poisoned".to_string()))?;

        Ok(inner
            .nodes
            .values()
            .filter(|n| n.kind == kind)
            .cloned()
            .collect())
    }

    async fn node_count(&self) -> Result<usize> {
        let inner = self
            .inner
            .read()
            .map_err(|_| AgentError::GraphUnavailable("graph lock poisoned".to_string()))?;
        Ok(inner.nodes.len())
    }

    async fn edge_count(&self) -> Result<usize> {
        let inner = self
            .inner
            .read()
            .map_err(|_| AgentError::GraphUnavailable("graph lock poisoned".to_string()))?;
        Ok(inner.edges.len())
    }
}

/// Test double that refuses every call, standing in for an
/// unreachable graph backend.
#[cfg(test)]
pub(crate) struct UnavailableGraphStore;

#[cfg(test)]
#[async_trait]
impl GraphStore for UnavailableGraphStore {
    async fn upsert_node(
        &self,
        _kind: NodeKind,
        _key: &str,
        _properties: Value,
        _embedding: Option<Vec<f32>>,
    ) -> Result<()> {
        Err(AgentError::GraphUnavailable("connection refused".to_string()))
    }

    async fn upsert_edge(&self, _from: &NodeRef, _to: &NodeRef, _kind: EdgeKind) -> Result<bool> {
        Err(AgentError::GraphUnavailable("connection refused".to_string()))
    }

    async fn nearest_by_embedding(
        &self,
        _kind: NodeKind,
        _query: &[f32],
        _k: usize,
    ) -> Result<Vec<ScoredNode>> {
        Err(AgentError::GraphUnavailable("connection refused".to_string()))
    }

    async fn neighbors(&self, _node: &NodeRef) -> Result<Vec<GraphNode>> {
        Err(AgentError::GraphUnavailable("connection refused".to_string()))
    }

    async fn nodes_of_kind(&self, _kind: NodeKind) -> Result<Vec<GraphNode>> {
        Err(AgentError::GraphUnavailable("connection refused".to_string()))
    }

    async fn node_count(&self) -> Result<usize> {
        Err(AgentError::GraphUnavailable("connection refused".to_string()))
    }

    async fn edge_count(&self) -> Result<usize> {
        Err(AgentError::GraphUnavailable("connection refused".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_node_upsert_is_idempotent() {
        let graph = InMemoryGraphStore::new();

        graph
            .upsert_node(NodeKind::Merchant, "uber", json!({"name": "Uber"}), None)
            .await
            .unwrap();
        graph
            .upsert_node(NodeKind::Merchant, "uber", json!({"name": "Uber"}), None)
            .await
            .unwrap();

        assert_eq!(graph.node_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_edge_upsert_reports_creation() {
        let graph = InMemoryGraphStore::new();
        let from = NodeRef::new(NodeKind::Transaction, "t1");
        let to = NodeRef::new(NodeKind::Merchant, "uber");

        assert!(graph.upsert_edge(&from, &to, EdgeKind::PaidTo).await.unwrap());
        assert!(!graph.upsert_edge(&from, &to, EdgeKind::PaidTo).await.unwrap());
        assert_eq!(graph.edge_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_without_embedding_keeps_existing() {
        let graph = InMemoryGraphStore::new();

        graph
            .upsert_node(
                NodeKind::Entry,
                "e1",
                json!({"content": "trip notes"}),
                Some(vec![1.0, 0.0]),
            )
            .await
            .unwrap();
        graph
            .upsert_node(NodeKind::Entry, "e1", json!({"content": "trip notes v2"}), None)
            .await
            .unwrap();

        let hits = graph
            .nearest_by_embedding(NodeKind::Entry, &[1.0, 0.0], 1)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].node.properties["content"], "trip notes v2");
    }

    #[tokio::test]
    async fn test_nearest_filters_by_kind_and_ranks() {
        let graph = InMemoryGraphStore::new();

        graph
            .upsert_node(NodeKind::Entry, "e1", json!({}), Some(vec![1.0, 0.0]))
            .await
            .unwrap();
        graph
            .upsert_node(NodeKind::Entry, "e2", json!({}), Some(vec![0.0, 1.0]))
            .await
            .unwrap();
        graph
            .upsert_node(NodeKind::Event, "ev1", json!({}), Some(vec![1.0, 0.0]))
            .await
            .unwrap();

        let hits = graph
            .nearest_by_embedding(NodeKind::Entry, &[1.0, 0.0], 5)
            .await
            .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].node.key, "e1");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_neighbors_sees_both_directions() {
        let graph = InMemoryGraphStore::new();
        let txn = NodeRef::new(NodeKind::Transaction, "t1");
        let merchant = NodeRef::new(NodeKind::Merchant, "uber");

        graph
            .upsert_node(NodeKind::Transaction, "t1", json!({}), None)
            .await
            .unwrap();
        graph
            .upsert_node(NodeKind::Merchant, "uber", json!({"name": "Uber"}), None)
            .await
            .unwrap();
        graph.upsert_edge(&txn, &merchant, EdgeKind::PaidTo).await.unwrap();

        let from_txn = graph.neighbors(&txn).await.unwrap();
        assert_eq!(from_txn.len(), 1);
        assert_eq!(from_txn[0].key, "uber");

        let from_merchant = graph.neighbors(&merchant).await.unwrap();
        assert_eq!(from_merchant.len(), 1);
        assert_eq!(from_merchant[0].key, "t1");
    }

    #[test]
    fn test_unknown_label_collapses_to_topic() {
        assert_eq!(NodeKind::from_label("Person"), NodeKind::Person);
        assert_eq!(NodeKind::from_label("DROP TABLE"), NodeKind::Topic);
    }
}
