//! Query tools
//!
//! The two retrieval backends the router can dispatch to: read-only
//! SQL over the record store for aggregates, and embedding search plus
//! one-hop expansion over the graph for contextual questions. Both
//! return a JSON string the router folds into its answer prompt.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row};
use tracing::debug;

use crate::error::AgentError;
use crate::graph::{GraphStore, NodeKind, NodeRef, ScoredNode};
use crate::llm::LlmClient;
use crate::store::RecordStore;
use crate::Result;

const MAX_ROWS: usize = 50;
const TOP_HITS: usize = 3;
const MAX_NEIGHBORS: usize = 5;

/// A retrieval backend the router can hand a query to.
#[async_trait]
pub trait QueryTool: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, argument: &str) -> Result<String>;
}

//
// ================= SQL tool =================
//

/// Executes model-written SELECT statements against the record store.
/// Anything that could mutate is rejected before touching the pool;
/// statements are never rewritten into a safe form.
pub struct SqlMetricsTool {
    store: RecordStore,
}

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "REPLACE", "ATTACH", "PRAGMA",
];

impl SqlMetricsTool {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl QueryTool for SqlMetricsTool {
    fn name(&self) -> &'static str {
        "sql_metrics"
    }

    async fn execute(&self, argument: &str) -> Result<String> {
        let upper = argument.to_uppercase();
        for word in upper.split(|c: char| !c.is_ascii_alphanumeric() && c != '_') {
            if FORBIDDEN_KEYWORDS.contains(&word) {
                return Err(AgentError::ReadOnlyViolation(format!(
                    "statement rejected: contains {}",
                    word
                )));
            }
        }

        debug!(sql = argument, "running metrics query");
        let rows = sqlx::query(argument)
            .fetch_all(self.store.pool())
            .await
            .map_err(|e| AgentError::ToolError(format!("query failed: {}", e)))?;

        let serialized: Vec<Value> = rows.iter().take(MAX_ROWS).map(row_to_json).collect();
        Ok(serde_json::to_string(&json!({
            "rows": serialized,
            "row_count": rows.len().min(MAX_ROWS),
        }))?)
    }
}

/// Column-by-column conversion without knowing the schema up front.
/// SQLite's dynamic typing means a column can only be probed; each
/// concrete decode is attempted in turn.
fn row_to_json(row: &SqliteRow) -> Value {
    let mut object = Map::new();

    for column in row.columns() {
        let index = column.ordinal();
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(index) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
            v.map(|bytes| Value::from(format!("<{} bytes>", bytes.len())))
                .unwrap_or(Value::Null)
        } else {
            Value::Null
        };

        object.insert(column.name().to_string(), value);
    }

    Value::Object(object)
}

//
// ================= Graph context tool =================
//

/// Semantic search over the graph: embed the question, pull the
/// nearest entries, events and thread summaries, expand one hop,
/// and return the merged neighborhood.
pub struct GraphContextTool {
    graph: Arc<dyn GraphStore>,
    llm: Arc<dyn LlmClient>,
}

const SEARCHED_KINDS: &[NodeKind] = &[NodeKind::Entry, NodeKind::Event, NodeKind::ChatThread];

impl GraphContextTool {
    pub fn new(graph: Arc<dyn GraphStore>, llm: Arc<dyn LlmClient>) -> Self {
        Self { graph, llm }
    }
}

#[async_trait]
impl QueryTool for GraphContextTool {
    fn name(&self) -> &'static str {
        "graph_context"
    }

    async fn execute(&self, argument: &str) -> Result<String> {
        let query = self
            .llm
            .embed(argument)
            .await
            .map_err(|e| AgentError::ToolError(format!("query embedding failed: {}", e)))?;

        let mut hits: Vec<ScoredNode> = Vec::new();
        for kind in SEARCHED_KINDS {
            hits.extend(
                self.graph
                    .nearest_by_embedding(*kind, &query, TOP_HITS)
                    .await?,
            );
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(TOP_HITS);

        let mut results = Vec::with_capacity(hits.len());
        for hit in &hits {
            let node_ref = NodeRef::new(hit.node.kind, &hit.node.key);
            let neighbors: Vec<Value> = self
                .graph
                .neighbors(&node_ref)
                .await?
                .into_iter()
                .take(MAX_NEIGHBORS)
                .map(|n| {
                    json!({
                        "kind": n.kind.as_label(),
                        "key": n.key,
                        "properties": n.properties,
                    })
                })
                .collect();

            results.push(json!({
                "kind": hit.node.kind.as_label(),
                "key": hit.node.key,
                "score": hit.score,
                "properties": hit.node.properties,
                "neighbors": neighbors,
            }));
        }

        Ok(serde_json::to_string(&json!({ "matches": results }))?)
    }
}
