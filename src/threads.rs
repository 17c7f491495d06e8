//! Thread summarization
//!
//! Distills a finished chat thread into a summary, a topic and a set
//! of named entities, persists the summary on the thread row, and
//! projects the result into the graph so later conversations can find
//! it by embedding search. Runs in the background after a chat turn;
//! a failure costs recall, never correctness.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::error::AgentError;
use crate::graph::{EdgeKind, GraphStore, NodeKind, NodeRef};
use crate::llm::LlmClient;
use crate::models::ThreadAnalysis;
use crate::store::RecordStore;
use crate::Result;

pub struct ThreadSummarizer {
    store: RecordStore,
    graph: Arc<dyn GraphStore>,
    llm: Arc<dyn LlmClient>,
}

impl ThreadSummarizer {
    pub fn new(store: RecordStore, graph: Arc<dyn GraphStore>, llm: Arc<dyn LlmClient>) -> Self {
        Self { store, graph, llm }
    }

    pub async fn summarize_thread(&self, thread_id: &str) -> Result<ThreadAnalysis> {
        let messages = self.store.thread_messages(thread_id, 200).await?;
        if messages.is_empty() {
            return Err(AgentError::NotFound(format!(
                "thread {} has no messages",
                thread_id
            )));
        }

        let transcript = messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let raw = self.llm.generate_json(&analysis_prompt(&transcript)).await?;
        let analysis: ThreadAnalysis = serde_json::from_str(&raw)?;

        self.store
            .update_thread_summary(thread_id, &analysis.summary)
            .await?;

        self.project_to_graph(thread_id, &analysis).await?;

        info!(
            thread_id,
            topic = ?analysis.topic,
            entities = analysis.entities.len(),
            "thread summarized"
        );
        Ok(analysis)
    }

    async fn project_to_graph(&self, thread_id: &str, analysis: &ThreadAnalysis) -> Result<()> {
        let embedding = match self.llm.embed(&analysis.summary).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!(thread_id, "summary embedding skipped: {}", e);
                None
            }
        };

        self.graph
            .upsert_node(
                NodeKind::ChatThread,
                thread_id,
                json!({
                    "summary": analysis.summary,
                    "topic": analysis.topic,
                }),
                embedding,
            )
            .await?;

        let thread_ref = NodeRef::new(NodeKind::ChatThread, thread_id);
        for entity in &analysis.entities {
            // Model-proposed labels pass through the closed node-kind
            // set; anything unrecognized lands as a Topic.
            let kind = NodeKind::from_label(&entity.label);
            let key = entity.name.to_lowercase();

            self.graph
                .upsert_node(kind, &key, json!({ "name": entity.name }), None)
                .await?;
            self.graph
                .upsert_edge(&thread_ref, &NodeRef::new(kind, key), EdgeKind::Discussed)
                .await?;
        }

        Ok(())
    }
}

fn analysis_prompt(transcript: &str) -> String {
    format!(
        "Summarize this conversation between a user and their personal assistant.\n\n\
         {transcript}\n\n\
         Respond with JSON: {{\"summary\": one or two sentences, \"topic\": short \
         phrase, \"entities\": [{{\"name\": string, \"type\": \"Person\" | \
         \"Project\" | \"Place\" | \"Topic\"}}]}}. Only list entities actually \
         discussed.",
        transcript = transcript,
    )
}
