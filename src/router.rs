//! Reasoning router
//!
//! Three-step answer pipeline: classify the question into a tool
//! choice, run the chosen tool, then compose a final answer with a
//! rendering hint. Every LLM boundary is parse-and-validate with a
//! graceful fallback; the router itself never surfaces an error to
//! the caller short of the store being down.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::llm::LlmClient;
use crate::models::{ChatMessage, ClassifiedIntent, RouterResponse, ToolChoice, Widget};
use crate::tools::QueryTool;
use crate::Result;

const HISTORY_WINDOW: usize = 5;
const FALLBACK_CONTEXT_CHARS: usize = 300;

/// Schema surface the classifier is allowed to query. Kept in the
/// prompt, not discovered, so the model cannot wander into internal
/// tables like logs or messages.
const SCHEMA_HINT: &str = "\
transactions(txn_id, user_id, merchant, amount, currency, category, date_posted, status)\n\
events(event_id, user_id, summary, start_iso, end_iso)\n\
entries(entry_id, user_id, entry_type, content, created_at)";

pub struct ReasoningRouter {
    llm: Arc<dyn LlmClient>,
    sql_tool: Arc<dyn QueryTool>,
    graph_tool: Arc<dyn QueryTool>,
}

impl ReasoningRouter {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        sql_tool: Arc<dyn QueryTool>,
        graph_tool: Arc<dyn QueryTool>,
    ) -> Self {
        Self {
            llm,
            sql_tool,
            graph_tool,
        }
    }

    pub async fn answer(&self, question: &str, history: &[ChatMessage]) -> Result<RouterResponse> {
        let intent = self.classify(question, history).await;
        debug!(tool = ?intent.tool, "question classified");

        // Tool failures become context for the answer step instead of
        // aborting the turn; the model explains what went wrong.
        let context = match self.dispatch(&intent, question).await {
            Some(Ok(output)) => output,
            Some(Err(e)) => {
                warn!("tool execution failed: {}", e);
                format!("{{\"tool_error\": \"{}\"}}", e)
            }
            None => String::new(),
        };

        Ok(self.respond(question, history, &context).await)
    }

    async fn classify(&self, question: &str, history: &[ChatMessage]) -> ClassifiedIntent {
        let prompt = classify_prompt(question, history);
        let parsed = self.llm.generate_json(&prompt).await.and_then(|raw| {
            serde_json::from_str::<ClassifiedIntent>(&raw).map_err(Into::into)
        });

        match parsed {
            Ok(intent) => intent,
            Err(e) => {
                // Unparseable classification degrades to plain chat.
                warn!("classification unusable, routing to chat: {}", e);
                ClassifiedIntent {
                    tool: ToolChoice::Chat,
                    argument: None,
                }
            }
        }
    }

    async fn dispatch(&self, intent: &ClassifiedIntent, question: &str) -> Option<Result<String>> {
        let tool: &dyn QueryTool = match intent.tool {
            ToolChoice::Sql => self.sql_tool.as_ref(),
            ToolChoice::Graph => self.graph_tool.as_ref(),
            ToolChoice::Chat => return None,
        };

        let argument = intent.argument.as_deref().unwrap_or(question);
        debug!(tool = tool.name(), argument, "dispatching");
        Some(tool.execute(argument).await)
    }

    async fn respond(
        &self,
        question: &str,
        history: &[ChatMessage],
        context: &str,
    ) -> RouterResponse {
        let prompt = respond_prompt(question, history, context);
        let parsed = self.llm.generate_json(&prompt).await.and_then(|raw| {
            serde_json::from_str::<RouterResponse>(&raw).map_err(Into::into)
        });

        match parsed {
            Ok(response) => response,
            Err(e) => {
                warn!("answer composition failed, using fallback: {}", e);
                fallback_response(context)
            }
        }
    }
}

/// Last-resort answer: surface whatever raw context exists rather
/// than nothing, with no widget.
fn fallback_response(context: &str) -> RouterResponse {
    let text = if context.is_empty() {
        "I couldn't put together an answer for that. Could you rephrase the question?".to_string()
    } else {
        let mut snippet: String = context.chars().take(FALLBACK_CONTEXT_CHARS).collect();
        if snippet.len() < context.len() {
            snippet.push('…');
        }
        format!("Here is what I found: {}", snippet)
    };

    RouterResponse {
        text,
        widget: Widget::none(),
    }
}

fn history_block(history: &[ChatMessage]) -> String {
    let skip = history.len().saturating_sub(HISTORY_WINDOW);
    history[skip..]
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn classify_prompt(question: &str, history: &[ChatMessage]) -> String {
    format!(
        "Decide how to answer a personal-data question.\n\n\
         Tools:\n\
         - SQL_TOOL: aggregates and filters over structured records. Argument is a \
         single SQLite SELECT over this schema:\n{schema}\n\
         - GRAPH_TOOL: contextual 'what do you know about…' questions over notes, \
         events and past conversations. Argument is a short search phrase.\n\
         - CHAT: greetings, opinions, anything needing no data.\n\n\
         Conversation so far:\n{history}\n\n\
         Question: {question}\n\n\
         Respond with JSON: {{\"tool\": \"SQL_TOOL\" | \"GRAPH_TOOL\" | \"CHAT\", \
         \"argument\": string or null}}",
        schema = SCHEMA_HINT,
        history = history_block(history),
        question = question,
    )
}

fn respond_prompt(question: &str, history: &[ChatMessage], context: &str) -> String {
    format!(
        "Answer the user's question in one or two friendly sentences and pick one \
         widget to render the result.\n\n\
         Widgets: bar_chart, line_chart, pie_chart, transaction_list, stat_card, \
         form, none. Use none when no visualization helps. Put the data the widget \
         needs in the widget's data field.\n\n\
         Conversation so far:\n{history}\n\n\
         Question: {question}\n\
         Retrieved context: {context}\n\n\
         Respond with JSON: {{\"text\": string, \"widget\": {{\"type\": string, \
         \"data\": object}}}}",
        history = history_block(history),
        question = question,
        context = if context.is_empty() { "(none)" } else { context },
    )
}
