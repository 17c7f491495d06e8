//! Core data models for the context agent

use serde::{Deserialize, Serialize};
use std::fmt;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EnrichmentStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "NEEDS_USER")]
    NeedsUser,
    #[serde(rename = "COMPLETE")]
    Complete,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "PENDING",
            EnrichmentStatus::NeedsUser => "NEEDS_USER",
            EnrichmentStatus::Complete => "COMPLETE",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "NEEDS_USER" => EnrichmentStatus::NeedsUser,
            "COMPLETE" => EnrichmentStatus::Complete,
            _ => EnrichmentStatus::Pending,
        }
    }
}

impl fmt::Display for EnrichmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sentinel category assigned when the classification service fails
pub const UNCATEGORIZED: &str = "Uncategorized";

//
// ================= Records =================
//

/// Clarification payload carried while a record is NEEDS_USER
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Clarification {
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub txn_id: String,
    pub user_id: String,
    pub merchant: String,
    pub amount: f64,
    pub currency: String,
    pub category: Option<String>,
    /// ISO8601 calendar date "YYYY-MM-DD"
    pub date_posted: String,
    pub status: EnrichmentStatus,
    pub clarification: Option<Clarification>,
    pub synced_to_graph: bool,
    /// Similarity vector stored after the first enrichment pass
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub user_id: String,
    pub summary: String,
    /// ISO8601 timestamp "YYYY-MM-DDTHH:MM:SSZ"
    pub start_iso: String,
    pub end_iso: Option<String>,
    pub series_id: Option<String>,
    pub status: EnrichmentStatus,
    pub synced_to_graph: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub entry_id: String,
    pub user_id: String,
    pub entry_type: String,
    pub content: String,
    pub created_at: String,
    pub status: EnrichmentStatus,
    pub synced_to_graph: bool,
}

//
// ================= Rules =================
//

/// A (pattern, category) pair scoped to a user.
/// The pattern matches as a case-insensitive substring of the display name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub user_id: String,
    pub pattern: String,
    pub category: String,
}

impl Rule {
    pub fn matches(&self, display_name: &str) -> bool {
        display_name
            .to_lowercase()
            .contains(&self.pattern.to_lowercase())
    }
}

//
// ================= Similarity =================
//

/// A labeled neighbor used as few-shot context for classification
#[derive(Debug, Clone, Serialize)]
pub struct SimilarRecord {
    pub merchant: String,
    pub category: String,
    pub similarity: f32,
}

//
// ================= Enrichment Decision =================
//

/// Structured output of the classification call, parsed strictly
/// at the boundary. Invalid payloads map to the fallback path.
#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentDecision {
    pub category: String,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub is_ambiguous: bool,
    #[serde(default)]
    pub clarification_question: Option<String>,
    #[serde(default)]
    pub suggested_options: Vec<String>,
}

/// Outcome counters for one enrichment batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentReport {
    pub auto_completed: usize,
    pub needs_user: usize,
    pub fallback: usize,
    pub events_completed: usize,
}

/// Outcome counters for one graph sync batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub transactions: usize,
    pub events: usize,
    pub entries: usize,
}

impl SyncReport {
    pub fn total(&self) -> usize {
        self.transactions + self.events + self.entries
    }
}

//
// ================= Chat =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "assistant" => MessageRole::Assistant,
            _ => MessageRole::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: String,
    pub thread_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: String,
}

/// LLM analysis of a finished chat thread
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadAnalysis {
    pub summary: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub entities: Vec<EntityRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityRef {
    pub name: String,
    #[serde(rename = "type")]
    pub label: String,
}

//
// ================= Router =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ToolChoice {
    #[serde(rename = "SQL_TOOL")]
    Sql,
    #[serde(rename = "GRAPH_TOOL")]
    Graph,
    #[serde(rename = "CHAT")]
    Chat,
}

/// Parsed output of the CLASSIFY step
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifiedIntent {
    pub tool: ToolChoice,
    #[serde(default)]
    pub argument: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WidgetKind {
    BarChart,
    LineChart,
    PieChart,
    TransactionList,
    StatCard,
    Form,
    None,
}

/// Rendering hint attached to every router answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Widget {
    #[serde(rename = "type")]
    pub kind: WidgetKind,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Widget {
    pub fn none() -> Self {
        Self {
            kind: WidgetKind::None,
            data: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterResponse {
    pub text: String,
    pub widget: Widget,
}

//
// ================= Natural Keys =================
//

/// Derive a stable hex identifier from external fields.
/// Entries lack a provider-assigned id, so the key is content-derived
/// and survives re-ingestion of the same payload.
pub fn stable_key(parts: &[&str]) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..16])
}
