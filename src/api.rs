//! HTTP API
//!
//! Thin axum layer over the engines. Every handler returns the same
//! envelope: success flag, payload, error string, timestamp. Engine
//! errors become envelope errors, never panics.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::enrichment::EnrichmentEngine;
use crate::models::{EnrichmentReport, MessageRole, Rule, SyncReport, Transaction, Widget};
use crate::router::ReasoningRouter;
use crate::store::{ActivityItem, NewEntry, NewEvent, NewTransaction, RecordStore};
use crate::sync::GraphSyncEngine;
use crate::threads::ThreadSummarizer;
use crate::Result;

#[derive(Clone)]
pub struct ApiState {
    pub store: RecordStore,
    pub enrichment: Arc<EnrichmentEngine>,
    pub sync: Arc<GraphSyncEngine>,
    pub router: Arc<ReasoningRouter>,
    pub summarizer: Arc<ThreadSummarizer>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now().to_rfc3339(),
        })
    }

    fn err(message: impl ToString) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(message.to_string()),
            timestamp: Utc::now().to_rfc3339(),
        })
    }

    fn from_result(result: Result<T>) -> Json<Self> {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(e),
        }
    }
}

pub fn app(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/ingest/transactions", post(ingest_transactions))
        .route("/api/ingest/events", post(ingest_events))
        .route("/api/ingest/entries", post(ingest_entries))
        .route("/api/enrichment/run", post(run_enrichment))
        .route("/api/enrichment/reset", post(reset_enrichment))
        .route("/api/review", get(review_queue))
        .route("/api/feedback", post(apply_feedback))
        .route("/api/rules", post(promote_rule).get(list_rules))
        .route("/api/graph/sync", post(run_graph_sync))
        .route("/api/graph/link", post(run_temporal_link))
        .route("/api/chat", post(chat))
        .route("/api/threads/:thread_id/summarize", post(summarize_thread))
        .route("/api/activity", get(recent_activity))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<ApiResponse<&'static str>> {
    ApiResponse::ok("ok")
}

//
// ================= Ingestion =================
//

#[derive(Debug, Serialize)]
pub struct IngestSummary {
    pub ingested: usize,
}

async fn ingest_transactions(
    State(state): State<ApiState>,
    Json(payload): Json<Vec<NewTransaction>>,
) -> Json<ApiResponse<IngestSummary>> {
    let count = payload.len();
    for txn in &payload {
        if let Err(e) = state.store.upsert_transaction(txn).await {
            return ApiResponse::err(e);
        }
    }

    info!(count, "transactions ingested");
    ApiResponse::ok(IngestSummary { ingested: count })
}

async fn ingest_events(
    State(state): State<ApiState>,
    Json(payload): Json<Vec<NewEvent>>,
) -> Json<ApiResponse<IngestSummary>> {
    let count = payload.len();
    for event in &payload {
        if let Err(e) = state.store.upsert_event(event).await {
            return ApiResponse::err(e);
        }
    }

    info!(count, "events ingested");
    ApiResponse::ok(IngestSummary { ingested: count })
}

async fn ingest_entries(
    State(state): State<ApiState>,
    Json(payload): Json<Vec<NewEntry>>,
) -> Json<ApiResponse<IngestSummary>> {
    let count = payload.len();
    for entry in &payload {
        if let Err(e) = state.store.add_entry(entry).await {
            return ApiResponse::err(e);
        }
    }

    ApiResponse::ok(IngestSummary { ingested: count })
}

//
// ================= Enrichment =================
//

async fn run_enrichment(State(state): State<ApiState>) -> Json<ApiResponse<EnrichmentReport>> {
    ApiResponse::from_result(state.enrichment.process_pending().await)
}

async fn reset_enrichment(State(state): State<ApiState>) -> Json<ApiResponse<&'static str>> {
    match state.store.reset_enrichment().await {
        Ok(()) => ApiResponse::ok("reset"),
        Err(e) => ApiResponse::err(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: String,
}

async fn review_queue(
    State(state): State<ApiState>,
    Query(query): Query<UserQuery>,
) -> Json<ApiResponse<Vec<Transaction>>> {
    ApiResponse::from_result(state.store.needs_user_transactions(&query.user_id).await)
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub txn_id: String,
    pub category: String,
}

#[derive(Debug, Serialize)]
pub struct FeedbackOutcome {
    pub applied: bool,
}

async fn apply_feedback(
    State(state): State<ApiState>,
    Json(payload): Json<FeedbackRequest>,
) -> Json<ApiResponse<FeedbackOutcome>> {
    match state
        .enrichment
        .apply_feedback(&payload.txn_id, &payload.category)
        .await
    {
        Ok(applied) => ApiResponse::ok(FeedbackOutcome { applied }),
        Err(e) => ApiResponse::err(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RuleRequest {
    pub user_id: String,
    pub pattern: String,
    pub category: String,
}

#[derive(Debug, Serialize)]
pub struct RuleOutcome {
    pub relabeled: u64,
}

async fn promote_rule(
    State(state): State<ApiState>,
    Json(payload): Json<RuleRequest>,
) -> Json<ApiResponse<RuleOutcome>> {
    match state
        .enrichment
        .promote_rule(&payload.user_id, &payload.pattern, &payload.category)
        .await
    {
        Ok(relabeled) => ApiResponse::ok(RuleOutcome { relabeled }),
        Err(e) => ApiResponse::err(e),
    }
}

async fn list_rules(
    State(state): State<ApiState>,
    Query(query): Query<UserQuery>,
) -> Json<ApiResponse<Vec<Rule>>> {
    ApiResponse::from_result(state.store.rules_for_user(&query.user_id).await)
}

//
// ================= Graph =================
//

async fn run_graph_sync(State(state): State<ApiState>) -> Json<ApiResponse<SyncReport>> {
    ApiResponse::from_result(state.sync.sync_all().await)
}

#[derive(Debug, Serialize)]
pub struct LinkOutcome {
    pub created: usize,
}

async fn run_temporal_link(State(state): State<ApiState>) -> Json<ApiResponse<LinkOutcome>> {
    match state.sync.link_same_day().await {
        Ok(created) => ApiResponse::ok(LinkOutcome { created }),
        Err(e) => ApiResponse::err(e),
    }
}

//
// ================= Chat =================
//

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub message: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatReply {
    pub thread_id: String,
    pub text: String,
    pub widget: Widget,
}

async fn chat(
    State(state): State<ApiState>,
    Json(payload): Json<ChatRequest>,
) -> Json<ApiResponse<ChatReply>> {
    ApiResponse::from_result(run_chat_turn(&state, payload).await)
}

async fn run_chat_turn(state: &ApiState, payload: ChatRequest) -> Result<ChatReply> {
    let thread_id = match payload.thread_id {
        Some(id) => id,
        None => match state.store.active_thread(&payload.user_id).await? {
            Some(id) => id,
            None => state.store.create_thread(&payload.user_id).await?,
        },
    };

    // History is everything before this turn; the new question rides
    // in the prompt itself.
    let history = state.store.thread_history(&thread_id, 10).await?;

    state
        .store
        .save_message(&thread_id, MessageRole::User, &payload.message)
        .await?;

    let response = state.router.answer(&payload.message, &history).await?;

    state
        .store
        .save_message(&thread_id, MessageRole::Assistant, &response.text)
        .await?;

    Ok(ChatReply {
        thread_id,
        text: response.text,
        widget: response.widget,
    })
}

#[derive(Debug, Serialize)]
pub struct SummarizeOutcome {
    pub queued: bool,
}

/// Kicks the summarizer off in the background and returns immediately;
/// the chat path never waits on summarization.
async fn summarize_thread(
    State(state): State<ApiState>,
    Path(thread_id): Path<String>,
) -> Json<ApiResponse<SummarizeOutcome>> {
    let summarizer = state.summarizer.clone();
    tokio::spawn(async move {
        if let Err(e) = summarizer.summarize_thread(&thread_id).await {
            warn!(thread_id, "background summarization failed: {}", e);
        }
    });

    ApiResponse::ok(SummarizeOutcome { queued: true })
}

//
// ================= Activity =================
//

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    pub user_id: String,
    #[serde(default = "default_activity_limit")]
    pub limit: usize,
}

fn default_activity_limit() -> usize {
    20
}

async fn recent_activity(
    State(state): State<ApiState>,
    Query(query): Query<ActivityQuery>,
) -> Json<ApiResponse<Vec<ActivityItem>>> {
    ApiResponse::from_result(state.store.recent_activity(&query.user_id, query.limit).await)
}
