//! Service entrypoint: wires the store, graph, LLM client and engines
//! together and serves the HTTP API.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use context_os::api::{app, ApiState};
use context_os::enrichment::EnrichmentEngine;
use context_os::graph::InMemoryGraphStore;
use context_os::llm::GeminiClient;
use context_os::router::ReasoningRouter;
use context_os::store::RecordStore;
use context_os::sync::GraphSyncEngine;
use context_os::threads::ThreadSummarizer;
use context_os::tools::{GraphContextTool, SqlMetricsTool};
use context_os::AgentConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AgentConfig::from_env();
    let store = RecordStore::connect(&config.database_url).await?;
    let graph = Arc::new(InMemoryGraphStore::new());
    let llm = Arc::new(GeminiClient::new(config.gemini_api_key.clone()));

    let state = ApiState {
        store: store.clone(),
        enrichment: Arc::new(EnrichmentEngine::new(
            store.clone(),
            llm.clone(),
            config.clone(),
        )),
        sync: Arc::new(GraphSyncEngine::new(
            store.clone(),
            graph.clone(),
            llm.clone(),
        )),
        router: Arc::new(ReasoningRouter::new(
            llm.clone(),
            Arc::new(SqlMetricsTool::new(store.clone())),
            Arc::new(GraphContextTool::new(graph.clone(), llm.clone())),
        )),
        summarizer: Arc::new(ThreadSummarizer::new(store, graph, llm)),
    };

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);

    axum::serve(listener, app(state)).await?;
    Ok(())
}
