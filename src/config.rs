//! Explicit agent configuration
//!
//! Every component receives its configuration at construction time.
//! No module-level singletons; tests substitute fakes freely.

use std::env;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// API key for the Gemini classification/embedding service
    pub gemini_api_key: String,
    /// SQLite connection URL for the authoritative record store
    pub database_url: String,
    /// Port for the HTTP operational surface
    pub port: u16,
    /// Number of labeled neighbors retrieved as few-shot context
    pub neighbor_k: usize,
    /// Confidence floor below which a record is flagged for review
    pub confidence_threshold: f32,
}

impl AgentConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            gemini_api_key: env::var("GEMINI_API_KEY").unwrap_or_default(),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://context_os.db?mode=rwc".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            neighbor_k: 5,
            confidence_threshold: 0.8,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: String::new(),
            database_url: "sqlite::memory:".to_string(),
            port: 8080,
            neighbor_k: 5,
            confidence_threshold: 0.8,
        }
    }
}
