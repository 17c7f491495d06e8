//! ContextOS Core
//!
//! A personal context agent that:
//! - Ingests financial and calendar records into an authoritative store
//! - Enriches each record with a semantic category (rules → similarity → LLM)
//! - Keeps a human in the loop for low-confidence decisions
//! - Mirrors records into a knowledge graph with idempotent upserts
//! - Infers same-day relationships between transactions and events
//! - Answers natural-language questions through an intent router
//!
//! ENRICHMENT FLOW:
//! INGEST → PENDING → {rule | similarity + LLM} → COMPLETE / NEEDS_USER → GRAPH

pub mod api;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod graph;
pub mod llm;
pub mod models;
pub mod router;
pub mod store;
pub mod sync;
pub mod threads;
pub mod tools;

pub use error::Result;

// Re-export common types
pub use config::AgentConfig;
pub use models::*;
