//! Graph sync engine
//!
//! Projects unsynced records from the authoritative store into the
//! relationship graph. The sync flag on a record is flipped only after
//! every graph write for the batch has succeeded, so an unreachable
//! graph leaves the whole batch eligible for the next run. Re-running
//! against a healthy graph is a no-op thanks to upsert semantics.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::graph::{EdgeKind, GraphStore, NodeKind, NodeRef};
use crate::llm::LlmClient;
use crate::models::{Entry, Event, SyncReport, Transaction};
use crate::store::RecordStore;
use crate::Result;

pub struct GraphSyncEngine {
    store: RecordStore,
    graph: Arc<dyn GraphStore>,
    llm: Arc<dyn LlmClient>,
}

impl GraphSyncEngine {
    pub fn new(store: RecordStore, graph: Arc<dyn GraphStore>, llm: Arc<dyn LlmClient>) -> Self {
        Self { store, graph, llm }
    }

    /// Push every unsynced record into the graph. On any graph failure
    /// the pass is abandoned with a zero report and no flags flipped;
    /// the next run retries the full set.
    pub async fn sync_all(&self) -> Result<SyncReport> {
        let transactions = self.store.unsynced_transactions().await?;
        let events = self.store.unsynced_events().await?;
        let entries = self.store.unsynced_entries().await?;

        if transactions.is_empty() && events.is_empty() && entries.is_empty() {
            return Ok(SyncReport::default());
        }

        if let Err(e) = self.write_batch(&transactions, &events, &entries).await {
            warn!("graph sync abandoned, will retry: {}", e);
            self.store
                .log_event("graph_sync", &format!("abandoned: {}", e), "warn")
                .await;
            return Ok(SyncReport::default());
        }

        let txn_ids: Vec<String> = transactions.iter().map(|t| t.txn_id.clone()).collect();
        let event_ids: Vec<String> = events.iter().map(|e| e.event_id.clone()).collect();
        let entry_ids: Vec<String> = entries.iter().map(|e| e.entry_id.clone()).collect();

        self.store.mark_transactions_synced(&txn_ids).await?;
        self.store.mark_events_synced(&event_ids).await?;
        self.store.mark_entries_synced(&entry_ids).await?;

        let report = SyncReport {
            transactions: txn_ids.len(),
            events: event_ids.len(),
            entries: entry_ids.len(),
        };

        info!(
            transactions = report.transactions,
            events = report.events,
            entries = report.entries,
            "graph sync finished"
        );
        self.store
            .log_event(
                "graph_sync",
                &format!("synced {} records", report.total()),
                "info",
            )
            .await;

        Ok(report)
    }

    async fn write_batch(
        &self,
        transactions: &[Transaction],
        events: &[Event],
        entries: &[Entry],
    ) -> Result<()> {
        for txn in transactions {
            self.write_transaction(txn).await?;
        }
        for event in events {
            self.write_event(event).await?;
        }
        for entry in entries {
            self.write_entry(entry).await?;
        }
        Ok(())
    }

    async fn write_transaction(&self, txn: &Transaction) -> Result<()> {
        self.graph
            .upsert_node(
                NodeKind::Transaction,
                &txn.txn_id,
                json!({
                    "merchant": txn.merchant,
                    "amount": txn.amount,
                    "currency": txn.currency,
                    "category": txn.category,
                    "date": txn.date_posted,
                }),
                None,
            )
            .await?;

        let merchant_key = txn.merchant.to_lowercase();
        self.graph
            .upsert_node(
                NodeKind::Merchant,
                &merchant_key,
                json!({ "name": txn.merchant }),
                None,
            )
            .await?;

        self.graph
            .upsert_edge(
                &NodeRef::new(NodeKind::Transaction, &txn.txn_id),
                &NodeRef::new(NodeKind::Merchant, merchant_key),
                EdgeKind::PaidTo,
            )
            .await?;

        Ok(())
    }

    async fn write_event(&self, event: &Event) -> Result<()> {
        let embedding = self.embed_or_skip(&event.summary).await;

        self.graph
            .upsert_node(
                NodeKind::Event,
                &event.event_id,
                json!({
                    "summary": event.summary,
                    "start": event.start_iso,
                    "end": event.end_iso,
                    "series_id": event.series_id,
                }),
                embedding,
            )
            .await
    }

    async fn write_entry(&self, entry: &Entry) -> Result<()> {
        let embedding = self.embed_or_skip(&entry.content).await;

        self.graph
            .upsert_node(
                NodeKind::Entry,
                &entry.entry_id,
                json!({
                    "content": entry.content,
                    "entry_type": entry.entry_type,
                    "created_at": entry.created_at,
                }),
                embedding,
            )
            .await
    }

    /// Embeddings on graph nodes power semantic search but are not
    /// required for correctness; an embedding outage degrades to a
    /// node without one rather than failing the batch.
    async fn embed_or_skip(&self, text: &str) -> Option<Vec<f32>> {
        match self.llm.embed(text).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!("embedding skipped during sync: {}", e);
                None
            }
        }
    }

    /// Connect transactions to calendar events that share a calendar
    /// day. Compares the transaction date with the date part of the
    /// event start. Returns the number of edges actually created, so
    /// an immediate re-run reports zero.
    pub async fn link_same_day(&self) -> Result<usize> {
        let transactions = self.graph.nodes_of_kind(NodeKind::Transaction).await?;
        let events = self.graph.nodes_of_kind(NodeKind::Event).await?;

        let mut created = 0;
        for txn in &transactions {
            let Some(txn_date) = txn.properties["date"].as_str() else {
                continue;
            };

            for event in &events {
                let Some(start) = event.properties["start"].as_str() else {
                    continue;
                };
                // Timestamps arrive unvalidated; a start too short or
                // broken at the date boundary is skipped, not fatal.
                let Some(event_date) = start.get(..10) else {
                    continue;
                };

                if txn_date == event_date
                    && self
                        .graph
                        .upsert_edge(
                            &NodeRef::new(NodeKind::Transaction, &txn.key),
                            &NodeRef::new(NodeKind::Event, &event.key),
                            EdgeKind::SameDay,
                        )
                        .await?
                {
                    created += 1;
                }
            }
        }

        info!(created, "temporal linking finished");
        Ok(created)
    }
}
