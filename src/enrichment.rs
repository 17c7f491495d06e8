//! Enrichment engine
//!
//! Drives records from PENDING to COMPLETE or NEEDS_USER. Transactions
//! go through three layers in order: user rules, embedding similarity
//! over already-labeled records, then LLM classification. Each record
//! is processed in isolation; one bad record never aborts the batch.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::llm::LlmClient;
use crate::models::{
    Clarification, EnrichmentDecision, EnrichmentReport, SimilarRecord, Transaction, UNCATEGORIZED,
};
use crate::store::RecordStore;
use crate::Result;

pub struct EnrichmentEngine {
    store: RecordStore,
    llm: Arc<dyn LlmClient>,
    config: AgentConfig,
}

impl EnrichmentEngine {
    pub fn new(store: RecordStore, llm: Arc<dyn LlmClient>, config: AgentConfig) -> Self {
        Self { store, llm, config }
    }

    /// One enrichment pass over everything PENDING. Safe to re-run:
    /// an empty pending set produces an all-zero report.
    pub async fn process_pending(&self) -> Result<EnrichmentReport> {
        let mut report = EnrichmentReport::default();

        for txn in self.store.pending_transactions().await? {
            match self.enrich_transaction(&txn).await {
                Ok(outcome) => match outcome {
                    Outcome::AutoCompleted => report.auto_completed += 1,
                    Outcome::NeedsUser => report.needs_user += 1,
                    Outcome::Fallback => report.fallback += 1,
                },
                Err(e) => {
                    // Isolation of last resort: even an unexpected store
                    // error on one record must not stop the batch.
                    warn!(txn_id = %txn.txn_id, "enrichment failed: {}", e);
                    self.store
                        .log_event("enrichment", &format!("{}: {}", txn.txn_id, e), "error")
                        .await;
                }
            }
        }

        // Calendar events carry no category; enrichment just confirms them.
        for event in self.store.pending_events().await? {
            if self.store.set_event_complete(&event.event_id).await? {
                report.events_completed += 1;
            }
        }

        info!(
            auto = report.auto_completed,
            needs_user = report.needs_user,
            fallback = report.fallback,
            events = report.events_completed,
            "enrichment pass finished"
        );
        self.store
            .log_event(
                "enrichment",
                &format!(
                    "pass: {} auto, {} flagged, {} fallback",
                    report.auto_completed, report.needs_user, report.fallback
                ),
                "info",
            )
            .await;

        Ok(report)
    }

    async fn enrich_transaction(&self, txn: &Transaction) -> Result<Outcome> {
        // Layer 1: user rules decide with full confidence.
        for rule in self.store.rules_for_user(&txn.user_id).await? {
            if rule.matches(&txn.merchant) {
                self.store
                    .set_transaction_complete(&txn.txn_id, &rule.category)
                    .await?;
                return Ok(Outcome::AutoCompleted);
            }
        }

        // Layer 2: embed the merchant and pull labeled neighbors as
        // few-shot context. An embedding failure degrades to an
        // unassisted classification instead of failing the record.
        let neighbors = match self.llm.embed(&txn.merchant).await {
            Ok(vector) => {
                self.store.store_embedding(&txn.txn_id, &vector).await?;
                self.store
                    .find_similar(&txn.user_id, &vector, self.config.neighbor_k)
                    .await?
            }
            Err(e) => {
                warn!(txn_id = %txn.txn_id, "embedding unavailable: {}", e);
                Vec::new()
            }
        };

        // Layer 3: LLM classification. Any failure here, transport or
        // malformed output, lands the record in the known-bad bucket
        // so a later review can find it.
        let prompt = classify_prompt(txn, &neighbors);
        let parsed = self.llm.generate_json(&prompt).await.and_then(|raw| {
            serde_json::from_str::<EnrichmentDecision>(&raw).map_err(Into::into)
        });
        let decision = match parsed {
            Ok(decision) => decision,
            Err(e) => {
                warn!(txn_id = %txn.txn_id, "classification failed, using fallback: {}", e);
                self.store
                    .set_transaction_complete(&txn.txn_id, UNCATEGORIZED)
                    .await?;
                return Ok(Outcome::Fallback);
            }
        };

        if decision.is_ambiguous || decision.confidence < self.config.confidence_threshold {
            let clarification = Clarification {
                question: decision.clarification_question.unwrap_or_else(|| {
                    format!("Which category fits \"{}\"?", txn.merchant)
                }),
                options: if decision.suggested_options.is_empty() {
                    neighbors.iter().map(|n| n.category.clone()).collect()
                } else {
                    decision.suggested_options
                },
            };

            self.store
                .set_transaction_needs_user(
                    &txn.txn_id,
                    Some(&decision.category),
                    &clarification,
                )
                .await?;
            return Ok(Outcome::NeedsUser);
        }

        self.store
            .set_transaction_complete(&txn.txn_id, &decision.category)
            .await?;
        Ok(Outcome::AutoCompleted)
    }

    /// User answer for a flagged (or any) record: trust it outright.
    /// Returns false when the record does not exist, which callers
    /// treat as a no-op.
    pub async fn apply_feedback(&self, txn_id: &str, category: &str) -> Result<bool> {
        let found = self.store.set_transaction_complete(txn_id, category).await?;
        if found {
            info!(txn_id, category, "feedback applied");
        } else {
            warn!(txn_id, "feedback for unknown transaction ignored");
        }
        Ok(found)
    }

    /// Promote a recurring answer into a standing rule and re-label
    /// history in the same stroke. Returns the re-label count.
    pub async fn promote_rule(&self, user_id: &str, pattern: &str, category: &str) -> Result<u64> {
        let relabeled = self.store.add_rule(user_id, pattern, category).await?;
        info!(user_id, pattern, category, relabeled, "rule promoted");
        self.store
            .log_event(
                "rules",
                &format!("'{}' -> {} ({} re-labeled)", pattern, category, relabeled),
                "info",
            )
            .await;
        Ok(relabeled)
    }
}

enum Outcome {
    AutoCompleted,
    NeedsUser,
    Fallback,
}

fn classify_prompt(txn: &Transaction, neighbors: &[SimilarRecord]) -> String {
    let mut prompt = String::from(
        "Classify this financial transaction into a single spending category \
         (e.g. Transport, Groceries, Dining, Shopping, Utilities, Entertainment, \
         Travel, Health, Income).\n\n",
    );

    prompt.push_str(&format!(
        "Transaction: merchant=\"{}\" amount={:.2} {} date={}\n",
        txn.merchant, txn.amount, txn.currency, txn.date_posted
    ));
    prompt.push_str("No user-defined rule matched this merchant.\n");

    if !neighbors.is_empty() {
        prompt.push_str("\nSimilar past transactions already categorized:\n");
        for n in neighbors {
            prompt.push_str(&format!(
                "- \"{}\" -> {} (similarity {:.2})\n",
                n.merchant, n.category, n.similarity
            ));
        }
    }

    prompt.push_str(
        "\nRespond with JSON: {\"category\": string, \"confidence\": number 0-1, \
         \"is_ambiguous\": bool, \"clarification_question\": string or null, \
         \"suggested_options\": [string]}. Set is_ambiguous and a clarification \
         question when the merchant genuinely fits multiple categories.",
    );

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::fake::FakeLlm;
    use crate::models::EnrichmentStatus;
    use crate::store::NewTransaction;

    fn txn(id: &str, merchant: &str) -> NewTransaction {
        NewTransaction {
            txn_id: id.to_string(),
            user_id: "u1".to_string(),
            merchant: merchant.to_string(),
            amount: -12.0,
            currency: "USD".to_string(),
            date_posted: "2026-08-02".to_string(),
        }
    }

    async fn engine_with(llm: Arc<FakeLlm>) -> (EnrichmentEngine, RecordStore) {
        let store = RecordStore::open_in_memory().await.unwrap();
        let engine = EnrichmentEngine::new(store.clone(), llm, AgentConfig::default());
        (engine, store)
    }

    #[tokio::test]
    async fn test_rule_match_skips_llm() {
        // No scripted replies: any LLM call would error the record.
        let llm = Arc::new(FakeLlm::new());
        let (engine, store) = engine_with(llm).await;

        // Rule exists before the record arrives, so the retroactive
        // relabel in add_rule touches nothing and the record reaches
        // the batch still PENDING.
        store.add_rule("u1", "uber", "Transport").await.unwrap();
        store.upsert_transaction(&txn("t1", "Uber Trip 1234")).await.unwrap();

        let pending = store.pending_transactions().await.unwrap();
        assert_eq!(pending.len(), 1);

        let report = engine.process_pending().await.unwrap();
        assert_eq!(report.auto_completed, 1);
        assert_eq!(report.fallback, 0);

        let record = store.get_transaction("t1").await.unwrap().unwrap();
        assert_eq!(record.category.as_deref(), Some("Transport"));
        assert_eq!(record.status, EnrichmentStatus::Complete);
    }

    #[tokio::test]
    async fn test_confident_classification_completes() {
        let llm = Arc::new(FakeLlm::new());
        llm.push_reply(
            r#"{"category": "Groceries", "confidence": 0.93, "is_ambiguous": false}"#,
        );
        let (engine, store) = engine_with(llm).await;

        store.upsert_transaction(&txn("t1", "Whole Foods")).await.unwrap();

        let report = engine.process_pending().await.unwrap();
        assert_eq!(report.auto_completed, 1);

        let record = store.get_transaction("t1").await.unwrap().unwrap();
        assert_eq!(record.category.as_deref(), Some("Groceries"));
        assert!(record.embedding.is_some());
    }

    #[tokio::test]
    async fn test_confidence_exactly_at_threshold_completes() {
        let llm = Arc::new(FakeLlm::new());
        llm.push_reply(r#"{"category": "Dining", "confidence": 0.80, "is_ambiguous": false}"#);
        let (engine, store) = engine_with(llm).await;

        store.upsert_transaction(&txn("t1", "Cafe Nero")).await.unwrap();
        let report = engine.process_pending().await.unwrap();

        assert_eq!(report.auto_completed, 1);
        assert_eq!(report.needs_user, 0);
        let record = store.get_transaction("t1").await.unwrap().unwrap();
        assert_eq!(record.status, EnrichmentStatus::Complete);
    }

    #[tokio::test]
    async fn test_low_confidence_flags_for_review() {
        let llm = Arc::new(FakeLlm::new());
        llm.push_reply(
            r#"{"category": "Shopping", "confidence": 0.79, "is_ambiguous": false,
                "clarification_question": "Was this groceries or household shopping?",
                "suggested_options": ["Groceries", "Shopping"]}"#,
        );
        let (engine, store) = engine_with(llm).await;

        store.upsert_transaction(&txn("t1", "ACME Store")).await.unwrap();
        let report = engine.process_pending().await.unwrap();

        assert_eq!(report.needs_user, 1);
        let record = store.get_transaction("t1").await.unwrap().unwrap();
        assert_eq!(record.status, EnrichmentStatus::NeedsUser);
        assert_eq!(record.category.as_deref(), Some("Shopping"));
        let clarification = record.clarification.unwrap();
        assert_eq!(clarification.options, vec!["Groceries", "Shopping"]);
    }

    #[tokio::test]
    async fn test_ambiguous_flag_overrides_high_confidence() {
        let llm = Arc::new(FakeLlm::new());
        llm.push_reply(
            r#"{"category": "Dining", "confidence": 0.95, "is_ambiguous": true,
                "clarification_question": "Personal meal or business expense?"}"#,
        );
        let (engine, store) = engine_with(llm).await;

        store.upsert_transaction(&txn("t1", "Steakhouse")).await.unwrap();
        let report = engine.process_pending().await.unwrap();

        assert_eq!(report.needs_user, 1);
        assert_eq!(report.auto_completed, 0);
    }

    #[tokio::test]
    async fn test_malformed_llm_output_falls_back_to_uncategorized() {
        let llm = Arc::new(FakeLlm::new());
        llm.push_reply("I think this is probably transport related.");
        let (engine, store) = engine_with(llm).await;

        store.upsert_transaction(&txn("t1", "Mystery Vendor")).await.unwrap();
        let report = engine.process_pending().await.unwrap();

        assert_eq!(report.fallback, 1);
        let record = store.get_transaction("t1").await.unwrap().unwrap();
        assert_eq!(record.status, EnrichmentStatus::Complete);
        assert_eq!(record.category.as_deref(), Some(UNCATEGORIZED));
    }

    #[tokio::test]
    async fn test_one_bad_record_does_not_stop_the_batch() {
        let llm = Arc::new(FakeLlm::new());
        llm.push_reply("garbage");
        llm.push_reply(r#"{"category": "Transport", "confidence": 0.9, "is_ambiguous": false}"#);
        let (engine, store) = engine_with(llm).await;

        store.upsert_transaction(&txn("t1", "Mystery Vendor")).await.unwrap();
        store.upsert_transaction(&txn("t2", "Lyft Ride")).await.unwrap();

        let report = engine.process_pending().await.unwrap();
        assert_eq!(report.fallback + report.auto_completed, 2);

        // Invariant: nothing PENDING has a category, nothing enriched lacks one.
        for record in store.all_transactions().await.unwrap() {
            match record.status {
                EnrichmentStatus::Pending => assert!(record.category.is_none()),
                _ => assert!(record.category.is_some()),
            }
        }
    }

    #[tokio::test]
    async fn test_embedding_failure_degrades_to_plain_classification() {
        let llm = Arc::new(FakeLlm::new().with_failing_embeddings());
        llm.push_reply(r#"{"category": "Travel", "confidence": 0.88, "is_ambiguous": false}"#);
        let (engine, store) = engine_with(llm).await;

        store.upsert_transaction(&txn("t1", "Delta Airlines")).await.unwrap();
        let report = engine.process_pending().await.unwrap();

        assert_eq!(report.auto_completed, 1);
        let record = store.get_transaction("t1").await.unwrap().unwrap();
        assert!(record.embedding.is_none());
        assert_eq!(record.category.as_deref(), Some("Travel"));
    }

    #[tokio::test]
    async fn test_pending_events_are_confirmed() {
        let llm = Arc::new(FakeLlm::new());
        let (engine, store) = engine_with(llm).await;

        store
            .upsert_event(&crate::store::NewEvent {
                event_id: "ev1".to_string(),
                user_id: "u1".to_string(),
                summary: "Dentist".to_string(),
                start_iso: "2026-08-02T10:00:00Z".to_string(),
                end_iso: None,
                series_id: None,
            })
            .await
            .unwrap();

        let report = engine.process_pending().await.unwrap();
        assert_eq!(report.events_completed, 1);
    }

    #[tokio::test]
    async fn test_feedback_unknown_record_is_noop() {
        let llm = Arc::new(FakeLlm::new());
        let (engine, _store) = engine_with(llm).await;

        let found = engine.apply_feedback("missing", "Transport").await.unwrap();
        assert!(!found);
    }

    #[tokio::test]
    async fn test_reset_and_rerun_reproduces_the_same_state() {
        let llm = Arc::new(FakeLlm::new());
        llm.push_reply(r#"{"category": "Transport", "confidence": 0.9, "is_ambiguous": false}"#);
        llm.push_reply(r#"{"category": "Transport", "confidence": 0.9, "is_ambiguous": false}"#);
        let (engine, store) = engine_with(llm).await;

        store.upsert_transaction(&txn("t1", "Uber")).await.unwrap();
        engine.process_pending().await.unwrap();
        let first = store.get_transaction("t1").await.unwrap().unwrap();

        store.reset_enrichment().await.unwrap();
        let report = engine.process_pending().await.unwrap();
        let second = store.get_transaction("t1").await.unwrap().unwrap();

        assert_eq!(report.auto_completed, 1);
        assert_eq!(first.category, second.category);
        assert_eq!(first.status, second.status);
    }

    #[tokio::test]
    async fn test_rerun_after_completion_is_empty_pass() {
        let llm = Arc::new(FakeLlm::new());
        llm.push_reply(r#"{"category": "Transport", "confidence": 0.9, "is_ambiguous": false}"#);
        let (engine, store) = engine_with(llm).await;

        store.upsert_transaction(&txn("t1", "Uber")).await.unwrap();
        engine.process_pending().await.unwrap();

        let second = engine.process_pending().await.unwrap();
        assert_eq!(second.auto_completed, 0);
        assert_eq!(second.fallback, 0);
    }
}
